use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt::{self, Display};
use thiserror::Error;

use crate::{provider::ProviderError, reconcile::ReconcileError};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal<E: Display>(error: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.status)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
        });
        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl From<diesel::result::Error> for AppError {
    fn from(value: diesel::result::Error) -> Self {
        AppError::internal(value)
    }
}

/// Stable machine-readable failure codes written to `document_jobs.last_error_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ProviderTimeout,
    ProviderError,
    ProviderRejected,
    IncompleteExtraction,
    InvalidExtraction,
    BalanceMismatch,
    IdentityResolutionFailed,
    IdentityConflict,
    AnalyticsGuard,
    CorruptFile,
    UnsupportedDocument,
    Storage,
    Database,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ProviderTimeout => "provider-timeout",
            ErrorCode::ProviderError => "provider-error",
            ErrorCode::ProviderRejected => "provider-rejected",
            ErrorCode::IncompleteExtraction => "incomplete-extraction",
            ErrorCode::InvalidExtraction => "invalid-extraction",
            ErrorCode::BalanceMismatch => "balance-mismatch",
            ErrorCode::IdentityResolutionFailed => "identity-resolution-failed",
            ErrorCode::IdentityConflict => "identity-conflict",
            ErrorCode::AnalyticsGuard => "analytics-guard",
            ErrorCode::CorruptFile => "corrupt-file",
            ErrorCode::UnsupportedDocument => "unsupported-document",
            ErrorCode::Storage => "storage-error",
            ErrorCode::Database => "database-error",
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything that can go wrong while processing a single document job.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("incomplete extraction: missing {}", .missing.join(", "))]
    IncompleteExtraction { missing: Vec<String> },

    #[error("extraction failed validation: {0}")]
    InvalidExtraction(String),

    #[error("statement balance mismatch: expected closing {expected}, computed {computed}")]
    BalanceMismatch { expected: i64, computed: i64 },

    #[error("identity resolution failed: {0}")]
    IdentityResolution(String),

    #[error(transparent)]
    IdentityConflict(#[from] ReconcileError),

    #[error("analytics rebuild failed: {0}")]
    AnalyticsGuard(String),

    #[error("corrupt file: {0}")]
    CorruptFile(String),

    #[error("unsupported document type: {0}")]
    UnsupportedDocument(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(String),
}

impl PipelineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PipelineError::Provider(ProviderError::Timeout { .. }) => ErrorCode::ProviderTimeout,
            PipelineError::Provider(ProviderError::Rejected { .. }) => ErrorCode::ProviderRejected,
            PipelineError::Provider(_) => ErrorCode::ProviderError,
            PipelineError::IncompleteExtraction { .. } => ErrorCode::IncompleteExtraction,
            PipelineError::InvalidExtraction(_) => ErrorCode::InvalidExtraction,
            PipelineError::BalanceMismatch { .. } => ErrorCode::BalanceMismatch,
            PipelineError::IdentityResolution(_) => ErrorCode::IdentityResolutionFailed,
            PipelineError::IdentityConflict(_) => ErrorCode::IdentityConflict,
            PipelineError::AnalyticsGuard(_) => ErrorCode::AnalyticsGuard,
            PipelineError::CorruptFile(_) => ErrorCode::CorruptFile,
            PipelineError::UnsupportedDocument(_) => ErrorCode::UnsupportedDocument,
            PipelineError::Storage(_) => ErrorCode::Storage,
            PipelineError::Database(_) => ErrorCode::Database,
        }
    }

    /// Permanent input errors are rejected without consuming retry budget.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Provider(err) => err.is_retryable(),
            PipelineError::CorruptFile(_) | PipelineError::UnsupportedDocument(_) => false,
            _ => true,
        }
    }

    /// Diagnostic payload stored next to the failure for operators.
    pub fn details(&self) -> Value {
        match self {
            PipelineError::Provider(err) => err.details(),
            PipelineError::IncompleteExtraction { missing } => json!({ "missing": missing }),
            PipelineError::BalanceMismatch { expected, computed } => {
                json!({ "expected_closing": expected, "computed_closing": computed })
            }
            _ => json!({}),
        }
    }
}

impl From<diesel::result::Error> for PipelineError {
    fn from(value: diesel::result::Error) -> Self {
        PipelineError::Database(value.to_string())
    }
}
