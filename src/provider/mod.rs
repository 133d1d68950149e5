//! Extraction provider contract.
//!
//! The provider accepts a document, runs an asynchronous extraction job and
//! exposes the result as a JSON document. Its payload shape varies (sometimes
//! wrapped in a `standardizations` envelope); [`DocumentEnvelope`] resolves
//! that once so the rest of the crate only sees [`ProviderDocument`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub mod client;
pub mod poll;

pub use client::HttpExtractionProvider;
pub use poll::{fetch_result, next_poll_delay, poll_job, PollOptions};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider returned status {status}: {body}")]
    Http { status: u16, body: String },

    #[error("provider resource not found: {body}")]
    NotFound { body: String },

    #[error("provider rejected document with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("provider request failed: {0}")]
    Network(String),

    #[error("provider job {job_id} did not complete within {elapsed_ms}ms")]
    Timeout { job_id: String, elapsed_ms: u64 },

    #[error("provider job {job_id} failed: {detail}")]
    JobFailed { job_id: String, detail: String },

    #[error("unexpected provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::Rejected { .. })
    }

    pub fn details(&self) -> Value {
        match self {
            ProviderError::Http { status, body } | ProviderError::Rejected { status, body } => {
                json!({ "status": status, "body": body })
            }
            ProviderError::NotFound { body } => json!({ "status": 404, "body": body }),
            ProviderError::Timeout { job_id, elapsed_ms } => {
                json!({ "provider_job_id": job_id, "elapsed_ms": elapsed_ms })
            }
            ProviderError::JobFailed { job_id, detail } => {
                json!({ "provider_job_id": job_id, "detail": detail })
            }
            ProviderError::Network(message) | ProviderError::Decode(message) => {
                json!({ "message": message })
            }
        }
    }
}

pub enum SubmitSource {
    Inline {
        filename: String,
        content_type: Option<String>,
        bytes: Vec<u8>,
    },
    Url {
        filename: String,
        url: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub document_id: String,
    pub job_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderJobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderJob {
    pub status: ProviderJobStatus,
    #[serde(default)]
    pub document_id: Option<String>,
    #[serde(default)]
    pub error: Option<Value>,
}

/// Raw body of `GET /document/{id}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DocumentEnvelope {
    Standardized { standardizations: Vec<Value> },
    Bare(Value),
}

/// The one canonical shape the normalizers consume.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderDocument {
    pub document_type: Option<String>,
    pub data: Value,
}

impl DocumentEnvelope {
    pub fn into_document(self) -> Result<ProviderDocument, ProviderError> {
        let entry = match self {
            DocumentEnvelope::Standardized { standardizations } => standardizations
                .into_iter()
                .next()
                .ok_or_else(|| ProviderError::Decode("empty standardizations envelope".into()))?,
            DocumentEnvelope::Bare(value) => value,
        };

        if !entry.is_object() {
            return Err(ProviderError::Decode(format!(
                "document payload is not an object: {entry}"
            )));
        }

        let document_type = ["type", "documentType", "document_type"]
            .iter()
            .find_map(|key| entry.get(key).and_then(Value::as_str))
            .map(str::to_string);

        let nested = entry.get("data").filter(|inner| inner.is_object()).cloned();
        let data = nested.unwrap_or(entry);

        Ok(ProviderDocument {
            document_type,
            data,
        })
    }
}

#[async_trait]
pub trait ExtractionProvider: Send + Sync + 'static {
    async fn submit(
        &self,
        workflow_id: &str,
        source: SubmitSource,
    ) -> Result<SubmitReceipt, ProviderError>;

    async fn job_status(&self, job_id: &str) -> Result<ProviderJob, ProviderError>;

    async fn fetch_document(&self, document_id: &str) -> Result<DocumentEnvelope, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwraps_first_standardization() {
        let envelope: DocumentEnvelope = serde_json::from_value(json!({
            "standardizations": [
                { "type": "payslip", "data": { "netPay": 1500.0 } },
                { "type": "payslip", "data": { "netPay": 1.0 } }
            ]
        }))
        .unwrap();
        let document = envelope.into_document().unwrap();
        assert_eq!(document.document_type.as_deref(), Some("payslip"));
        assert_eq!(document.data, json!({ "netPay": 1500.0 }));
    }

    #[test]
    fn bare_payload_is_used_as_is() {
        let envelope: DocumentEnvelope =
            serde_json::from_value(json!({ "payDate": "2024-03-28" })).unwrap();
        let document = envelope.into_document().unwrap();
        assert_eq!(document.document_type, None);
        assert_eq!(document.data["payDate"], "2024-03-28");
    }

    #[test]
    fn empty_standardizations_is_a_decode_error() {
        let envelope: DocumentEnvelope =
            serde_json::from_value(json!({ "standardizations": [] })).unwrap();
        assert!(matches!(
            envelope.into_document(),
            Err(ProviderError::Decode(_))
        ));
    }

    #[test]
    fn only_rejections_are_permanent() {
        assert!(!ProviderError::Rejected {
            status: 415,
            body: String::new()
        }
        .is_retryable());
        assert!(ProviderError::NotFound {
            body: String::new()
        }
        .is_retryable());
        assert!(ProviderError::Network("reset".into()).is_retryable());
    }
}
