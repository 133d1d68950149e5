//! Provider payload → versioned canonical metrics.
//!
//! Amounts are integer minor units (`round(major * 100)`), dates are ISO
//! strings, and absent optional fields stay `None`. Normalizers never fail on
//! a missing mandatory field; they return [`Normalized::Incomplete`] and leave
//! the retry decision to the job loop.

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{canonical::Pepper, config::AppConfig, utils::json::canonical_json};

pub mod payslip;
pub mod statement;

pub use payslip::{normalize_payslip, PayslipMetricsV1};
pub use statement::{normalize_statement, StatementMetricsV1, StatementTransaction};

pub const SCHEMA_VERSION: &str = "v1";
pub const PARSER_VERSION: &str = "2024.06.1";

pub const CATALOGUE_PAYSLIP: &str = "payslip";
pub const CATALOGUE_BANK_STATEMENT: &str = "bank_statement";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Payslip,
    BankStatement,
}

impl DocumentKind {
    pub fn catalogue_key(&self) -> &'static str {
        match self {
            DocumentKind::Payslip => CATALOGUE_PAYSLIP,
            DocumentKind::BankStatement => CATALOGUE_BANK_STATEMENT,
        }
    }

    pub fn from_catalogue_key(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "payslip" | "pay_slip" | "payslips" => Some(DocumentKind::Payslip),
            "bank_statement" | "bankstatement" | "statement" | "bank-statement" => {
                Some(DocumentKind::BankStatement)
            }
            _ => None,
        }
    }

    /// Fields that must be non-null in stored metrics for an insight to count
    /// as complete. Each entry pairs the `metrics_v1` key with the legacy
    /// `metrics` key.
    pub fn required_metric_fields(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            DocumentKind::Payslip => &[("net_pay", "netPay")],
            DocumentKind::BankStatement => &[("total_inflow", "totalIn"), ("total_outflow", "totalOut")],
        }
    }
}

/// Pins which extraction configuration produced a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineVersion {
    pub schema_version: String,
    pub parser_version: String,
    pub prompt_version: String,
    pub model: String,
}

impl PipelineVersion {
    pub fn new(prompt_version: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            parser_version: PARSER_VERSION.to_string(),
            prompt_version: prompt_version.into(),
            model: model.into(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(&config.provider_prompt_version, &config.provider_model)
    }
}

pub struct NormalizeContext<'a> {
    pub pepper: &'a Pepper,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized<T> {
    Complete(T),
    Incomplete { missing: Vec<&'static str> },
}

impl<T> Normalized<T> {
    pub fn complete(self) -> Option<T> {
        match self {
            Normalized::Complete(metrics) => Some(metrics),
            Normalized::Incomplete { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IssueKind {
    Invalid,
    BalanceMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub field: &'static str,
    pub kind: IssueKind,
    pub message: String,
}

impl ValidationIssue {
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            kind: IssueKind::Invalid,
            message: message.into(),
        }
    }
}

pub fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|issue| format!("{}: {}", issue.field, issue.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Converts a major-unit amount into minor units. Accepts JSON numbers and
/// strings such as `"£1,234.56"`, `"(12.00)"` or `"12.00-"`.
pub fn to_minor_units(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_f64().map(major_to_minor),
        Value::String(text) => parse_money(text),
        _ => None,
    }
}

fn major_to_minor(major: f64) -> i64 {
    (major * 100.0).round() as i64
}

fn parse_money(text: &str) -> Option<i64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut negative = false;
    let mut body = trimmed;
    if body.starts_with('(') && body.ends_with(')') {
        negative = true;
        body = &body[1..body.len() - 1];
    }
    if let Some(stripped) = body.strip_suffix('-') {
        negative = true;
        body = stripped;
    }
    if let Some(stripped) = body.strip_suffix("CR") {
        body = stripped;
    } else if let Some(stripped) = body.strip_suffix("DR") {
        negative = true;
        body = stripped;
    }

    let cleaned: String = body
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let major: f64 = cleaned.parse().ok()?;
    let minor = major_to_minor(major);
    Some(if negative { -minor.abs() } else { minor })
}

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%Y/%m/%d", "%d %b %Y", "%d %B %Y", "%b %d, %Y",
    "%B %d, %Y", "%d %b %y",
];

pub fn parse_date(value: &Value) -> Option<NaiveDate> {
    let text = value.as_str()?.trim();
    if text.is_empty() {
        return None;
    }

    if let Some(date) = DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
    {
        return Some(date);
    }

    if let Ok(datetime) = chrono::DateTime::parse_from_rfc3339(text) {
        return Some(datetime.date_naive());
    }

    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|datetime| datetime.date())
}

pub fn iso_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn iso_month(date: NaiveDate) -> String {
    format!("{:04}-{:02}", date.year(), date.month())
}

/// Idempotency key for an extraction result: SHA-256 over the key-sorted
/// provider payload followed by the pinned version triple.
pub fn content_hash(payload: &Value, version: &PipelineVersion) -> String {
    let canonical = canonical_json(payload);
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    for part in [
        &version.schema_version,
        &version.parser_version,
        &version.prompt_version,
        &version.model,
    ] {
        hasher.update(b"\x1f");
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}
