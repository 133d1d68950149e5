//! Retry scheduling and the skip rule. Everything here is pure so the policy
//! can be exercised without a database.

use serde_json::Value;

use crate::{
    models::{DocumentJob, Insight},
    normalize::DocumentKind,
};

use super::{INSIGHT_STATUS_SUCCESS, STAGE_SUCCEEDED};

pub const MAX_ATTEMPTS: i32 = 5;
pub const BASE_DELAY_MS: u64 = 1000;
pub const MAX_DELAY_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay_ms: BASE_DELAY_MS,
            max_delay_ms: MAX_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Failed { delay_ms: u64 },
    DeadLetter { delay_ms: u64 },
}

impl RetryOutcome {
    pub fn delay_ms(&self) -> u64 {
        match self {
            RetryOutcome::Failed { delay_ms } | RetryOutcome::DeadLetter { delay_ms } => *delay_ms,
        }
    }

    pub fn is_dead_letter(&self) -> bool {
        matches!(self, RetryOutcome::DeadLetter { .. })
    }
}

impl RetryPolicy {
    /// Doubles from `base_delay_ms` on the first failed attempt, capped at
    /// `max_delay_ms`.
    pub fn backoff_delay(&self, attempt: i32) -> u64 {
        let exponent = attempt.saturating_sub(1).clamp(0, 32) as u32;
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent))
            .min(self.max_delay_ms)
    }

    /// `attempt` is the number of failed attempts including the one just
    /// recorded.
    pub fn outcome(&self, attempt: i32) -> RetryOutcome {
        if attempt >= self.max_attempts {
            RetryOutcome::DeadLetter { delay_ms: 0 }
        } else {
            RetryOutcome::Failed {
                delay_ms: self.backoff_delay(attempt),
            }
        }
    }
}

pub fn calculate_backoff_delay(attempt: i32) -> u64 {
    RetryPolicy::default().backoff_delay(attempt)
}

pub fn determine_retry_outcome(attempt: i32) -> RetryOutcome {
    RetryPolicy::default().outcome(attempt)
}

/// A job may skip reprocessing only when its previous run finished and the
/// stored insight is complete. A finished job pointing at an incomplete
/// insight is repaired instead.
pub fn is_skippable(job: &DocumentJob, insight: Option<&Insight>) -> bool {
    if job.process_state != STAGE_SUCCEEDED {
        return false;
    }
    let Some(insight) = insight else {
        return false;
    };

    insight.status == INSIGHT_STATUS_SUCCESS
        && insight.document_month.is_some()
        && has_required_metrics(insight)
}

pub fn has_required_metrics(insight: &Insight) -> bool {
    let Some(kind) = DocumentKind::from_catalogue_key(&insight.catalogue_key) else {
        return false;
    };
    let fields = kind.required_metric_fields();

    let typed = insight
        .metrics_v1
        .as_ref()
        .is_some_and(|metrics| fields.iter().all(|(key, _)| is_number(metrics, key)));
    let legacy = insight
        .metrics
        .as_ref()
        .is_some_and(|metrics| fields.iter().all(|(_, key)| is_number(metrics, key)));

    typed || legacy
}

fn is_number(metrics: &Value, key: &str) -> bool {
    metrics.get(key).is_some_and(Value::is_number)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::jobs::{CANDIDATE_PAYSLIP, STATUS_IN_PROGRESS};

    #[test]
    fn backoff_doubles_then_caps() {
        let delays: Vec<u64> = (1..=4).map(calculate_backoff_delay).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000]);
        assert_eq!(calculate_backoff_delay(10), 30_000);
        assert_eq!(calculate_backoff_delay(64), 30_000);
    }

    #[test]
    fn outcome_is_failed_below_ceiling_and_dead_letter_at_it() {
        for attempt in 1..MAX_ATTEMPTS {
            let outcome = determine_retry_outcome(attempt);
            assert_eq!(
                outcome,
                RetryOutcome::Failed {
                    delay_ms: calculate_backoff_delay(attempt)
                }
            );
            assert!(outcome.delay_ms() > 0);
        }
        assert_eq!(
            determine_retry_outcome(MAX_ATTEMPTS),
            RetryOutcome::DeadLetter { delay_ms: 0 }
        );
        assert!(determine_retry_outcome(MAX_ATTEMPTS + 3).is_dead_letter());
    }

    #[test]
    fn custom_policy_respects_its_own_ceiling() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 500,
            max_delay_ms: 600,
        };
        assert_eq!(policy.outcome(1), RetryOutcome::Failed { delay_ms: 500 });
        assert_eq!(policy.outcome(2), RetryOutcome::DeadLetter { delay_ms: 0 });
        assert_eq!(policy.backoff_delay(3), 600);
    }

    fn job(process_state: &str) -> DocumentJob {
        let now = Utc::now().naive_utc();
        DocumentJob {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            file_id: Uuid::new_v4(),
            storage_key: "uploads/a.pdf".into(),
            original_name: "a.pdf".into(),
            content_type: Some("application/pdf".into()),
            content_hash: "00".repeat(32),
            candidate_type: CANDIDATE_PAYSLIP.into(),
            status: STATUS_IN_PROGRESS.into(),
            upload_state: STAGE_SUCCEEDED.into(),
            process_state: process_state.into(),
            attempts: 0,
            retry_at: now,
            last_error_code: None,
            last_error_message: None,
            provider_document_id: None,
            provider_job_id: None,
            schema_version: None,
            parser_version: None,
            prompt_version: None,
            model: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn insight(month: Option<&str>, metrics_v1: Option<Value>, metrics: Option<Value>) -> Insight {
        let now = Utc::now().naive_utc();
        Insight {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            file_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            catalogue_key: "payslip".into(),
            document_date: month.map(|m| format!("{m}-28")),
            document_month: month.map(str::to_string),
            metrics,
            metrics_v1,
            transactions: None,
            status: INSIGHT_STATUS_SUCCESS.into(),
            status_reason: None,
            schema_version: "v1".into(),
            content_hash: "ab".repeat(32),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn complete_insight_of_finished_job_is_skippable() {
        let record = insight(Some("2024-03"), Some(json!({ "net_pay": 150000 })), None);
        assert!(is_skippable(&job(STAGE_SUCCEEDED), Some(&record)));
    }

    #[test]
    fn legacy_metrics_alone_satisfy_the_required_fields() {
        let record = insight(Some("2024-03"), None, Some(json!({ "netPay": 150000 })));
        assert!(is_skippable(&job(STAGE_SUCCEEDED), Some(&record)));
    }

    #[test]
    fn missing_month_is_not_skippable() {
        let record = insight(None, Some(json!({ "net_pay": 150000 })), None);
        assert!(!is_skippable(&job(STAGE_SUCCEEDED), Some(&record)));
    }

    #[test]
    fn null_required_metrics_are_not_skippable() {
        let record = insight(
            Some("2024-03"),
            Some(json!({ "net_pay": null })),
            Some(json!({ "grossPay": 1 })),
        );
        assert!(!is_skippable(&job(STAGE_SUCCEEDED), Some(&record)));
    }

    #[test]
    fn failed_insight_or_unfinished_job_is_not_skippable() {
        let mut record = insight(Some("2024-03"), Some(json!({ "net_pay": 1 })), None);
        assert!(!is_skippable(&job("failed"), Some(&record)));
        assert!(!is_skippable(&job(STAGE_SUCCEEDED), None));

        record.status = "failed".into();
        assert!(!is_skippable(&job(STAGE_SUCCEEDED), Some(&record)));
    }

    #[test]
    fn statement_requires_both_totals() {
        let mut record = insight(Some("2024-03"), Some(json!({ "total_inflow": 10 })), None);
        record.catalogue_key = "bank_statement".into();
        assert!(!has_required_metrics(&record));

        record.metrics_v1 = Some(json!({ "total_inflow": 10, "total_outflow": 0 }));
        assert!(has_required_metrics(&record));
    }
}
