use chrono::Utc;
use diesel::prelude::*;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    jobs::{policy::has_required_metrics, INSIGHT_STATUS_SUCCESS},
    models::{DocumentJob, Insight, NewInsight},
    normalize::{DocumentKind, PayslipMetricsV1, StatementMetricsV1, SCHEMA_VERSION},
    schema::insights,
};

/// A normalized extraction ready to be written as an insight row.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedInsight {
    pub user_id: Uuid,
    pub file_id: Uuid,
    pub job_id: Uuid,
    pub kind: DocumentKind,
    pub document_date: Option<String>,
    pub document_month: Option<String>,
    pub metrics: Value,
    pub metrics_v1: Value,
    pub transactions: Option<Value>,
    pub content_hash: String,
}

impl PreparedInsight {
    pub fn from_payslip(
        job: &DocumentJob,
        metrics: &PayslipMetricsV1,
        content_hash: String,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            user_id: job.user_id,
            file_id: job.file_id,
            job_id: job.id,
            kind: DocumentKind::Payslip,
            document_date: Some(metrics.pay_date.clone()),
            document_month: Some(metrics.period_month.clone()),
            metrics: metrics.summary(),
            metrics_v1: serde_json::to_value(metrics)?,
            transactions: None,
            content_hash,
        })
    }

    pub fn from_statement(
        job: &DocumentJob,
        metrics: &StatementMetricsV1,
        content_hash: String,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            user_id: job.user_id,
            file_id: job.file_id,
            job_id: job.id,
            kind: DocumentKind::BankStatement,
            document_date: Some(metrics.period_end.clone()),
            document_month: Some(metrics.period_month.clone()),
            metrics: metrics.summary(),
            metrics_v1: serde_json::to_value(metrics)?,
            transactions: metrics.transactions_json(),
            content_hash,
        })
    }

    fn to_new_insight(&self) -> NewInsight {
        NewInsight {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            file_id: self.file_id,
            job_id: self.job_id,
            catalogue_key: self.kind.catalogue_key().to_string(),
            document_date: self.document_date.clone(),
            document_month: self.document_month.clone(),
            metrics: Some(self.metrics.clone()),
            metrics_v1: Some(self.metrics_v1.clone()),
            transactions: self.transactions.clone(),
            status: INSIGHT_STATUS_SUCCESS.to_string(),
            status_reason: None,
            schema_version: SCHEMA_VERSION.to_string(),
            content_hash: self.content_hash.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SaveOutcome {
    Inserted(Insight),
    /// An earlier incomplete row for the same content was overwritten.
    Repaired(Insight),
    /// A complete row for the same content already exists.
    Unchanged(Insight),
}

impl SaveOutcome {
    pub fn insight(&self) -> &Insight {
        match self {
            SaveOutcome::Inserted(insight)
            | SaveOutcome::Repaired(insight)
            | SaveOutcome::Unchanged(insight) => insight,
        }
    }
}

fn is_complete(insight: &Insight) -> bool {
    insight.status == INSIGHT_STATUS_SUCCESS
        && insight.document_month.is_some()
        && has_required_metrics(insight)
}

/// Writes the insight once per `(user, file, schema version, content hash)`.
pub fn save_insight(conn: &mut PgConnection, prepared: &PreparedInsight) -> QueryResult<SaveOutcome> {
    conn.transaction(|conn| {
        let existing: Option<Insight> = insights::table
            .filter(insights::user_id.eq(prepared.user_id))
            .filter(insights::file_id.eq(prepared.file_id))
            .filter(insights::schema_version.eq(SCHEMA_VERSION))
            .filter(insights::content_hash.eq(&prepared.content_hash))
            .for_update()
            .first(conn)
            .optional()?;

        match existing {
            Some(row) if is_complete(&row) => Ok(SaveOutcome::Unchanged(row)),
            Some(row) => {
                let repaired = diesel::update(insights::table.find(row.id))
                    .set((
                        insights::job_id.eq(prepared.job_id),
                        insights::catalogue_key.eq(prepared.kind.catalogue_key()),
                        insights::document_date.eq(&prepared.document_date),
                        insights::document_month.eq(&prepared.document_month),
                        insights::metrics.eq(Some(prepared.metrics.clone())),
                        insights::metrics_v1.eq(Some(prepared.metrics_v1.clone())),
                        insights::transactions.eq(&prepared.transactions),
                        insights::status.eq(INSIGHT_STATUS_SUCCESS),
                        insights::status_reason.eq(None::<String>),
                        insights::updated_at.eq(Utc::now().naive_utc()),
                    ))
                    .get_result(conn)?;
                Ok(SaveOutcome::Repaired(repaired))
            }
            None => {
                let inserted = diesel::insert_into(insights::table)
                    .values(&prepared.to_new_insight())
                    .on_conflict((
                        insights::user_id,
                        insights::file_id,
                        insights::schema_version,
                        insights::content_hash,
                    ))
                    .do_nothing()
                    .get_result::<Insight>(conn)
                    .optional()?;

                match inserted {
                    Some(row) => Ok(SaveOutcome::Inserted(row)),
                    None => {
                        let row = insights::table
                            .filter(insights::user_id.eq(prepared.user_id))
                            .filter(insights::file_id.eq(prepared.file_id))
                            .filter(insights::schema_version.eq(SCHEMA_VERSION))
                            .filter(insights::content_hash.eq(&prepared.content_hash))
                            .first(conn)?;
                        Ok(SaveOutcome::Unchanged(row))
                    }
                }
            }
        }
    })
}

/// Most recently written insight for a file, whatever its content hash.
pub fn latest_insight(
    conn: &mut PgConnection,
    user_id: Uuid,
    file_id: Uuid,
) -> QueryResult<Option<Insight>> {
    insights::table
        .filter(insights::user_id.eq(user_id))
        .filter(insights::file_id.eq(file_id))
        .order(insights::updated_at.desc())
        .first(conn)
        .optional()
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDateTime;
    use serde_json::json;

    use super::*;
    use crate::normalize::payslip::PayslipYtd;

    fn job() -> DocumentJob {
        let at = NaiveDateTime::default();
        DocumentJob {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            file_id: Uuid::new_v4(),
            storage_key: "uploads/a/b/payslip.pdf".into(),
            original_name: "payslip.pdf".into(),
            content_type: Some("application/pdf".into()),
            content_hash: "00".into(),
            candidate_type: "payslip".into(),
            status: "in_progress".into(),
            upload_state: "succeeded".into(),
            process_state: "in_progress".into(),
            attempts: 0,
            retry_at: at,
            last_error_code: None,
            last_error_message: None,
            provider_document_id: None,
            provider_job_id: None,
            schema_version: None,
            parser_version: None,
            prompt_version: None,
            model: None,
            created_at: at,
            updated_at: at,
        }
    }

    fn insight_from(prepared: &PreparedInsight, status: &str) -> Insight {
        let row = prepared.to_new_insight();
        Insight {
            id: row.id,
            user_id: row.user_id,
            file_id: row.file_id,
            job_id: row.job_id,
            catalogue_key: row.catalogue_key,
            document_date: row.document_date,
            document_month: row.document_month,
            metrics: row.metrics,
            metrics_v1: row.metrics_v1,
            transactions: row.transactions,
            status: status.to_string(),
            status_reason: None,
            schema_version: row.schema_version,
            content_hash: row.content_hash,
            created_at: NaiveDateTime::default(),
            updated_at: NaiveDateTime::default(),
        }
    }

    fn payslip() -> PayslipMetricsV1 {
        PayslipMetricsV1 {
            employer: Some("Acme Widgets".into()),
            pay_date: "2024-03-28".into(),
            period_month: "2024-03".into(),
            pay_frequency: Some("monthly".into()),
            gross_pay: Some(325_000),
            net_pay: Some(251_000),
            tax: 45_000,
            national_insurance: 20_000,
            pension: 9_000,
            student_loan: 0,
            other_deductions: 0,
            tax_code: Some("1257L".into()),
            ni_number_masked: None,
            ni_number_hash: None,
            ytd: PayslipYtd::default(),
        }
    }

    #[test]
    fn payslip_rows_carry_both_metric_shapes() {
        let prepared = PreparedInsight::from_payslip(&job(), &payslip(), "abc".into()).unwrap();
        assert_eq!(prepared.document_month.as_deref(), Some("2024-03"));
        assert_eq!(prepared.metrics["netPay"], json!(251_000));
        assert_eq!(prepared.metrics_v1["net_pay"], json!(251_000));
        assert!(prepared.transactions.is_none());
        assert!(is_complete(&insight_from(&prepared, INSIGHT_STATUS_SUCCESS)));
    }

    #[test]
    fn failed_rows_are_not_complete() {
        let prepared = PreparedInsight::from_payslip(&job(), &payslip(), "abc".into()).unwrap();
        assert!(!is_complete(&insight_from(&prepared, "failed")));
    }
}
