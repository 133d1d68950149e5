use chrono::NaiveDateTime;
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = document_jobs)]
pub struct DocumentJob {
    pub id: Uuid,
    pub user_id: Uuid,
    pub file_id: Uuid,
    pub storage_key: String,
    pub original_name: String,
    pub content_type: Option<String>,
    pub content_hash: String,
    pub candidate_type: String,
    pub status: String,
    pub upload_state: String,
    pub process_state: String,
    pub attempts: i32,
    pub retry_at: NaiveDateTime,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub provider_document_id: Option<String>,
    pub provider_job_id: Option<String>,
    pub schema_version: Option<String>,
    pub parser_version: Option<String>,
    pub prompt_version: Option<String>,
    pub model: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = document_jobs)]
pub struct NewDocumentJob {
    pub id: Uuid,
    pub user_id: Uuid,
    pub file_id: Uuid,
    pub storage_key: String,
    pub original_name: String,
    pub content_type: Option<String>,
    pub content_hash: String,
    pub candidate_type: String,
    pub status: String,
    pub upload_state: String,
    pub process_state: String,
    pub retry_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = insights)]
#[diesel(belongs_to(DocumentJob, foreign_key = job_id))]
pub struct Insight {
    pub id: Uuid,
    pub user_id: Uuid,
    pub file_id: Uuid,
    pub job_id: Uuid,
    pub catalogue_key: String,
    pub document_date: Option<String>,
    pub document_month: Option<String>,
    pub metrics: Option<serde_json::Value>,
    pub metrics_v1: Option<serde_json::Value>,
    pub transactions: Option<serde_json::Value>,
    pub status: String,
    pub status_reason: Option<String>,
    pub schema_version: String,
    pub content_hash: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = insights)]
pub struct NewInsight {
    pub id: Uuid,
    pub user_id: Uuid,
    pub file_id: Uuid,
    pub job_id: Uuid,
    pub catalogue_key: String,
    pub document_date: Option<String>,
    pub document_month: Option<String>,
    pub metrics: Option<serde_json::Value>,
    pub metrics_v1: Option<serde_json::Value>,
    pub transactions: Option<serde_json::Value>,
    pub status: String,
    pub status_reason: Option<String>,
    pub schema_version: String,
    pub content_hash: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = accounts)]
pub struct Account {
    pub id: Uuid,
    pub user_id: Uuid,
    pub institution_name: String,
    pub account_number_masked: String,
    pub account_type: String,
    pub raw_institution_names: Vec<String>,
    pub fingerprints: Vec<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = accounts)]
pub struct NewAccount {
    pub id: Uuid,
    pub user_id: Uuid,
    pub institution_name: String,
    pub account_number_masked: String,
    pub account_type: String,
    pub raw_institution_names: Vec<String>,
    pub fingerprints: Vec<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = analytics_snapshots)]
pub struct AnalyticsSnapshot {
    pub id: Uuid,
    pub user_id: Uuid,
    pub period: String,
    pub status: String,
    pub status_reason: Option<String>,
    pub totals: serde_json::Value,
    pub source_insight_ids: Vec<Uuid>,
    pub insight_count: i32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = analytics_snapshots)]
pub struct NewAnalyticsSnapshot {
    pub id: Uuid,
    pub user_id: Uuid,
    pub period: String,
    pub status: String,
    pub status_reason: Option<String>,
    pub totals: serde_json::Value,
    pub source_insight_ids: Vec<Uuid>,
    pub insight_count: i32,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = dead_letters)]
#[diesel(belongs_to(DocumentJob, foreign_key = job_id))]
pub struct DeadLetter {
    pub id: Uuid,
    pub user_id: Uuid,
    pub file_id: Uuid,
    pub job_id: Uuid,
    pub reason: String,
    pub details: serde_json::Value,
    pub resolved_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = dead_letters)]
pub struct NewDeadLetter {
    pub id: Uuid,
    pub user_id: Uuid,
    pub file_id: Uuid,
    pub job_id: Uuid,
    pub reason: String,
    pub details: serde_json::Value,
}
