use std::time::Duration;

use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    dead_letters::{self, DeadLetterReason},
    error::{ErrorCode, PipelineError},
    models::{DocumentJob, NewDocumentJob},
    normalize::PipelineVersion,
    schema::document_jobs,
};

pub mod policy;

pub use policy::{
    calculate_backoff_delay, determine_retry_outcome, is_skippable, RetryOutcome, RetryPolicy,
};

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_IN_PROGRESS: &str = "in_progress";
pub const STATUS_SUCCEEDED: &str = "succeeded";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_REJECTED: &str = "rejected";
pub const STATUS_DEAD_LETTER: &str = "dead_letter";

/// Values for `upload_state` and `process_state`.
pub const STAGE_PENDING: &str = "pending";
pub const STAGE_IN_PROGRESS: &str = "in_progress";
pub const STAGE_SUCCEEDED: &str = "succeeded";
pub const STAGE_FAILED: &str = "failed";

pub const CANDIDATE_PAYSLIP: &str = "payslip";
pub const CANDIDATE_BANK_STATEMENT: &str = "bank_statement";
pub const CANDIDATE_UNKNOWN: &str = "unknown";

pub const INSIGHT_STATUS_SUCCESS: &str = "success";
pub const INSIGHT_STATUS_FAILED: &str = "failed";


#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("job {0} not found")]
    NotFound(Uuid),
}

pub type JobQueueResult<T> = Result<T, JobQueueError>;

impl From<JobQueueError> for PipelineError {
    fn from(err: JobQueueError) -> Self {
        match err {
            JobQueueError::Database(inner) => PipelineError::from(inner),
            other => PipelineError::Database(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewUpload {
    pub user_id: Uuid,
    pub file_id: Uuid,
    pub storage_key: String,
    pub original_name: String,
    pub content_type: Option<String>,
    pub content_hash: String,
    pub candidate_type: String,
}

/// What gets persisted about a failed attempt.
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
}

impl From<&PipelineError> for JobFailure {
    fn from(err: &PipelineError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            details: err.details(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedFailure {
    pub attempts: i32,
    pub outcome: RetryOutcome,
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// Creates the job for an accepted upload. Uploading the same file twice
/// returns the existing job untouched.
pub fn register_upload(conn: &mut PgConnection, upload: NewUpload) -> JobQueueResult<DocumentJob> {
    let new_job = NewDocumentJob {
        id: Uuid::new_v4(),
        user_id: upload.user_id,
        file_id: upload.file_id,
        storage_key: upload.storage_key,
        original_name: upload.original_name,
        content_type: upload.content_type,
        content_hash: upload.content_hash,
        candidate_type: upload.candidate_type,
        status: STATUS_PENDING.to_string(),
        upload_state: STAGE_PENDING.to_string(),
        process_state: STAGE_PENDING.to_string(),
        retry_at: now(),
    };

    diesel::insert_into(document_jobs::table)
        .values(&new_job)
        .on_conflict((document_jobs::user_id, document_jobs::file_id))
        .do_nothing()
        .execute(conn)?;

    find_job(conn, new_job.user_id, new_job.file_id)?.ok_or(JobQueueError::NotFound(new_job.id))
}

pub fn find_job(
    conn: &mut PgConnection,
    user_id: Uuid,
    file_id: Uuid,
) -> JobQueueResult<Option<DocumentJob>> {
    let job = document_jobs::table
        .filter(document_jobs::user_id.eq(user_id))
        .filter(document_jobs::file_id.eq(file_id))
        .first(conn)
        .optional()?;
    Ok(job)
}

pub fn get_job(conn: &mut PgConnection, job_id: Uuid) -> JobQueueResult<DocumentJob> {
    document_jobs::table
        .find(job_id)
        .first(conn)
        .optional()?
        .ok_or(JobQueueError::NotFound(job_id))
}

/// Atomically picks the oldest eligible job of one of `candidate_types` and
/// marks it in progress. Concurrent workers skip rows another transaction has
/// locked, so a job is handed to at most one of them.
pub fn claim_job(
    conn: &mut PgConnection,
    candidate_types: &[&str],
) -> JobQueueResult<Option<DocumentJob>> {
    let now = now();

    conn.transaction(|conn| {
        let job_opt = document_jobs::table
            .filter(document_jobs::status.eq(STATUS_PENDING))
            .filter(document_jobs::retry_at.le(now))
            .filter(document_jobs::candidate_type.eq_any(candidate_types.iter().copied()))
            .order(document_jobs::retry_at.asc())
            .for_update()
            .skip_locked()
            .first::<DocumentJob>(conn)
            .optional()?;

        if let Some(job) = job_opt {
            let claimed = diesel::update(document_jobs::table.find(job.id))
                .set((
                    document_jobs::status.eq(STATUS_IN_PROGRESS),
                    document_jobs::updated_at.eq(now),
                ))
                .get_result::<DocumentJob>(conn)?;
            Ok::<Option<DocumentJob>, diesel::result::Error>(Some(claimed))
        } else {
            Ok::<Option<DocumentJob>, diesel::result::Error>(None)
        }
    })
    .map_err(JobQueueError::from)
}

/// Records that the provider accepted the document.
pub fn mark_uploaded(
    conn: &mut PgConnection,
    job_id: Uuid,
    provider_document_id: &str,
    provider_job_id: &str,
) -> JobQueueResult<()> {
    diesel::update(document_jobs::table.find(job_id))
        .set((
            document_jobs::upload_state.eq(STAGE_SUCCEEDED),
            document_jobs::process_state.eq(STAGE_IN_PROGRESS),
            document_jobs::provider_document_id.eq(Some(provider_document_id)),
            document_jobs::provider_job_id.eq(Some(provider_job_id)),
            document_jobs::updated_at.eq(now()),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn mark_upload_started(conn: &mut PgConnection, job_id: Uuid) -> JobQueueResult<()> {
    diesel::update(document_jobs::table.find(job_id))
        .set((
            document_jobs::upload_state.eq(STAGE_IN_PROGRESS),
            document_jobs::updated_at.eq(now()),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn update_candidate_type(
    conn: &mut PgConnection,
    job_id: Uuid,
    candidate_type: &str,
) -> JobQueueResult<()> {
    diesel::update(document_jobs::table.find(job_id))
        .set((
            document_jobs::candidate_type.eq(candidate_type),
            document_jobs::updated_at.eq(now()),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn mark_succeeded(
    conn: &mut PgConnection,
    job_id: Uuid,
    version: &PipelineVersion,
) -> JobQueueResult<()> {
    diesel::update(document_jobs::table.find(job_id))
        .set((
            document_jobs::status.eq(STATUS_SUCCEEDED),
            document_jobs::process_state.eq(STAGE_SUCCEEDED),
            document_jobs::last_error_code.eq(None::<String>),
            document_jobs::last_error_message.eq(None::<String>),
            document_jobs::schema_version.eq(Some(version.schema_version.as_str())),
            document_jobs::parser_version.eq(Some(version.parser_version.as_str())),
            document_jobs::prompt_version.eq(Some(version.prompt_version.as_str())),
            document_jobs::model.eq(Some(version.model.as_str())),
            document_jobs::updated_at.eq(now()),
        ))
        .execute(conn)?;
    Ok(())
}

/// A job whose previous run already produced a complete insight goes
/// straight back to `succeeded` without touching the provider.
pub fn mark_skipped(conn: &mut PgConnection, job_id: Uuid) -> JobQueueResult<()> {
    diesel::update(document_jobs::table.find(job_id))
        .set((
            document_jobs::status.eq(STATUS_SUCCEEDED),
            document_jobs::updated_at.eq(now()),
        ))
        .execute(conn)?;
    Ok(())
}

/// Counts a failed attempt and puts the job back to `pending` with `retry_at`
/// pushed out by the backoff, or dead-letters it once the policy's ceiling is
/// reached.
pub fn record_failure(
    conn: &mut PgConnection,
    job_id: Uuid,
    failure: &JobFailure,
    policy: &RetryPolicy,
) -> JobQueueResult<RecordedFailure> {
    conn.transaction(|conn| {
        let job = document_jobs::table
            .find(job_id)
            .for_update()
            .first::<DocumentJob>(conn)?;

        let attempts = job.attempts + 1;
        let outcome = policy.outcome(attempts);
        let now = now();
        let retry_at = now + ChronoDuration::milliseconds(outcome.delay_ms() as i64);
        let status = if outcome.is_dead_letter() {
            STATUS_DEAD_LETTER
        } else {
            STATUS_PENDING
        };
        let (upload_state, process_state) = failed_stages(&job);

        let updated = diesel::update(document_jobs::table.find(job.id))
            .set((
                document_jobs::status.eq(status),
                document_jobs::attempts.eq(attempts),
                document_jobs::retry_at.eq(retry_at),
                document_jobs::upload_state.eq(upload_state),
                document_jobs::process_state.eq(process_state),
                document_jobs::last_error_code.eq(Some(failure.code.as_str())),
                document_jobs::last_error_message.eq(Some(failure.message.as_str())),
                document_jobs::updated_at.eq(now),
            ))
            .get_result::<DocumentJob>(conn)?;

        if outcome.is_dead_letter() {
            let details = json!({
                "job_id": job.id,
                "file_id": job.file_id,
                "attempts": attempts,
                "error_code": failure.code.as_str(),
                "error_message": failure.message,
                "provider_document_id": job.provider_document_id,
                "provider_job_id": job.provider_job_id,
                "details": failure.details,
            });
            dead_letters::upsert_dead_letter(
                conn,
                &updated,
                DeadLetterReason::from_code(failure.code),
                details,
            )?;
        }

        Ok::<RecordedFailure, diesel::result::Error>(RecordedFailure { attempts, outcome })
    })
    .map_err(JobQueueError::from)
}

/// The stage that was running when the attempt failed is the one marked failed.
fn failed_stages(job: &DocumentJob) -> (&str, &str) {
    if job.upload_state == STAGE_SUCCEEDED {
        (STAGE_SUCCEEDED, STAGE_FAILED)
    } else {
        (STAGE_FAILED, job.process_state.as_str())
    }
}

/// Permanent input errors end the job without consuming retry budget.
pub fn mark_rejected(
    conn: &mut PgConnection,
    job_id: Uuid,
    failure: &JobFailure,
) -> JobQueueResult<()> {
    conn.transaction(|conn| {
        let job = document_jobs::table
            .find(job_id)
            .for_update()
            .first::<DocumentJob>(conn)
            .optional()?
            .ok_or(JobQueueError::NotFound(job_id))?;
        let (upload_state, process_state) = failed_stages(&job);

        diesel::update(document_jobs::table.find(job_id))
            .set((
                document_jobs::status.eq(STATUS_REJECTED),
                document_jobs::upload_state.eq(upload_state),
                document_jobs::process_state.eq(process_state),
                document_jobs::last_error_code.eq(Some(failure.code.as_str())),
                document_jobs::last_error_message.eq(Some(failure.message.as_str())),
                document_jobs::updated_at.eq(now()),
            ))
            .execute(conn)?;
        Ok(())
    })
}

/// Returns jobs stuck `in_progress` longer than `lease` (a crashed worker) to
/// the claimable pool. Their attempt count is left alone.
pub fn requeue_stale_jobs(conn: &mut PgConnection, lease: Duration) -> JobQueueResult<usize> {
    let now = now();
    let lease = ChronoDuration::from_std(lease).unwrap_or_else(|_| ChronoDuration::minutes(15));

    let count = diesel::update(
        document_jobs::table
            .filter(document_jobs::status.eq(STATUS_IN_PROGRESS))
            .filter(document_jobs::updated_at.lt(now - lease)),
    )
    .set((
        document_jobs::status.eq(STATUS_PENDING),
        document_jobs::retry_at.eq(now),
        document_jobs::updated_at.eq(now),
    ))
    .execute(conn)?;
    Ok(count)
}

/// Operator action: gives a dead-lettered, rejected or failed job a fresh
/// retry budget and resolves its dead letter.
pub fn requeue_job(
    conn: &mut PgConnection,
    user_id: Uuid,
    file_id: Uuid,
) -> JobQueueResult<Option<DocumentJob>> {
    conn.transaction(|conn| {
        let now = now();
        let job = diesel::update(
            document_jobs::table
                .filter(document_jobs::user_id.eq(user_id))
                .filter(document_jobs::file_id.eq(file_id))
                .filter(document_jobs::status.eq_any([
                    STATUS_DEAD_LETTER,
                    STATUS_REJECTED,
                    STATUS_FAILED,
                ])),
        )
        .set((
            document_jobs::status.eq(STATUS_PENDING),
            document_jobs::attempts.eq(0),
            document_jobs::retry_at.eq(now),
            document_jobs::process_state.eq(STAGE_PENDING),
            document_jobs::updated_at.eq(now),
        ))
        .get_result::<DocumentJob>(conn)
        .optional()?;

        if job.is_some() {
            dead_letters::resolve(conn, user_id, file_id)?;
        }
        Ok::<Option<DocumentJob>, diesel::result::Error>(job)
    })
    .map_err(JobQueueError::from)
}

/// Operator action: puts a succeeded job back in the queue. Its stage history
/// is kept, so the worker skips it when the stored insight is complete and
/// repairs the insight otherwise.
pub fn reprocess_job(
    conn: &mut PgConnection,
    user_id: Uuid,
    file_id: Uuid,
) -> JobQueueResult<Option<DocumentJob>> {
    let now = now();
    let job = diesel::update(
        document_jobs::table
            .filter(document_jobs::user_id.eq(user_id))
            .filter(document_jobs::file_id.eq(file_id))
            .filter(document_jobs::status.eq(STATUS_SUCCEEDED)),
    )
    .set((
        document_jobs::status.eq(STATUS_PENDING),
        document_jobs::retry_at.eq(now),
        document_jobs::updated_at.eq(now),
    ))
    .get_result::<DocumentJob>(conn)
    .optional()?;
    Ok(job)
}
