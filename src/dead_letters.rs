use chrono::Utc;
use diesel::{pg::upsert::excluded, prelude::*};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    error::ErrorCode,
    models::{DeadLetter, DocumentJob, NewDeadLetter},
    schema::dead_letters,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    IdentityResolutionFailed,
    BalanceMismatch,
    ProviderTimeout,
    ProviderError,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::IdentityResolutionFailed => "identity-resolution-failed",
            DeadLetterReason::BalanceMismatch => "balance-mismatch",
            DeadLetterReason::ProviderTimeout => "provider-timeout",
            DeadLetterReason::ProviderError => "provider-error",
        }
    }

    /// Collapses the full error taxonomy onto the four operator-facing
    /// dead-letter reasons.
    pub fn from_code(code: ErrorCode) -> Self {
        match code {
            ErrorCode::ProviderTimeout => DeadLetterReason::ProviderTimeout,
            ErrorCode::IdentityResolutionFailed | ErrorCode::IdentityConflict => {
                DeadLetterReason::IdentityResolutionFailed
            }
            ErrorCode::BalanceMismatch => DeadLetterReason::BalanceMismatch,
            _ => DeadLetterReason::ProviderError,
        }
    }
}

/// Writes (or refreshes) the dead letter for the job's file. A file that is
/// requeued and exhausts its budget again reopens the same record.
pub fn upsert_dead_letter(
    conn: &mut PgConnection,
    job: &DocumentJob,
    reason: DeadLetterReason,
    details: Value,
) -> QueryResult<DeadLetter> {
    let record = NewDeadLetter {
        id: Uuid::new_v4(),
        user_id: job.user_id,
        file_id: job.file_id,
        job_id: job.id,
        reason: reason.as_str().to_string(),
        details,
    };

    diesel::insert_into(dead_letters::table)
        .values(&record)
        .on_conflict((dead_letters::user_id, dead_letters::file_id))
        .do_update()
        .set((
            dead_letters::job_id.eq(excluded(dead_letters::job_id)),
            dead_letters::reason.eq(excluded(dead_letters::reason)),
            dead_letters::details.eq(excluded(dead_letters::details)),
            dead_letters::resolved_at.eq(None::<chrono::NaiveDateTime>),
            dead_letters::updated_at.eq(Utc::now().naive_utc()),
        ))
        .get_result(conn)
}

pub fn list_unresolved(conn: &mut PgConnection, limit: i64) -> QueryResult<Vec<DeadLetter>> {
    dead_letters::table
        .filter(dead_letters::resolved_at.is_null())
        .order(dead_letters::created_at.asc())
        .limit(limit)
        .load(conn)
}

pub fn find_for_file(
    conn: &mut PgConnection,
    user_id: Uuid,
    file_id: Uuid,
) -> QueryResult<Option<DeadLetter>> {
    dead_letters::table
        .filter(dead_letters::user_id.eq(user_id))
        .filter(dead_letters::file_id.eq(file_id))
        .first(conn)
        .optional()
}

pub fn resolve(conn: &mut PgConnection, user_id: Uuid, file_id: Uuid) -> QueryResult<usize> {
    let now = Utc::now().naive_utc();
    diesel::update(
        dead_letters::table
            .filter(dead_letters::user_id.eq(user_id))
            .filter(dead_letters::file_id.eq(file_id))
            .filter(dead_letters::resolved_at.is_null()),
    )
    .set((
        dead_letters::resolved_at.eq(Some(now)),
        dead_letters::updated_at.eq(now),
    ))
    .execute(conn)
}
