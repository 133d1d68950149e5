//! Canonical account identities and their incrementally-grown alias arrays.

use diesel::{
    prelude::*,
    sql_types::{Array, Text, Uuid as SqlUuid},
};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::PipelineError,
    models::{Account, NewAccount},
    normalize::StatementMetricsV1,
    reconcile::{
        ensure_single_operator, plan_update, PlanOptions, ReconcileError, UpdateMode,
        UpdateOperator, UpdatePlan, FINGERPRINTS, RAW_INSTITUTION_NAMES,
    },
    schema::accounts,
};

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("statement does not name an institution")]
    MissingInstitution,
    #[error("account {0} not found")]
    NotFound(Uuid),
    #[error("`{0}` is not an updatable account field")]
    UnknownField(String),
    #[error(transparent)]
    Conflict(#[from] ReconcileError),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}

impl From<AccountError> for PipelineError {
    fn from(err: AccountError) -> Self {
        match err {
            AccountError::Conflict(inner) => PipelineError::IdentityConflict(inner),
            AccountError::Database(inner) => PipelineError::from(inner),
            other => PipelineError::IdentityResolution(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountIdentity {
    pub institution_name: String,
    pub account_number_masked: String,
    pub account_type: String,
    pub raw_institution_name: Option<String>,
    pub fingerprint: Option<String>,
}

pub fn identity_from_statement(metrics: &StatementMetricsV1) -> Result<AccountIdentity, AccountError> {
    let institution_name = metrics
        .institution
        .clone()
        .ok_or(AccountError::MissingInstitution)?;

    Ok(AccountIdentity {
        institution_name,
        account_number_masked: metrics.account_number_masked.clone().unwrap_or_default(),
        account_type: metrics.account_type.clone(),
        raw_institution_name: metrics.institution_raw.clone(),
        fingerprint: metrics.account_number_hash.clone().filter(|hash| !hash.is_empty()),
    })
}

/// Finds or creates the account for `identity`, then records the raw
/// institution spelling and fingerprint seen on this document.
pub fn resolve_account(
    conn: &mut PgConnection,
    user_id: Uuid,
    identity: &AccountIdentity,
) -> Result<Account, AccountError> {
    conn.transaction(|conn| {
        let new_account = NewAccount {
            id: Uuid::new_v4(),
            user_id,
            institution_name: identity.institution_name.clone(),
            account_number_masked: identity.account_number_masked.clone(),
            account_type: identity.account_type.clone(),
            raw_institution_names: Vec::new(),
            fingerprints: Vec::new(),
        };

        diesel::insert_into(accounts::table)
            .values(&new_account)
            .on_conflict((
                accounts::user_id,
                accounts::institution_name,
                accounts::account_number_masked,
                accounts::account_type,
            ))
            .do_nothing()
            .execute(conn)?;

        let account: Account = accounts::table
            .filter(accounts::user_id.eq(user_id))
            .filter(accounts::institution_name.eq(&identity.institution_name))
            .filter(accounts::account_number_masked.eq(&identity.account_number_masked))
            .filter(accounts::account_type.eq(&identity.account_type))
            .first(conn)?;

        let names: Vec<String> = identity.raw_institution_name.iter().cloned().collect();
        let names_plan = plan_update(
            UpdateMode::AppendUnique,
            &account.raw_institution_names,
            &names,
            &PlanOptions::for_field(RAW_INSTITUTION_NAMES),
        )?;
        apply_update_plan(conn, account.id, &names_plan)?;

        let hints: Vec<String> = identity.fingerprint.iter().cloned().collect();
        let hints_plan = plan_update(
            UpdateMode::AppendUnique,
            &account.fingerprints,
            &hints,
            &PlanOptions::for_field(FINGERPRINTS),
        )?;
        apply_update_plan(conn, account.id, &hints_plan)?;

        let refreshed = accounts::table.find(account.id).first(conn)?;
        Ok(refreshed)
    })
}

/// Loads the account's current array for `options.field`, plans the update and
/// applies it. Returns the plan so callers can report what changed.
pub fn reconcile_field(
    conn: &mut PgConnection,
    account_id: Uuid,
    mode: UpdateMode,
    candidates: &[String],
    options: &PlanOptions,
) -> Result<UpdatePlan, AccountError> {
    conn.transaction(|conn| {
        let account: Account = accounts::table
            .find(account_id)
            .first(conn)
            .optional()?
            .ok_or(AccountError::NotFound(account_id))?;

        let current = match options.field.as_str() {
            RAW_INSTITUTION_NAMES => &account.raw_institution_names,
            FINGERPRINTS => &account.fingerprints,
            other => return Err(AccountError::UnknownField(other.to_string())),
        };

        let plan = plan_update(mode, current, candidates, options)?;
        apply_update_plan(conn, account_id, &plan)?;
        Ok(plan)
    })
}

fn column_for(field: &str) -> Result<&'static str, AccountError> {
    match field {
        RAW_INSTITUTION_NAMES => Ok(RAW_INSTITUTION_NAMES),
        FINGERPRINTS => Ok(FINGERPRINTS),
        other => Err(AccountError::UnknownField(other.to_string())),
    }
}

/// Translates a validated plan into SQL. Each mutation is one statement that
/// computes the new array from the row's current value, so two workers
/// appending concurrently both land without overwriting each other.
pub fn apply_update_plan(
    conn: &mut PgConnection,
    account_id: Uuid,
    plan: &UpdatePlan,
) -> Result<usize, AccountError> {
    if !plan.applied {
        return Ok(0);
    }
    ensure_single_operator(&plan.update)?;

    let mut touched = 0;
    for mutation in plan.update.mutations() {
        let column = column_for(&mutation.field)?;
        debug!(%account_id, field = column, operator = %mutation.operator, "applying account update");

        touched += match mutation.operator {
            UpdateOperator::Set => diesel::sql_query(format!(
                "UPDATE accounts SET {column} = $1, updated_at = NOW() WHERE id = $2"
            ))
            .bind::<Array<Text>, _>(mutation.values.clone())
            .bind::<SqlUuid, _>(account_id)
            .execute(conn)?,
            UpdateOperator::AddToSet => diesel::sql_query(format!(
                "UPDATE accounts SET {column} = {column} || ARRAY(\
                    SELECT v FROM unnest($1::text[]) WITH ORDINALITY AS t(v, ord) \
                    WHERE NOT (v = ANY({column})) ORDER BY ord), \
                 updated_at = NOW() WHERE id = $2"
            ))
            .bind::<Array<Text>, _>(mutation.values.clone())
            .bind::<SqlUuid, _>(account_id)
            .execute(conn)?,
            UpdateOperator::SetElement => {
                let target = mutation.match_value.clone().ok_or_else(|| {
                    ReconcileError::MissingMatchValue {
                        field: mutation.field.clone(),
                    }
                })?;
                let replacement = match mutation.values.as_slice() {
                    [single] => single.clone(),
                    other => {
                        return Err(ReconcileError::InvalidReplacement { count: other.len() }.into())
                    }
                };
                let updated = diesel::sql_query(format!(
                    "UPDATE accounts SET {column} = array_replace({column}, $1, $2), \
                     updated_at = NOW() \
                     WHERE id = $3 AND $1 = ANY({column}) AND NOT ($2 = ANY({column}))"
                ))
                .bind::<Text, _>(&target)
                .bind::<Text, _>(&replacement)
                .bind::<SqlUuid, _>(account_id)
                .execute(conn)?;
                if updated == 0 {
                    return Err(ReconcileError::MatchValueNotFound {
                        field: mutation.field.clone(),
                        value: target,
                    }
                    .into());
                }
                updated
            }
        };
    }

    Ok(touched)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn statement(institution: Option<&str>) -> StatementMetricsV1 {
        StatementMetricsV1 {
            institution: institution.map(str::to_string),
            institution_raw: institution.map(|name| name.to_uppercase()),
            account_number_masked: Some("••••5678".into()),
            account_number_hash: Some("ab".repeat(32)),
            account_type: "current".into(),
            period_start: None,
            period_end: "2024-03-31".into(),
            period_month: "2024-03".into(),
            opening_balance: None,
            closing_balance: None,
            total_inflow: 0,
            total_outflow: 0,
            spend_by_category: BTreeMap::new(),
            transaction_count: 0,
            transactions: Vec::new(),
        }
    }

    #[test]
    fn identity_carries_canonical_and_raw_names() {
        let identity = identity_from_statement(&statement(Some("Monzo"))).unwrap();
        assert_eq!(identity.institution_name, "Monzo");
        assert_eq!(identity.raw_institution_name.as_deref(), Some("MONZO"));
        assert_eq!(identity.account_number_masked, "••••5678");
        assert!(identity.fingerprint.is_some());
    }

    #[test]
    fn statement_without_institution_cannot_be_resolved() {
        let err = identity_from_statement(&statement(None)).unwrap_err();
        assert!(matches!(err, AccountError::MissingInstitution));
        let pipeline: PipelineError = err.into();
        assert_eq!(pipeline.code().as_str(), "identity-resolution-failed");
    }

    #[test]
    fn only_known_columns_are_writable() {
        assert_eq!(column_for(RAW_INSTITUTION_NAMES).unwrap(), "raw_institution_names");
        assert!(matches!(
            column_for("institution_name; DROP TABLE accounts"),
            Err(AccountError::UnknownField(_))
        ));
    }
}
