//! Monthly analytics snapshots.
//!
//! A rebuild always recomputes a period from every contributing insight and
//! overwrites the stored snapshot, so running it twice on unchanged inputs
//! yields the same totals.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use diesel::{pg::upsert::excluded, prelude::*};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    canonical::Category,
    jobs::{INSIGHT_STATUS_FAILED, INSIGHT_STATUS_SUCCESS},
    models::{AnalyticsSnapshot, Insight, NewAnalyticsSnapshot},
    normalize::{iso_month, parse_date, DocumentKind, PayslipMetricsV1, StatementMetricsV1},
    schema::{analytics_snapshots, insights},
};

pub const MISSING_FIELDS_REASON: &str = "missing required fields for analytics";
/// Period recorded on the snapshot written for a rebuild whose period could
/// not be determined.
pub const UNRESOLVED_PERIOD: &str = "unresolved";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Pending,
    Success,
    Failed,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStatus::Pending => "pending",
            SnapshotStatus::Success => "success",
            SnapshotStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildRequest {
    /// `YYYY-MM`, or a bare month number when `period_year` is set.
    pub period_month: Option<String>,
    pub period_year: Option<i32>,
    pub pay_date: Option<String>,
    pub file_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebuildOutcome {
    pub status: SnapshotStatus,
    pub period: Option<String>,
    pub reason: Option<String>,
    pub insight_count: usize,
}

pub fn resolve_period(request: &RebuildRequest) -> Option<String> {
    if let Some(month) = request.period_month.as_deref().map(str::trim) {
        if let Some(period) = parse_period_month(month, request.period_year) {
            return Some(period);
        }
    }

    request
        .pay_date
        .as_deref()
        .and_then(|date| parse_date(&Value::String(date.to_string())))
        .map(iso_month)
}

fn parse_period_month(value: &str, year: Option<i32>) -> Option<String> {
    if let Some((y, m)) = value.split_once('-') {
        let (year, month) = (y.parse::<i32>().ok()?, m.parse::<u32>().ok()?);
        return valid_period(year, month);
    }
    let month = value.parse::<u32>().ok()?;
    valid_period(year?, month)
}

fn valid_period(year: i32, month: u32) -> Option<String> {
    ((1000..=9999).contains(&year) && (1..=12).contains(&month))
        .then(|| format!("{year:04}-{month:02}"))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotTotals {
    pub income: i64,
    pub gross_income: i64,
    pub tax: i64,
    pub national_insurance: i64,
    pub pension: i64,
    pub student_loan: i64,
    pub inflow: i64,
    pub outflow: i64,
    pub spend_by_category: BTreeMap<String, i64>,
    pub cashflow: i64,
    pub savings: i64,
    pub investments: i64,
    /// Ratios in basis points of net income / gross income respectively.
    pub savings_rate_bps: Option<i64>,
    pub tax_rate_bps: Option<i64>,
    pub payslip_count: usize,
    pub statement_count: usize,
}

fn basis_points(part: i64, whole: i64) -> Option<i64> {
    (whole != 0).then(|| part * 10_000 / whole)
}

/// Most recent successful insight per file, ordered by file id.
fn contributing(insights: &[Insight]) -> Vec<&Insight> {
    let mut latest: HashMap<Uuid, &Insight> = HashMap::new();
    for insight in insights.iter().filter(|i| i.status == INSIGHT_STATUS_SUCCESS) {
        latest
            .entry(insight.file_id)
            .and_modify(|current| {
                if (insight.updated_at, insight.created_at) > (current.updated_at, current.created_at) {
                    *current = insight;
                }
            })
            .or_insert(insight);
    }
    let mut picked: Vec<&Insight> = latest.into_values().collect();
    picked.sort_by_key(|insight| insight.file_id);
    picked
}

/// Pure aggregation over a period's insights. Returns the totals and the ids
/// of the insights that contributed.
pub fn aggregate_snapshot(insights: &[Insight]) -> (SnapshotTotals, Vec<Uuid>) {
    let mut totals = SnapshotTotals::default();
    let mut sources = Vec::new();

    for insight in contributing(insights) {
        let Some(metrics) = insight.metrics_v1.clone() else {
            continue;
        };
        match DocumentKind::from_catalogue_key(&insight.catalogue_key) {
            Some(DocumentKind::Payslip) => {
                let Ok(payslip) = serde_json::from_value::<PayslipMetricsV1>(metrics) else {
                    warn!(insight_id = %insight.id, "skipping payslip insight with unreadable metrics");
                    continue;
                };
                totals.income += payslip.net_pay.unwrap_or(0);
                totals.gross_income += payslip.gross_pay.unwrap_or(0);
                totals.tax += payslip.tax;
                totals.national_insurance += payslip.national_insurance;
                totals.pension += payslip.pension;
                totals.student_loan += payslip.student_loan;
                totals.payslip_count += 1;
            }
            Some(DocumentKind::BankStatement) => {
                let Ok(statement) = serde_json::from_value::<StatementMetricsV1>(metrics) else {
                    warn!(insight_id = %insight.id, "skipping statement insight with unreadable metrics");
                    continue;
                };
                totals.inflow += statement.total_inflow;
                totals.outflow += statement.total_outflow;
                for (category, amount) in statement.spend_by_category {
                    *totals.spend_by_category.entry(category).or_insert(0) += amount;
                }
                totals.statement_count += 1;
            }
            None => continue,
        }
        sources.push(insight.id);
    }

    totals.cashflow = totals.inflow - totals.outflow;
    totals.savings = category_total(&totals, Category::Savings);
    totals.investments = category_total(&totals, Category::Investments);
    totals.savings_rate_bps = basis_points(totals.savings + totals.investments, totals.income);
    totals.tax_rate_bps = basis_points(totals.tax, totals.gross_income);

    (totals, sources)
}

fn category_total(totals: &SnapshotTotals, category: Category) -> i64 {
    totals
        .spend_by_category
        .get(category.as_str())
        .copied()
        .unwrap_or(0)
}

/// Whether writing `snapshot` would change nothing but `updated_at`.
fn snapshot_unchanged(existing: &AnalyticsSnapshot, snapshot: &NewAnalyticsSnapshot) -> bool {
    existing.status == snapshot.status
        && existing.status_reason == snapshot.status_reason
        && existing.totals == snapshot.totals
        && existing.source_insight_ids == snapshot.source_insight_ids
        && existing.insight_count == snapshot.insight_count
}

/// Full replace of the period's row. An identical rebuild leaves the row,
/// including `updated_at`, as it was.
fn upsert_snapshot(conn: &mut PgConnection, snapshot: &NewAnalyticsSnapshot) -> QueryResult<AnalyticsSnapshot> {
    let existing: Option<AnalyticsSnapshot> = analytics_snapshots::table
        .filter(analytics_snapshots::user_id.eq(snapshot.user_id))
        .filter(analytics_snapshots::period.eq(&snapshot.period))
        .for_update()
        .first(conn)
        .optional()?;
    if let Some(existing) = existing {
        if snapshot_unchanged(&existing, snapshot) {
            return Ok(existing);
        }
    }

    diesel::insert_into(analytics_snapshots::table)
        .values(snapshot)
        .on_conflict((analytics_snapshots::user_id, analytics_snapshots::period))
        .do_update()
        .set((
            analytics_snapshots::status.eq(excluded(analytics_snapshots::status)),
            analytics_snapshots::status_reason.eq(excluded(analytics_snapshots::status_reason)),
            analytics_snapshots::totals.eq(excluded(analytics_snapshots::totals)),
            analytics_snapshots::source_insight_ids.eq(excluded(analytics_snapshots::source_insight_ids)),
            analytics_snapshots::insight_count.eq(excluded(analytics_snapshots::insight_count)),
            analytics_snapshots::updated_at.eq(Utc::now().naive_utc()),
        ))
        .get_result(conn)
}

/// Recomputes the snapshot for the request's period. An unresolvable period
/// is recorded as failed on both the snapshot and the triggering insight.
pub fn rebuild(
    conn: &mut PgConnection,
    user_id: Uuid,
    request: &RebuildRequest,
) -> QueryResult<RebuildOutcome> {
    let Some(period) = resolve_period(request) else {
        return record_unresolved(conn, user_id, request);
    };

    conn.transaction(|conn| {
        let rows: Vec<Insight> = insights::table
            .filter(insights::user_id.eq(user_id))
            .filter(insights::document_month.eq(&period))
            .filter(insights::status.eq(INSIGHT_STATUS_SUCCESS))
            .order((insights::file_id.asc(), insights::created_at.asc()))
            .load(conn)?;

        let (totals, sources) = aggregate_snapshot(&rows);
        let totals_json = serde_json::to_value(&totals)
            .map_err(|err| diesel::result::Error::SerializationError(Box::new(err)))?;

        upsert_snapshot(
            conn,
            &NewAnalyticsSnapshot {
                id: Uuid::new_v4(),
                user_id,
                period: period.clone(),
                status: SnapshotStatus::Success.as_str().to_string(),
                status_reason: None,
                totals: totals_json,
                source_insight_ids: sources.clone(),
                insight_count: sources.len() as i32,
            },
        )?;

        info!(%user_id, %period, insights = sources.len(), "analytics snapshot rebuilt");
        Ok(RebuildOutcome {
            status: SnapshotStatus::Success,
            period: Some(period.clone()),
            reason: None,
            insight_count: sources.len(),
        })
    })
}

fn record_unresolved(
    conn: &mut PgConnection,
    user_id: Uuid,
    request: &RebuildRequest,
) -> QueryResult<RebuildOutcome> {
    conn.transaction(|conn| {
        upsert_snapshot(
            conn,
            &NewAnalyticsSnapshot {
                id: Uuid::new_v4(),
                user_id,
                period: UNRESOLVED_PERIOD.to_string(),
                status: SnapshotStatus::Failed.as_str().to_string(),
                status_reason: Some(MISSING_FIELDS_REASON.to_string()),
                totals: Value::Object(Default::default()),
                source_insight_ids: Vec::new(),
                insight_count: 0,
            },
        )?;

        if let Some(file_id) = request.file_id {
            diesel::update(
                insights::table
                    .filter(insights::user_id.eq(user_id))
                    .filter(insights::file_id.eq(file_id)),
            )
            .set((
                insights::status.eq(INSIGHT_STATUS_FAILED),
                insights::status_reason.eq(Some(MISSING_FIELDS_REASON)),
                insights::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
        }

        warn!(%user_id, file_id = ?request.file_id, reason = MISSING_FIELDS_REASON, "analytics rebuild failed");
        Ok(RebuildOutcome {
            status: SnapshotStatus::Failed,
            period: None,
            reason: Some(MISSING_FIELDS_REASON.to_string()),
            insight_count: 0,
        })
    })
}

pub fn find_snapshot(
    conn: &mut PgConnection,
    user_id: Uuid,
    period: &str,
) -> QueryResult<Option<AnalyticsSnapshot>> {
    analytics_snapshots::table
        .filter(analytics_snapshots::user_id.eq(user_id))
        .filter(analytics_snapshots::period.eq(period))
        .first(conn)
        .optional()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDateTime};
    use serde_json::json;

    use super::*;

    fn request(period_month: Option<&str>, period_year: Option<i32>, pay_date: Option<&str>) -> RebuildRequest {
        RebuildRequest {
            period_month: period_month.map(str::to_string),
            period_year,
            pay_date: pay_date.map(str::to_string),
            file_id: None,
        }
    }

    #[test]
    fn explicit_month_wins_over_pay_date() {
        let period = resolve_period(&request(Some("2024-02"), None, Some("2024-03-28")));
        assert_eq!(period.as_deref(), Some("2024-02"));
    }

    #[test]
    fn bare_month_needs_a_year() {
        assert_eq!(
            resolve_period(&request(Some("3"), Some(2024), None)).as_deref(),
            Some("2024-03")
        );
        assert_eq!(resolve_period(&request(Some("3"), None, None)), None);
        assert_eq!(resolve_period(&request(Some("13"), Some(2024), None)), None);
    }

    #[test]
    fn pay_date_derives_the_month() {
        assert_eq!(
            resolve_period(&request(None, None, Some("28/03/2024"))).as_deref(),
            Some("2024-03")
        );
    }

    #[test]
    fn nothing_to_resolve() {
        assert_eq!(resolve_period(&request(None, None, None)), None);
        assert_eq!(resolve_period(&request(Some("soon"), None, Some("never"))), None);
    }

    fn at(offset_secs: i64) -> NaiveDateTime {
        NaiveDateTime::parse_from_str("2024-04-01 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap()
            + Duration::seconds(offset_secs)
    }

    fn insight(file_id: Uuid, kind: &str, metrics_v1: Value, updated: i64) -> Insight {
        Insight {
            id: Uuid::new_v4(),
            user_id: Uuid::nil(),
            file_id,
            job_id: Uuid::new_v4(),
            catalogue_key: kind.into(),
            document_date: Some("2024-03-28".into()),
            document_month: Some("2024-03".into()),
            metrics: None,
            metrics_v1: Some(metrics_v1),
            transactions: None,
            status: INSIGHT_STATUS_SUCCESS.into(),
            status_reason: None,
            schema_version: "v1".into(),
            content_hash: "00".repeat(32),
            created_at: at(updated),
            updated_at: at(updated),
        }
    }

    fn payslip(net: i64, gross: i64, tax: i64) -> Value {
        json!({
            "employer": "Acme", "pay_date": "2024-03-28", "period_month": "2024-03",
            "pay_frequency": null, "gross_pay": gross, "net_pay": net, "tax": tax,
            "national_insurance": 0, "pension": 0, "student_loan": 0, "other_deductions": 0,
            "tax_code": null, "ni_number_masked": null, "ni_number_hash": null,
            "ytd": { "gross_pay": null, "tax": null, "national_insurance": null, "pension": null }
        })
    }

    fn statement(inflow: i64, outflow: i64, spend: Value) -> Value {
        json!({
            "institution": "Monzo", "institution_raw": "MONZO", "account_number_masked": null,
            "account_number_hash": null, "account_type": "current", "period_start": null,
            "period_end": "2024-03-31", "period_month": "2024-03", "opening_balance": null,
            "closing_balance": null, "total_inflow": inflow, "total_outflow": outflow,
            "spend_by_category": spend, "transaction_count": 0
        })
    }

    #[test]
    fn aggregates_payslips_and_statements() {
        let rows = vec![
            insight(Uuid::new_v4(), "payslip", payslip(200_000, 300_000, 60_000), 0),
            insight(
                Uuid::new_v4(),
                "bank_statement",
                statement(210_000, 150_000, json!({ "Groceries": 30_000, "Savings": 40_000 })),
                0,
            ),
        ];

        let (totals, sources) = aggregate_snapshot(&rows);
        assert_eq!(sources.len(), 2);
        assert_eq!(totals.income, 200_000);
        assert_eq!(totals.cashflow, 60_000);
        assert_eq!(totals.savings, 40_000);
        assert_eq!(totals.spend_by_category["Groceries"], 30_000);
        assert_eq!(totals.savings_rate_bps, Some(2_000));
        assert_eq!(totals.tax_rate_bps, Some(2_000));
    }

    #[test]
    fn only_the_latest_insight_per_file_counts() {
        let file = Uuid::new_v4();
        let stale = insight(file, "payslip", payslip(100_000, 150_000, 0), 0);
        let fresh = insight(file, "payslip", payslip(120_000, 150_000, 0), 60);
        let fresh_id = fresh.id;

        let (totals, sources) = aggregate_snapshot(&[fresh, stale]);
        assert_eq!(totals.income, 120_000);
        assert_eq!(sources, vec![fresh_id]);
    }

    #[test]
    fn failed_insights_and_zero_income_are_ignored() {
        let mut failed = insight(Uuid::new_v4(), "payslip", payslip(100_000, 150_000, 0), 0);
        failed.status = INSIGHT_STATUS_FAILED.into();

        let (totals, sources) = aggregate_snapshot(&[failed]);
        assert!(sources.is_empty());
        assert_eq!(totals, SnapshotTotals::default());
        assert_eq!(totals.savings_rate_bps, None);
    }

    #[test]
    fn aggregation_is_order_independent() {
        let a = insight(Uuid::new_v4(), "payslip", payslip(1, 2, 0), 0);
        let b = insight(Uuid::new_v4(), "bank_statement", statement(5, 3, json!({})), 0);
        let forward = aggregate_snapshot(&[a.clone(), b.clone()]);
        let backward = aggregate_snapshot(&[b, a]);
        assert_eq!(forward, backward);
    }

    #[test]
    fn identical_rebuild_leaves_the_row_alone() {
        let sources = vec![Uuid::new_v4()];
        let stored = AnalyticsSnapshot {
            id: Uuid::new_v4(),
            user_id: Uuid::nil(),
            period: "2024-03".into(),
            status: "success".into(),
            status_reason: None,
            totals: json!({ "income": 200_000, "spend_by_category": { "Groceries": 30_000 } }),
            source_insight_ids: sources.clone(),
            insight_count: 1,
            created_at: at(0),
            updated_at: at(0),
        };
        let mut next = NewAnalyticsSnapshot {
            id: Uuid::new_v4(),
            user_id: Uuid::nil(),
            period: "2024-03".into(),
            status: "success".into(),
            status_reason: None,
            totals: json!({ "spend_by_category": { "Groceries": 30_000 }, "income": 200_000 }),
            source_insight_ids: sources,
            insight_count: 1,
        };
        assert!(snapshot_unchanged(&stored, &next));

        next.totals["income"] = json!(210_000);
        assert!(!snapshot_unchanged(&stored, &next));
    }
}
