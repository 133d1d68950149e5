use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    canonical::{canonicalise_institution, hash_pii, mask_account, normalise_category, Category},
    utils::json::{lookup, lookup_array, lookup_str},
};

use super::{
    iso_date, iso_month, parse_date, to_minor_units, IssueKind, NormalizeContext, Normalized,
    ValidationIssue,
};

pub const DEFAULT_ACCOUNT_TYPE: &str = "current";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementTransaction {
    pub date: Option<String>,
    pub description: Option<String>,
    /// Signed minor units: credits positive, debits negative.
    pub amount: i64,
    pub category: Category,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementMetricsV1 {
    pub institution: Option<String>,
    pub institution_raw: Option<String>,
    pub account_number_masked: Option<String>,
    pub account_number_hash: Option<String>,
    pub account_type: String,
    pub period_start: Option<String>,
    pub period_end: String,
    pub period_month: String,
    pub opening_balance: Option<i64>,
    pub closing_balance: Option<i64>,
    pub total_inflow: i64,
    pub total_outflow: i64,
    pub spend_by_category: BTreeMap<String, i64>,
    pub transaction_count: usize,
    #[serde(default, skip_serializing)]
    pub transactions: Vec<StatementTransaction>,
}

impl StatementMetricsV1 {
    /// `(expected_closing, computed_closing)` when the statement carries enough
    /// figures to reconcile and they disagree.
    pub fn balance_discrepancy(&self) -> Option<(i64, i64)> {
        let (opening, closing) = (self.opening_balance?, self.closing_balance?);
        if self.transactions.is_empty() {
            return None;
        }
        let computed = opening + self.transactions.iter().map(|tx| tx.amount).sum::<i64>();
        (computed != closing).then_some((closing, computed))
    }

    pub fn validate(&self) -> Result<(), Vec<ValidationIssue>> {
        let mut issues = Vec::new();

        if self.total_inflow < 0 {
            issues.push(ValidationIssue::invalid("total_inflow", "must not be negative"));
        }
        if self.total_outflow < 0 {
            issues.push(ValidationIssue::invalid("total_outflow", "must not be negative"));
        }
        if let Some(start) = &self.period_start {
            if start > &self.period_end {
                issues.push(ValidationIssue::invalid(
                    "period_start",
                    format!("{start} is after period end {}", self.period_end),
                ));
            }
        }
        if let Some((expected, computed)) = self.balance_discrepancy() {
            issues.push(ValidationIssue {
                field: "closing_balance",
                kind: IssueKind::BalanceMismatch,
                message: format!("expected {expected}, computed {computed}"),
            });
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }

    pub fn summary(&self) -> Value {
        json!({
            "institution": self.institution,
            "periodEnd": self.period_end,
            "openingBalance": self.opening_balance,
            "closingBalance": self.closing_balance,
            "totalIn": self.total_inflow,
            "totalOut": self.total_outflow,
            "net": self.total_inflow - self.total_outflow,
        })
    }

    pub fn transactions_json(&self) -> Option<Value> {
        if self.transactions.is_empty() {
            None
        } else {
            serde_json::to_value(&self.transactions).ok()
        }
    }
}

fn normalize_account_type(value: &str) -> String {
    let lowered = value.trim().to_ascii_lowercase().replace([' ', '-'], "_");
    let stripped = lowered.trim_end_matches("_account");
    if stripped.is_empty() {
        DEFAULT_ACCOUNT_TYPE.to_string()
    } else {
        stripped.to_string()
    }
}

fn normalize_transaction(raw: &Value) -> Option<StatementTransaction> {
    let signed = lookup(raw, &["amount", "value"]).and_then(to_minor_units);
    let credit = lookup(raw, &["credit", "paidIn", "paid_in", "moneyIn"]).and_then(to_minor_units);
    let debit = lookup(raw, &["debit", "paidOut", "paid_out", "moneyOut"]).and_then(to_minor_units);

    let mut amount = match (signed, credit, debit) {
        (Some(amount), _, _) => amount,
        (None, credit, debit) if credit.is_some() || debit.is_some() => {
            credit.map(i64::abs).unwrap_or(0) - debit.map(i64::abs).unwrap_or(0)
        }
        _ => return None,
    };

    let direction = lookup_str(raw, &["type", "direction"]).map(|value| value.to_ascii_lowercase());
    if matches!(direction.as_deref(), Some("debit" | "out" | "outflow")) && amount > 0 {
        amount = -amount;
    }

    let category = lookup_str(raw, &["category", "categoryName"])
        .map(|value| normalise_category(&value))
        .unwrap_or(Category::Misc);

    Some(StatementTransaction {
        date: lookup(raw, &["date", "transactionDate", "postedDate"])
            .and_then(parse_date)
            .map(iso_date),
        description: lookup_str(raw, &["description", "merchant", "narrative", "details"]),
        amount,
        category,
    })
}

pub fn normalize_statement(
    raw: &Value,
    ctx: &NormalizeContext<'_>,
) -> Normalized<StatementMetricsV1> {
    let period_end = lookup(
        raw,
        &[
            "periodEnd",
            "period_end",
            "period.end",
            "period.to",
            "statementDate",
            "statement_date",
            "endDate",
        ],
    )
    .and_then(parse_date);

    let Some(period_end) = period_end else {
        return Normalized::Incomplete {
            missing: vec!["periodEnd"],
        };
    };

    let period_start = lookup(raw, &["periodStart", "period_start", "period.start", "period.from", "startDate"])
        .and_then(parse_date)
        .map(iso_date);

    let transactions: Vec<StatementTransaction> = lookup_array(raw, &["transactions", "lines", "items"])
        .map(|items| items.iter().filter_map(normalize_transaction).collect())
        .unwrap_or_default();

    let summed_inflow: i64 = transactions.iter().filter(|tx| tx.amount > 0).map(|tx| tx.amount).sum();
    let summed_outflow: i64 = transactions.iter().filter(|tx| tx.amount < 0).map(|tx| -tx.amount).sum();

    let total_inflow = lookup(raw, &["totalIn", "total_in", "totalInflow", "total_inflow", "moneyIn", "totals.in"])
        .and_then(to_minor_units)
        .map(i64::abs)
        .unwrap_or(summed_inflow);
    let total_outflow = lookup(
        raw,
        &["totalOut", "total_out", "totalOutflow", "total_outflow", "moneyOut", "totals.out"],
    )
    .and_then(to_minor_units)
    .map(i64::abs)
    .unwrap_or(summed_outflow);

    let mut spend_by_category = BTreeMap::new();
    for tx in transactions.iter().filter(|tx| tx.amount < 0) {
        *spend_by_category
            .entry(tx.category.as_str().to_string())
            .or_insert(0) += -tx.amount;
    }

    let institution = lookup_str(
        raw,
        &["institution", "institutionName", "institution_name", "bankName", "bank.name"],
    )
    .as_deref()
    .and_then(canonicalise_institution);

    let account_number = lookup_str(
        raw,
        &["accountNumber", "account_number", "account.number", "account.accountNumber"],
    );
    let (account_number_masked, account_number_hash) = match account_number {
        Some(value) => (Some(mask_account(&value)), Some(hash_pii(&value, ctx.pepper))),
        None => (None, None),
    };

    Normalized::Complete(StatementMetricsV1 {
        institution: institution.as_ref().map(|name| name.canonical.clone()),
        institution_raw: institution.map(|name| name.raw),
        account_number_masked,
        account_number_hash,
        account_type: lookup_str(raw, &["accountType", "account_type", "account.type"])
            .map(|value| normalize_account_type(&value))
            .unwrap_or_else(|| DEFAULT_ACCOUNT_TYPE.to_string()),
        period_start,
        period_end: iso_date(period_end),
        period_month: iso_month(period_end),
        opening_balance: lookup(raw, &["openingBalance", "opening_balance", "balances.opening"])
            .and_then(to_minor_units),
        closing_balance: lookup(raw, &["closingBalance", "closing_balance", "balances.closing"])
            .and_then(to_minor_units),
        total_inflow,
        total_outflow,
        spend_by_category,
        transaction_count: transactions.len(),
        transactions,
    })
}
