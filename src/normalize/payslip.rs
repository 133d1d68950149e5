use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    canonical::{canonicalise_employer, hash_pii, mask_ni},
    utils::json::{lookup, lookup_str},
};

use super::{
    iso_date, iso_month, parse_date, to_minor_units, NormalizeContext, Normalized, ValidationIssue,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayslipYtd {
    pub gross_pay: Option<i64>,
    pub tax: Option<i64>,
    pub national_insurance: Option<i64>,
    pub pension: Option<i64>,
}

/// Canonical payslip figures. Deductions are additive and default to zero;
/// headline pay amounts stay `None` when the payslip does not state them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayslipMetricsV1 {
    pub employer: Option<String>,
    pub pay_date: String,
    pub period_month: String,
    pub pay_frequency: Option<String>,
    pub gross_pay: Option<i64>,
    pub net_pay: Option<i64>,
    pub tax: i64,
    pub national_insurance: i64,
    pub pension: i64,
    pub student_loan: i64,
    pub other_deductions: i64,
    pub tax_code: Option<String>,
    pub ni_number_masked: Option<String>,
    pub ni_number_hash: Option<String>,
    pub ytd: PayslipYtd,
}

impl PayslipMetricsV1 {
    pub fn total_deductions(&self) -> i64 {
        self.tax + self.national_insurance + self.pension + self.student_loan + self.other_deductions
    }

    pub fn validate(&self) -> Result<(), Vec<ValidationIssue>> {
        let mut issues = Vec::new();

        if let Some(gross) = self.gross_pay {
            if gross < 0 {
                issues.push(ValidationIssue::invalid("gross_pay", "must not be negative"));
            }
        }
        if let (Some(gross), Some(net)) = (self.gross_pay, self.net_pay) {
            if net > gross {
                issues.push(ValidationIssue::invalid(
                    "net_pay",
                    format!("net pay {net} exceeds gross pay {gross}"),
                ));
            }
        }
        for (field, amount) in [
            ("tax", self.tax),
            ("national_insurance", self.national_insurance),
            ("pension", self.pension),
            ("student_loan", self.student_loan),
        ] {
            if amount < 0 {
                issues.push(ValidationIssue::invalid(field, "deduction must not be negative"));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }

    /// Flat camelCase summary kept alongside the typed metrics.
    pub fn summary(&self) -> Value {
        json!({
            "employer": self.employer,
            "payDate": self.pay_date,
            "grossPay": self.gross_pay,
            "netPay": self.net_pay,
            "tax": self.tax,
            "ni": self.national_insurance,
            "pension": self.pension,
            "studentLoan": self.student_loan,
            "deductions": self.total_deductions(),
        })
    }
}

fn amount(raw: &Value, paths: &[&str]) -> Option<i64> {
    lookup(raw, paths).and_then(to_minor_units)
}

/// Deductions are reported as positive amounts even when the payslip prints
/// them negative.
fn deduction(raw: &Value, paths: &[&str]) -> i64 {
    amount(raw, paths).map(i64::abs).unwrap_or(0)
}

pub fn normalize_payslip(raw: &Value, ctx: &NormalizeContext<'_>) -> Normalized<PayslipMetricsV1> {
    let pay_date = lookup(raw, &["payDate", "pay_date", "paymentDate", "payment_date", "date"])
        .and_then(parse_date);

    let gross_pay = amount(raw, &["grossPay", "gross_pay", "gross", "totalGross", "earnings.total"]);
    let tax = deduction(raw, &["tax", "incomeTax", "income_tax", "paye", "deductions.tax"]);
    let national_insurance = deduction(
        raw,
        &[
            "nationalInsurance",
            "national_insurance",
            "ni",
            "niContribution",
            "deductions.nationalInsurance",
        ],
    );
    let pension = deduction(raw, &["pension", "pensionContribution", "deductions.pension"]);
    let student_loan = deduction(raw, &["studentLoan", "student_loan", "deductions.studentLoan"]);
    let other_deductions = deduction(raw, &["otherDeductions", "other_deductions", "deductions.other"]);

    let stated_net = amount(raw, &["netPay", "net_pay", "net", "takeHomePay", "take_home_pay"]);
    let net_pay = stated_net.or_else(|| {
        gross_pay.map(|gross| gross - (tax + national_insurance + pension + student_loan + other_deductions))
    });

    let mut missing = Vec::new();
    if pay_date.is_none() {
        missing.push("payDate");
    }
    if net_pay.is_none() {
        missing.push("netPay");
    }
    let (Some(pay_date), Some(_)) = (pay_date, net_pay) else {
        return Normalized::Incomplete { missing };
    };

    let employer = lookup_str(raw, &["employer", "employerName", "employer_name", "employer.name", "company"])
        .as_deref()
        .and_then(canonicalise_employer);

    let ni_number = lookup_str(raw, &["niNumber", "ni_number", "nationalInsuranceNumber", "employee.niNumber"]);
    let (ni_number_masked, ni_number_hash) = match ni_number {
        Some(value) => (Some(mask_ni(&value)), Some(hash_pii(&value, ctx.pepper))),
        None => (None, None),
    };

    let ytd = PayslipYtd {
        gross_pay: amount(raw, &["ytd.grossPay", "ytd.gross", "ytdGross", "ytd_gross_pay"]),
        tax: amount(raw, &["ytd.tax", "ytdTax", "ytd_tax"]),
        national_insurance: amount(
            raw,
            &["ytd.nationalInsurance", "ytd.ni", "ytdNi", "ytd_national_insurance"],
        ),
        pension: amount(raw, &["ytd.pension", "ytdPension", "ytd_pension"]),
    };

    Normalized::Complete(PayslipMetricsV1 {
        employer,
        pay_date: iso_date(pay_date),
        period_month: iso_month(pay_date),
        pay_frequency: lookup_str(raw, &["payFrequency", "pay_frequency", "frequency"])
            .map(|value| value.to_ascii_lowercase()),
        gross_pay,
        net_pay,
        tax,
        national_insurance,
        pension,
        student_loan,
        other_deductions,
        tax_code: lookup_str(raw, &["taxCode", "tax_code"]).map(|value| value.to_ascii_uppercase()),
        ni_number_masked,
        ni_number_hash,
        ytd,
    })
}
