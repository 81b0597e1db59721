use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, instrument, warn};

use crate::table::RawTable;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());
static NON_DIGIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\D").unwrap());

/// A cleaned patient row. Quality problems flag the row rather than drop
/// it; only a missing natural key excludes a row from the output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CleanPatient {
    pub patientid: String,
    pub firstname: Option<String>,
    pub lastname: Option<String>,
    pub middlename: Option<String>,
    pub ssn: Option<String>,
    pub phonenumber: Option<String>,
    pub gender: Option<String>,
    pub dateofbirth: Option<NaiveDate>,
    pub address: Option<String>,
    pub modifieddate: Option<NaiveDate>,
    pub insurance: Option<String>,
    pub email: Option<String>,
    pub email_valid: bool,
    pub age: Option<u32>,
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub quarter: Option<u32>,
    pub weekday: Option<String>,
    pub data_quality_flag: String,
}

/// A cleaned claim row with the derived billing fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CleanClaim {
    pub claimid: String,
    pub patientid: Option<String>,
    pub providerid: Option<String>,
    pub claim_amount: Option<f64>,
    pub paid_amount: Option<f64>,
    pub claim_status: Option<String>,
    pub payment_category: String,
    pub insurance_coverage_pct: Option<f64>,
    pub claim_date: Option<NaiveDate>,
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub quarter: Option<u32>,
    pub weekday: Option<String>,
    pub data_quality_flag: String,
}

/// Cleaning result for one table: surviving rows plus exclusion/flag counts.
#[derive(Debug)]
pub struct CleanReport<T> {
    pub rows: Vec<T>,
    pub excluded: usize,
    pub flagged: usize,
}

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email.trim())
}

/// Digits-only phone string, kept only when at least 10 digits survive.
pub fn clean_phone(raw: &str) -> Option<String> {
    let digits = NON_DIGIT_RE.replace_all(raw, "").into_owned();
    if digits.len() >= 10 {
        Some(digits)
    } else {
        None
    }
}

/// Accepts the date shapes the hospital systems actually emit.
pub fn parse_flexible_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    for format in ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d-%m-%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some(date);
        }
    }
    // Timestamp-shaped values keep their date part.
    raw.split(&[' ', 'T'][..])
        .next()
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
}

pub fn calculate_age(dob: NaiveDate, today: NaiveDate) -> u32 {
    let days = (today - dob).num_days();
    if days <= 0 {
        return 0;
    }
    (days as f64 / 365.25) as u32
}

fn quarter_of(month: u32) -> u32 {
    (month - 1) / 3 + 1
}

fn title_case(raw: &str) -> String {
    raw.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Canonical patient columns the cleaner guarantees downstream.
pub const PATIENT_COLUMNS: &[&str] = &[
    "patientid",
    "firstname",
    "lastname",
    "middlename",
    "ssn",
    "phonenumber",
    "gender",
    "dateofbirth",
    "address",
    "modifieddate",
    "insurance",
    "email",
];

const PATIENT_RENAMES: &[(&str, &str)] = &[
    ("id", "patientid"),
    ("f_name", "firstname"),
    ("l_name", "lastname"),
    ("m_name", "middlename"),
    ("dob", "dateofbirth"),
    ("phone_number", "phonenumber"),
];

/// Clean the extracted patient table: canonical lowercase columns, missing
/// columns synthesized, names title-cased, phones/emails/dates validated,
/// duplicate natural keys dropped keep-first.
#[instrument(skip(raw))]
pub fn clean_patients(raw: &RawTable, run_date: NaiveDate) -> CleanReport<CleanPatient> {
    let mut table = raw.clone();
    table.normalize_columns();
    table.rename_columns(PATIENT_RENAMES);
    table.ensure_columns(PATIENT_COLUMNS);

    let mut seen: HashSet<String> = HashSet::new();
    let mut rows = Vec::new();
    let mut excluded = 0usize;
    let mut flagged = 0usize;

    for i in 0..table.len() {
        let patientid = table.value(i, "patientid").trim().to_string();
        if patientid.is_empty() {
            excluded += 1;
            continue;
        }
        // Keep-first on the natural key.
        if !seen.insert(patientid.clone()) {
            excluded += 1;
            continue;
        }

        let mut flags: Vec<&str> = Vec::new();

        let email = non_empty(table.value(i, "email"));
        let email_valid = email.as_deref().map(is_valid_email).unwrap_or(false);
        if email.is_some() && !email_valid {
            flags.push("Invalid Email");
        }

        let raw_phone = table.value(i, "phonenumber");
        let phonenumber = clean_phone(raw_phone);
        if !raw_phone.trim().is_empty() && phonenumber.is_none() {
            flags.push("Invalid Phone");
        }

        let raw_dob = table.value(i, "dateofbirth");
        let dateofbirth = parse_flexible_date(raw_dob);
        if !raw_dob.trim().is_empty() && dateofbirth.is_none() {
            flags.push("Invalid Date");
        }

        let modifieddate = parse_flexible_date(table.value(i, "modifieddate"));

        if !flags.is_empty() {
            flagged += 1;
        }

        rows.push(CleanPatient {
            patientid,
            firstname: non_empty(table.value(i, "firstname")).map(|v| title_case(&v)),
            lastname: non_empty(table.value(i, "lastname")).map(|v| title_case(&v)),
            middlename: non_empty(table.value(i, "middlename")).map(|v| title_case(&v)),
            ssn: non_empty(table.value(i, "ssn")),
            phonenumber,
            gender: non_empty(table.value(i, "gender")),
            dateofbirth,
            address: non_empty(table.value(i, "address")),
            modifieddate,
            insurance: non_empty(table.value(i, "insurance")),
            email,
            email_valid,
            age: dateofbirth.map(|dob| calculate_age(dob, run_date)),
            year: modifieddate.map(|d| d.year()),
            month: modifieddate.map(|d| d.month()),
            quarter: modifieddate.map(|d| quarter_of(d.month())),
            weekday: modifieddate.map(|d| d.format("%A").to_string()),
            data_quality_flag: flags.join(", "),
        });
    }

    info!(
        "Cleaned patients: {} kept, {} excluded, {} flagged",
        rows.len(),
        excluded,
        flagged
    );
    CleanReport {
        rows,
        excluded,
        flagged,
    }
}

fn parse_amount(raw: &str) -> Option<f64> {
    let trimmed = raw.trim().replace(['$', ','], "");
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse().ok()
}

/// Paid-vs-billed categorization used by the revenue reports.
pub fn categorize_payment(claim_amount: Option<f64>, paid_amount: Option<f64>) -> &'static str {
    match paid_amount {
        None => "Pending",
        Some(paid) if paid == 0.0 => "Denied",
        Some(paid) => match claim_amount {
            Some(claim) if paid < claim => "Partial",
            _ => "Paid",
        },
    }
}

/// Clean one extracted claims table. Rows missing `claimid` are excluded
/// and counted; everything else is flagged and retained.
#[instrument(skip(raw), fields(input = %input_name))]
pub fn clean_claims(raw: &RawTable, input_name: &str) -> CleanReport<CleanClaim> {
    let mut table = raw.clone();
    table.normalize_columns();
    table.ensure_columns(&[
        "claimid",
        "patientid",
        "providerid",
        "claimamount",
        "paidamount",
        "claimstatus",
        "claimdate",
    ]);

    let mut rows = Vec::new();
    let mut excluded = 0usize;
    let mut flagged = 0usize;

    for i in 0..table.len() {
        let claimid = table.value(i, "claimid").trim().to_string();
        if claimid.is_empty() {
            excluded += 1;
            continue;
        }

        let mut flags: Vec<&str> = Vec::new();

        let claim_amount = parse_amount(table.value(i, "claimamount"));
        let paid_amount = parse_amount(table.value(i, "paidamount"));

        let raw_date = table.value(i, "claimdate");
        let claim_date = parse_flexible_date(raw_date);
        if !raw_date.trim().is_empty() && claim_date.is_none() {
            flags.push("Invalid Date");
        }

        let insurance_coverage_pct = match (claim_amount, paid_amount) {
            (Some(claim), Some(paid)) if claim != 0.0 => Some(paid / claim * 100.0),
            _ => None,
        };

        if !flags.is_empty() {
            flagged += 1;
        }

        rows.push(CleanClaim {
            claimid,
            patientid: non_empty(table.value(i, "patientid")),
            providerid: non_empty(table.value(i, "providerid")),
            claim_amount,
            paid_amount,
            claim_status: non_empty(table.value(i, "claimstatus")),
            payment_category: categorize_payment(claim_amount, paid_amount).to_string(),
            insurance_coverage_pct,
            claim_date,
            year: claim_date.map(|d| d.year()),
            month: claim_date.map(|d| d.month()),
            quarter: claim_date.map(|d| quarter_of(d.month())),
            weekday: claim_date.map(|d| d.format("%A").to_string()),
            data_quality_flag: flags.join(", "),
        });
    }

    if excluded > 0 {
        warn!("{}: excluded {} rows without claimid", input_name, excluded);
    }
    info!(
        "Cleaned claims from {}: {} kept, {} excluded, {} flagged",
        input_name,
        rows.len(),
        excluded,
        flagged
    );
    CleanReport {
        rows,
        excluded,
        flagged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn phone_cleaning_keeps_ten_plus_digits() {
        assert_eq!(clean_phone("(206) 555-0111"), Some("2065550111".to_string()));
        assert_eq!(clean_phone("555-0111"), None);
        assert_eq!(clean_phone(""), None);
    }

    #[test]
    fn email_validation_is_syntactic() {
        assert!(is_valid_email("amy@example.com"));
        assert!(!is_valid_email("amy@example"));
        assert!(!is_valid_email("not-an-email"));
    }

    #[test]
    fn flexible_date_parses_common_shapes() {
        assert_eq!(parse_flexible_date("1990-01-02"), Some(d("1990-01-02")));
        assert_eq!(parse_flexible_date("01/02/1990"), Some(d("1990-01-02")));
        assert_eq!(
            parse_flexible_date("2024-05-01 13:00:00"),
            Some(d("2024-05-01"))
        );
        assert_eq!(parse_flexible_date("not a date"), None);
        assert_eq!(parse_flexible_date(""), None);
    }

    #[test]
    fn age_uses_the_run_date() {
        assert_eq!(calculate_age(d("1990-06-15"), d("2025-06-14")), 34);
        assert_eq!(calculate_age(d("1990-06-15"), d("2025-06-16")), 35);
    }

    #[test]
    fn payment_categorization() {
        assert_eq!(categorize_payment(Some(100.0), None), "Pending");
        assert_eq!(categorize_payment(Some(100.0), Some(0.0)), "Denied");
        assert_eq!(categorize_payment(Some(100.0), Some(40.0)), "Partial");
        assert_eq!(categorize_payment(Some(100.0), Some(100.0)), "Paid");
        assert_eq!(categorize_payment(None, Some(50.0)), "Paid");
    }

    fn patient_table() -> RawTable {
        let mut t = RawTable::new(
            ["ID", "F_Name", "L_Name", "DOB", "Email", "PhoneNumber"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        t.push_row(
            ["1", "amy", "POND", "1990-01-01", "amy@example.com", "206-555-0111"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        t.push_row(
            ["1", "amy", "POND", "1990-01-01", "", ""]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        t.push_row(
            ["2", "rory", "williams", "1989-12-31", "rory@@bad", "123"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        t.push_row(
            ["", "amelia", "", "", "", ""]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        t
    }

    #[test]
    fn patients_dedup_keep_first_and_exclude_missing_keys() {
        let report = clean_patients(&patient_table(), d("2025-06-01"));
        assert_eq!(report.rows.len(), 2);
        assert_eq!(report.excluded, 2);
        assert_eq!(report.rows[0].patientid, "1");
        // First occurrence kept its populated contact fields.
        assert!(report.rows[0].email_valid);
        assert_eq!(report.rows[0].phonenumber.as_deref(), Some("2065550111"));
    }

    #[test]
    fn patients_flag_bad_rows_but_keep_them() {
        let report = clean_patients(&patient_table(), d("2025-06-01"));
        let rory = &report.rows[1];
        assert_eq!(rory.firstname.as_deref(), Some("Rory"));
        assert_eq!(rory.lastname.as_deref(), Some("Williams"));
        assert!(!rory.email_valid);
        assert_eq!(rory.phonenumber, None);
        assert_eq!(rory.data_quality_flag, "Invalid Email, Invalid Phone");
        assert_eq!(rory.age, Some(35));
    }

    #[test]
    fn claims_derive_coverage_and_category() {
        let mut t = RawTable::new(
            ["ClaimID", "PatientID", "ClaimAmount", "PaidAmount", "ClaimStatus", "ClaimDate"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        t.push_row(
            ["C1", "1", "200", "50", "Submitted", "2024-03-05"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        t.push_row(
            ["", "2", "100", "", "", ""]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );

        let report = clean_claims(&t, "hospital1_claim_data.csv");
        assert_eq!(report.rows.len(), 1);
        assert_eq!(report.excluded, 1);

        let row = &report.rows[0];
        assert_eq!(row.payment_category, "Partial");
        assert_eq!(row.insurance_coverage_pct, Some(25.0));
        assert_eq!(row.quarter, Some(1));
        assert_eq!(row.weekday.as_deref(), Some("Tuesday"));
    }
}
