use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use tracing::{info, instrument, warn};

use crate::clean::{parse_flexible_date, CleanClaim, CleanPatient};
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::scd::PatientSnapshot;
use crate::store;
use crate::table::RawTable;

/// Calendar dimension row; `date_key` is the YYYYMMDD integer form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DimDateRow {
    pub date_key: i64,
    pub date_value: NaiveDate,
    pub day: u32,
    pub month: u32,
    pub year: i32,
    pub quarter: u32,
    pub day_name: String,
    pub month_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DimProviderRow {
    pub provider_key: u64,
    pub provider_id: String,
    pub provider_name: String,
    pub specialty: Option<String>,
    pub department: Option<String>,
    pub npi: Option<String>,
}

/// Procedure dimension keyed by the CPT code itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DimProcedureRow {
    pub procedure_key: String,
    pub description: String,
}

/// Claim fact. `patient_key`/`provider_key` carry the renamed natural keys
/// unresolved (known limitation of the builder); `date_key` is derivable
/// without a lookup and is the real YYYYMMDD calendar key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactClaimRow {
    pub claim_key: u64,
    pub claim_id: String,
    pub patient_key: Option<String>,
    pub provider_key: Option<String>,
    pub date_key: Option<i64>,
    pub claim_amount: Option<f64>,
    pub paid_amount: Option<f64>,
    pub claim_status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactTransactionRow {
    pub transaction_key: u64,
    pub patient_key: Option<String>,
    pub provider_key: Option<String>,
    pub procedure_key: Option<String>,
    pub date: Option<NaiveDate>,
    pub amount: Option<f64>,
    pub payment_status: Option<String>,
}

pub fn date_key_of(date: NaiveDate) -> i64 {
    date.year() as i64 * 10_000 + date.month() as i64 * 100 + date.day() as i64
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

const PROVIDER_REQUIRED: &[&str] = &[
    "providerid",
    "firstname",
    "lastname",
    "specialization",
    "deptid",
    "npi",
];

/// Provider dimension from the extracted provider union.
#[instrument(skip(raw))]
pub fn build_dim_providers(raw: &RawTable) -> Result<Vec<DimProviderRow>> {
    let mut table = raw.clone();
    table.normalize_columns();
    let missing = table.missing_columns(PROVIDER_REQUIRED);
    if !missing.is_empty() {
        return Err(PipelineError::Schema {
            input: "providers".to_string(),
            message: format!("missing required columns: {}", missing.join(", ")),
        });
    }

    let mut rows = Vec::with_capacity(table.len());
    for i in 0..table.len() {
        let provider_id = table.value(i, "providerid").trim().to_string();
        if provider_id.is_empty() {
            continue;
        }
        let provider_name = format!(
            "{} {}",
            table.value(i, "firstname").trim(),
            table.value(i, "lastname").trim()
        )
        .trim()
        .to_string();
        rows.push(DimProviderRow {
            provider_key: rows.len() as u64 + 1,
            provider_id,
            provider_name,
            specialty: non_empty(table.value(i, "specialization")),
            department: non_empty(table.value(i, "deptid")),
            npi: non_empty(table.value(i, "npi")),
        });
    }
    info!("Built dim_providers with {} rows", rows.len());
    Ok(rows)
}

/// Procedure dimension from the CPT reference CSV.
#[instrument(skip(raw))]
pub fn build_dim_procedures(raw: &RawTable) -> Result<Vec<DimProcedureRow>> {
    let mut table = raw.clone();
    table.normalize_columns();
    let missing = table.missing_columns(&["cpt codes", "procedure code descriptions"]);
    if !missing.is_empty() {
        return Err(PipelineError::Schema {
            input: "cpt codes".to_string(),
            message: format!("missing required columns: {}", missing.join(", ")),
        });
    }

    let mut seen = BTreeSet::new();
    let mut rows = Vec::new();
    for i in 0..table.len() {
        let code = table.value(i, "cpt codes").trim().to_string();
        let description = table.value(i, "procedure code descriptions").trim().to_string();
        if code.is_empty() {
            continue;
        }
        if seen.insert((code.clone(), description.clone())) {
            rows.push(DimProcedureRow {
                procedure_key: code,
                description,
            });
        }
    }
    info!("Built dim_procedures with {} rows", rows.len());
    Ok(rows)
}

/// Claim facts from the cleaned claim rows, surrogate keys dense from 1.
pub fn build_fact_claims(claims: &[CleanClaim]) -> Vec<FactClaimRow> {
    claims
        .iter()
        .enumerate()
        .map(|(i, claim)| FactClaimRow {
            claim_key: i as u64 + 1,
            claim_id: claim.claimid.clone(),
            patient_key: claim.patientid.clone(),
            provider_key: claim.providerid.clone(),
            date_key: claim.claim_date.map(date_key_of),
            claim_amount: claim.claim_amount,
            paid_amount: claim.paid_amount,
            claim_status: claim.claim_status.clone(),
        })
        .collect()
}

const TRANSACTION_REQUIRED: &[&str] = &[
    "transactionid",
    "patientid",
    "providerid",
    "procedurecode",
    "paiddate",
    "paidamount",
    "amounttype",
];

/// Transaction facts from the extracted transaction union.
#[instrument(skip(raw))]
pub fn build_fact_transactions(raw: &RawTable) -> Result<Vec<FactTransactionRow>> {
    let mut table = raw.clone();
    table.normalize_columns();
    let missing = table.missing_columns(TRANSACTION_REQUIRED);
    if !missing.is_empty() {
        return Err(PipelineError::Schema {
            input: "transactions".to_string(),
            message: format!("missing required columns: {}", missing.join(", ")),
        });
    }

    let mut rows = Vec::with_capacity(table.len());
    for i in 0..table.len() {
        rows.push(FactTransactionRow {
            transaction_key: i as u64 + 1,
            patient_key: non_empty(table.value(i, "patientid")),
            provider_key: non_empty(table.value(i, "providerid")),
            procedure_key: non_empty(table.value(i, "procedurecode")),
            date: parse_flexible_date(table.value(i, "paiddate")),
            amount: table.value(i, "paidamount").trim().parse().ok(),
            payment_status: non_empty(table.value(i, "amounttype")),
        });
    }
    info!("Built fact_transactions with {} rows", rows.len());
    Ok(rows)
}

/// Calendar dimension: the distinct union of every date seen across the
/// fact sources, sorted ascending.
pub fn build_dim_date<I>(dates: I) -> Vec<DimDateRow>
where
    I: IntoIterator<Item = NaiveDate>,
{
    let distinct: BTreeSet<NaiveDate> = dates.into_iter().collect();
    distinct
        .into_iter()
        .map(|date| DimDateRow {
            date_key: date_key_of(date),
            date_value: date,
            day: date.day(),
            month: date.month(),
            year: date.year(),
            quarter: (date.month() - 1) / 3 + 1,
            day_name: date.format("%A").to_string(),
            month_name: date.format("%B").to_string(),
        })
        .collect()
}

/// Patient snapshots for the SCD stage, with the same fill-ins and
/// essential-field exclusions the warehouse model requires: names default
/// to Unknown, gender to Other; rows without a date of birth are excluded
/// and counted (the natural-key check belongs to the SCD engine itself).
pub fn build_patient_snapshots(patients: &[CleanPatient]) -> (Vec<PatientSnapshot>, usize) {
    let mut excluded = 0usize;
    let mut snapshots = Vec::with_capacity(patients.len());
    for patient in patients {
        if patient.dateofbirth.is_none() {
            excluded += 1;
            continue;
        }
        snapshots.push(PatientSnapshot {
            patient_id: patient.patientid.clone(),
            first_name: Some(
                patient
                    .firstname
                    .clone()
                    .unwrap_or_else(|| "Unknown".to_string()),
            ),
            last_name: Some(
                patient
                    .lastname
                    .clone()
                    .unwrap_or_else(|| "Unknown".to_string()),
            ),
            gender: Some(patient.gender.clone().unwrap_or_else(|| "Other".to_string())),
            date_of_birth: patient.dateofbirth,
            insurance: patient.insurance.clone(),
        });
    }
    if excluded > 0 {
        warn!("Excluded {} patients without a date of birth", excluded);
    }
    (snapshots, excluded)
}

/// Per-table outcomes for the build stage; one failing table does not
/// abort the others.
#[derive(Debug, Default)]
pub struct BuildReport {
    pub built: Vec<(String, usize)>,
    pub failed: Vec<(String, String)>,
}

impl BuildReport {
    fn record<T>(&mut self, table: &str, result: Result<Vec<T>>) -> Option<Vec<T>> {
        match result {
            Ok(rows) => {
                self.built.push((table.to_string(), rows.len()));
                Some(rows)
            }
            Err(e) => {
                warn!("Skipping {}: {}", table, e);
                self.failed.push((table.to_string(), e.to_string()));
                None
            }
        }
    }
}

/// Run the dimensional build stage: read extract/clean outputs, write the
/// dim and fact tables (except dim_patients, which the SCD stage owns).
pub fn run_build(config: &Config) -> Result<BuildReport> {
    let extract_dir = config.outputs.extract_dir();
    let clean_dir = config.outputs.clean_dir();
    let dim_dir = config.outputs.dim_dir();
    let fact_dir = config.outputs.fact_dir();
    fs::create_dir_all(&dim_dir)?;
    fs::create_dir_all(&fact_dir)?;

    let mut report = BuildReport::default();

    // dim_providers
    let providers = RawTable::from_csv_path(&extract_dir.join("providers_extracted.csv"))
        .and_then(|raw| build_dim_providers(&raw));
    if let Some(rows) = report.record("dim_providers", providers) {
        store::write_csv_atomic(&dim_dir.join("dim_providers.csv"), &rows)?;
    }

    // dim_procedures
    let procedures = RawTable::from_csv_path(&config.sources.cpt_codes)
        .and_then(|raw| build_dim_procedures(&raw));
    if let Some(rows) = report.record("dim_procedures", procedures) {
        store::write_csv_atomic(&dim_dir.join("dim_procedures.csv"), &rows)?;
    }

    // fact_transactions
    let transactions_raw = RawTable::from_csv_path(&extract_dir.join("transactions_extracted.csv"));
    let mut transaction_dates: Vec<NaiveDate> = Vec::new();
    let transactions = transactions_raw.and_then(|raw| build_fact_transactions(&raw));
    if let Some(rows) = report.record("fact_transactions", transactions) {
        transaction_dates.extend(rows.iter().filter_map(|r| r.date));
        store::write_csv_atomic(&fact_dir.join("fact_transactions.csv"), &rows)?;
    }

    // fact_claims
    let claims: Result<Vec<CleanClaim>> = store::read_csv(&clean_dir.join("cleaned_claims.csv"));
    let mut claim_dates: Vec<NaiveDate> = Vec::new();
    let fact_claims = claims.map(|cleaned| {
        claim_dates.extend(cleaned.iter().filter_map(|c| c.claim_date));
        build_fact_claims(&cleaned)
    });
    if let Some(rows) = report.record("fact_claims", fact_claims) {
        store::write_csv_atomic(&fact_dir.join("fact_claims.csv"), &rows)?;
    }

    // dim_date over every date either fact source produced
    let dim_date = build_dim_date(transaction_dates.into_iter().chain(claim_dates));
    report.built.push(("dim_date".to_string(), dim_date.len()));
    store::write_csv_atomic(&dim_dir.join("dim_date.csv"), &dim_date)?;

    info!(
        "Build stage finished: {} tables built, {} skipped",
        report.built.len(),
        report.failed.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn date_keys_are_yyyymmdd() {
        assert_eq!(date_key_of(d("2024-03-05")), 20240305);
        assert_eq!(date_key_of(d("1999-12-31")), 19991231);
    }

    #[test]
    fn dim_date_is_distinct_sorted_union() {
        let rows = build_dim_date(vec![
            d("2024-03-05"),
            d("2024-01-01"),
            d("2024-03-05"),
        ]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].date_key, 20240101);
        assert_eq!(rows[0].quarter, 1);
        assert_eq!(rows[0].day_name, "Monday");
        assert_eq!(rows[0].month_name, "January");
        assert_eq!(rows[1].date_key, 20240305);
    }

    #[test]
    fn providers_require_their_columns() {
        let raw = RawTable::new(vec!["providerid".to_string()]);
        assert!(build_dim_providers(&raw).is_err());
    }

    #[test]
    fn provider_rows_get_dense_keys_and_joined_names() {
        let mut raw = RawTable::new(
            ["ProviderID", "FirstName", "LastName", "Specialization", "DeptID", "NPI"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        raw.push_row(
            ["P1", "Martha", "Jones", "Cardiology", "D2", "1234567890"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        raw.push_row(
            ["P2", "Harold", "Saxon", "", "", ""]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );

        let rows = build_dim_providers(&raw).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].provider_key, 1);
        assert_eq!(rows[1].provider_key, 2);
        assert_eq!(rows[0].provider_name, "Martha Jones");
        assert_eq!(rows[1].specialty, None);
    }

    #[test]
    fn procedures_deduplicate() {
        let mut raw = RawTable::new(
            ["CPT Codes", "Procedure Code Descriptions"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        for _ in 0..2 {
            raw.push_row(vec!["99213".to_string(), "Office visit".to_string()]);
        }
        raw.push_row(vec!["99214".to_string(), "Extended visit".to_string()]);

        let rows = build_dim_procedures(&raw).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].procedure_key, "99213");
    }

    #[test]
    fn snapshots_exclude_missing_dob_and_fill_defaults() {
        let base = CleanPatient {
            patientid: "1".to_string(),
            firstname: None,
            lastname: Some("Pond".to_string()),
            middlename: None,
            ssn: None,
            phonenumber: None,
            gender: None,
            dateofbirth: Some(d("1990-01-01")),
            address: None,
            modifieddate: None,
            insurance: Some("X".to_string()),
            email: None,
            email_valid: false,
            age: None,
            year: None,
            month: None,
            quarter: None,
            weekday: None,
            data_quality_flag: String::new(),
        };
        let mut no_dob = base.clone();
        no_dob.patientid = "2".to_string();
        no_dob.dateofbirth = None;

        let (snapshots, excluded) = build_patient_snapshots(&[base, no_dob]);
        assert_eq!(excluded, 1);
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].first_name.as_deref(), Some("Unknown"));
        assert_eq!(snapshots[0].gender.as_deref(), Some("Other"));
        assert_eq!(snapshots[0].last_name.as_deref(), Some("Pond"));
    }
}
