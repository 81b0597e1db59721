use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use std::fs;
use std::path::Path;
use tracing::{error, info, instrument, warn};

use crate::config::{Config, SourcesConfig};
use crate::error::{PipelineError, Result};
use crate::table::RawTable;

/// Column renames applied to each hospital's patients table so both
/// sources land on the same canonical schema.
const PATIENT_RENAMES: &[(&str, &str)] = &[
    ("id", "patientid"),
    ("f_name", "firstname"),
    ("l_name", "lastname"),
    ("m_name", "middlename"),
    ("dob", "dateofbirth"),
    ("phone_number", "phonenumber"),
];

const PATIENT_COLUMNS: &[&str] = &[
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
];

const CLAIM_REQUIRED: &[&str] = &[
    "claimid",
    "patientid",
    "claimamount",
    "paidamount",
    "claimstatus",
];

/// One hospital's operational database.
pub struct SourceDatabase {
    pub key: String,
    conn: Connection,
}

impl SourceDatabase {
    pub fn open(key: &str, path: &Path) -> Result<Self> {
        // Read-only so a missing database file fails here instead of
        // being silently created empty.
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            key: key.to_string(),
            conn,
        })
    }

    /// Full-table read into a `RawTable`, every value stringified.
    fn read_table(&self, table: &str) -> Result<RawTable> {
        let mut stmt = self.conn.prepare(&format!("SELECT * FROM {table}"))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let width = columns.len();

        let mut out = RawTable::new(columns);
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                let value = match row.get_ref(i)? {
                    ValueRef::Null => String::new(),
                    ValueRef::Integer(v) => v.to_string(),
                    ValueRef::Real(v) => v.to_string(),
                    ValueRef::Text(v) => String::from_utf8_lossy(v).into_owned(),
                    ValueRef::Blob(_) => String::new(),
                };
                values.push(value);
            }
            out.push_row(values);
        }
        Ok(out)
    }

    pub fn read_patients(&self) -> Result<RawTable> {
        let mut table = self.read_table("patients")?;
        table.normalize_columns();
        table.rename_columns(PATIENT_RENAMES);
        // The natural key must come from the source itself; the other
        // canonical columns may be synthesized empty below.
        if table.column_index("patientid").is_none() {
            return Err(PipelineError::Schema {
                input: format!("{} patients", self.key),
                message: "no 'patientid' column after renames".to_string(),
            });
        }
        table.ensure_columns(PATIENT_COLUMNS);
        table.push_constant_column("source_hospital", &self.key);
        Ok(table)
    }

    pub fn read_providers(&self) -> Result<RawTable> {
        let mut table = self.read_table("providers")?;
        table.normalize_columns();
        table.push_constant_column("source_hospital", &self.key);
        Ok(table)
    }

    pub fn read_transactions(&self) -> Result<RawTable> {
        let mut table = self.read_table("transactions")?;
        table.normalize_columns();
        table.push_constant_column("source_hospital", &self.key);
        Ok(table)
    }
}

/// Reads from both hospital databases, isolating per-source failures:
/// an unreachable hospital is logged and skipped, the other proceeds.
pub struct Extractor {
    sources: Vec<SourceDatabase>,
}

impl Extractor {
    pub fn connect(config: &SourcesConfig) -> Self {
        let mut sources = Vec::new();
        for (key, path) in config.hospitals() {
            match SourceDatabase::open(key, path) {
                Ok(db) => {
                    info!("Connected to {}", key);
                    sources.push(db);
                }
                Err(e) => {
                    error!("Connection failed for {}: {}", key, e);
                }
            }
        }
        Self { sources }
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    fn extract_union<F>(&self, what: &str, read: F) -> RawTable
    where
        F: Fn(&SourceDatabase) -> Result<RawTable>,
    {
        let mut parts = Vec::new();
        for db in &self.sources {
            match read(db) {
                Ok(table) => {
                    info!("Extracted {} {} from {}", table.len(), what, db.key);
                    parts.push(table);
                }
                Err(e) => {
                    error!("Failed to extract {} from {}: {}", what, db.key, e);
                }
            }
        }
        RawTable::concat(parts)
    }

    /// Union of both hospitals' patients plus a cross-hospital
    /// `unified_patient_id` ("A-<id>" / "B-<id>").
    #[instrument(skip(self))]
    pub fn extract_patients(&self) -> Result<RawTable> {
        let mut combined = self.extract_union("patients", SourceDatabase::read_patients);
        if combined.is_empty() {
            return Ok(combined);
        }

        let unified: Vec<String> = (0..combined.len())
            .map(|i| {
                let source = combined
                    .value(i, "source_hospital")
                    .trim_start_matches("hospital_")
                    .to_uppercase();
                format!("{}-{}", source, combined.value(i, "patientid"))
            })
            .collect();
        combined.push_column("unified_patient_id", unified);
        info!("Created 'unified_patient_id' for patients across hospitals");
        Ok(combined)
    }

    pub fn extract_providers(&self) -> RawTable {
        self.extract_union("providers", SourceDatabase::read_providers)
    }

    pub fn extract_transactions(&self) -> RawTable {
        self.extract_union("transactions", SourceDatabase::read_transactions)
    }
}

/// Extract every claim flat file in the directory. A file missing required
/// columns is skipped and reported; the others still land.
#[instrument(skip_all)]
pub fn extract_claims(claims_dir: &Path, out_dir: &Path) -> Result<ClaimFilesReport> {
    fs::create_dir_all(out_dir)?;
    let mut report = ClaimFilesReport::default();

    let mut entries: Vec<_> = fs::read_dir(claims_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|x| x == "csv").unwrap_or(false))
        .collect();
    entries.sort();

    for path in entries {
        let name = path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "claims".to_string());
        match extract_claim_file(&path) {
            Ok(table) => {
                let out = out_dir.join(format!("{name}_extracted.csv"));
                table.write_csv(&out)?;
                info!("Extracted and saved {} claims to {}", table.len(), out.display());
                report.extracted.push(name);
            }
            Err(e) => {
                error!("Error reading {}: {}", path.display(), e);
                report.skipped.push((name, e.to_string()));
            }
        }
    }
    Ok(report)
}

fn extract_claim_file(path: &Path) -> Result<RawTable> {
    let mut table = RawTable::from_csv_path(path)?;
    table.normalize_columns();
    let missing = table.missing_columns(CLAIM_REQUIRED);
    if !missing.is_empty() {
        return Err(PipelineError::Schema {
            input: path.display().to_string(),
            message: format!("missing required columns: {}", missing.join(", ")),
        });
    }
    Ok(table)
}

#[derive(Debug, Default)]
pub struct ClaimFilesReport {
    pub extracted: Vec<String>,
    pub skipped: Vec<(String, String)>,
}

/// Stage counts reported back to the orchestrator.
#[derive(Debug, Default)]
pub struct ExtractReport {
    pub sources_connected: usize,
    pub patients: usize,
    pub providers: usize,
    pub transactions: usize,
    pub claim_files: usize,
    pub claim_files_skipped: usize,
}

/// Run the extraction stage end to end, writing the extract outputs.
pub fn run_extract(config: &Config) -> Result<ExtractReport> {
    let out_dir = config.outputs.extract_dir();
    fs::create_dir_all(&out_dir)?;

    let extractor = Extractor::connect(&config.sources);
    if extractor.source_count() == 0 {
        warn!("No hospital databases reachable; extraction will only cover claim files");
    }

    let patients = extractor.extract_patients()?;
    let providers = extractor.extract_providers();
    let transactions = extractor.extract_transactions();

    patients.write_csv(&out_dir.join("patients_extracted.csv"))?;
    providers.write_csv(&out_dir.join("providers_extracted.csv"))?;
    transactions.write_csv(&out_dir.join("transactions_extracted.csv"))?;

    let claims = extract_claims(&config.sources.claims_dir, &out_dir)?;

    info!("All data extracted and saved to: {}", out_dir.display());
    Ok(ExtractReport {
        sources_connected: extractor.source_count(),
        patients: patients.len(),
        providers: providers.len(),
        transactions: transactions.len(),
        claim_files: claims.extracted.len(),
        claim_files_skipped: claims.skipped.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use tempfile::tempdir;

    #[test]
    fn patients_without_an_id_column_are_a_schema_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hospital.db");
        let setup = Connection::open(&path).unwrap();
        setup
            .execute_batch(
                "CREATE TABLE patients (FirstName TEXT, LastName TEXT);
                 INSERT INTO patients VALUES ('Ann', 'Smith');",
            )
            .unwrap();
        drop(setup);

        let db = SourceDatabase::open("hospital_a", &path).unwrap();
        let err = db.read_patients().unwrap_err();
        assert!(matches!(err, PipelineError::Schema { .. }));
    }

    #[test]
    fn legacy_id_column_renames_to_the_natural_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hospital.db");
        let setup = Connection::open(&path).unwrap();
        setup
            .execute_batch(
                "CREATE TABLE patients (ID INTEGER, F_Name TEXT);
                 INSERT INTO patients VALUES (101, 'Ann');",
            )
            .unwrap();
        drop(setup);

        let db = SourceDatabase::open("hospital_a", &path).unwrap();
        let table = db.read_patients().unwrap();
        assert_eq!(table.value(0, "patientid"), "101");
        assert_eq!(table.value(0, "firstname"), "Ann");
    }
}
