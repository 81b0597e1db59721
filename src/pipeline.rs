use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::fs;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::clean::{self, CleanPatient};
use crate::config::Config;
use crate::error::Result;
use crate::extract;
use crate::scd::{self, DimPatient};
use crate::star;
use crate::store;
use crate::table::RawTable;
use crate::warehouse;

/// Result of cleaning both input families.
#[derive(Debug, Default)]
pub struct CleanStageReport {
    pub patients: usize,
    pub patients_excluded: usize,
    pub claims: usize,
    pub claims_excluded: usize,
    pub flagged: usize,
}

/// Run the cleaning stage over the extract outputs.
#[instrument(skip(config))]
pub fn run_clean(config: &Config, run_date: NaiveDate) -> Result<CleanStageReport> {
    let extract_dir = config.outputs.extract_dir();
    let clean_dir = config.outputs.clean_dir();
    fs::create_dir_all(&clean_dir)?;

    let mut report = CleanStageReport::default();

    let raw_patients = RawTable::from_csv_path(&extract_dir.join("patients_extracted.csv"))?;
    let patients = clean::clean_patients(&raw_patients, run_date);
    store::write_csv_atomic(&clean_dir.join("cleaned_patients.csv"), &patients.rows)?;
    report.patients = patients.rows.len();
    report.patients_excluded = patients.excluded;
    report.flagged += patients.flagged;

    // Every claims file the extractor produced, cleaned into one table.
    let mut all_claims = Vec::new();
    let mut entries: Vec<_> = fs::read_dir(&extract_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            let name = p
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            name.ends_with("_extracted.csv")
                && !matches!(
                    name.as_str(),
                    "patients_extracted.csv"
                        | "providers_extracted.csv"
                        | "transactions_extracted.csv"
                )
        })
        .collect();
    entries.sort();
    for path in entries {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let raw = RawTable::from_csv_path(&path)?;
        let cleaned = clean::clean_claims(&raw, &name);
        report.claims += cleaned.rows.len();
        report.claims_excluded += cleaned.excluded;
        report.flagged += cleaned.flagged;
        all_claims.extend(cleaned.rows);
    }
    store::write_csv_atomic(&clean_dir.join("cleaned_claims.csv"), &all_claims)?;

    info!(
        "Clean stage finished: {} patients, {} claims",
        report.patients, report.claims
    );
    Ok(report)
}

/// Counts from one SCD run over the patient dimension.
#[derive(Debug, Default)]
pub struct ScdStageReport {
    pub inserted: usize,
    pub superseded: usize,
    pub unchanged: usize,
    pub rejected: usize,
    pub snapshot_excluded: usize,
    pub table_rows: usize,
}

/// Run the SCD Type 2 stage for dim_patients: read the stored dimension
/// and the cleaned snapshot batch, reconcile, and atomically replace the
/// stored table. Rejects are reported separately, never loaded.
#[instrument(skip(config))]
pub fn run_scd(config: &Config, run_date: NaiveDate) -> Result<ScdStageReport> {
    let clean_dir = config.outputs.clean_dir();
    let dim_path = config.outputs.dim_dir().join("dim_patients.csv");

    let cleaned: Vec<CleanPatient> = store::read_csv(&clean_dir.join("cleaned_patients.csv"))?;
    let (snapshots, snapshot_excluded) = star::build_patient_snapshots(&cleaned);
    let existing: Vec<DimPatient> = store::read_csv_or_empty(&dim_path)?;

    let outcome = scd::run(&existing, &snapshots, run_date);

    if !outcome.rejects.is_empty() {
        let reject_dir = config.outputs.reject_dir();
        fs::create_dir_all(&reject_dir)?;
        let reject_path = reject_dir.join("scd_rejects.json");
        let file = fs::File::create(&reject_path)?;
        serde_json::to_writer_pretty(file, &outcome.rejects)?;
        info!(
            "Wrote {} rejected snapshots to {}",
            outcome.rejects.len(),
            reject_path.display()
        );
    }

    store::write_csv_atomic(&dim_path, &outcome.table)?;

    Ok(ScdStageReport {
        inserted: outcome.inserted,
        superseded: outcome.superseded,
        unchanged: outcome.unchanged,
        rejected: outcome.rejects.len(),
        snapshot_excluded,
        table_rows: outcome.table.len(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Extract,
    Clean,
    Build,
    Scd,
    Load,
}

#[derive(Debug, Clone, Serialize)]
pub enum StageStatus {
    Completed,
    Failed,
}

/// One stage's outcome within a full run.
#[derive(Debug, Serialize)]
pub struct StageOutcome {
    pub stage: Stage,
    pub status: StageStatus,
    pub detail: String,
}

/// Record of one full pipeline run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub run_date: NaiveDate,
    pub stages: Vec<StageOutcome>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.stages
            .iter()
            .all(|s| matches!(s.status, StageStatus::Completed))
    }
}

fn record(stages: &mut Vec<StageOutcome>, stage: Stage, result: Result<String>) {
    match result {
        Ok(detail) => {
            info!("Stage {:?} completed: {}", stage, detail);
            stages.push(StageOutcome {
                stage,
                status: StageStatus::Completed,
                detail,
            });
        }
        Err(e) => {
            error!("Stage {:?} failed: {}", stage, e);
            stages.push(StageOutcome {
                stage,
                status: StageStatus::Failed,
                detail: e.to_string(),
            });
        }
    }
}

/// Run every stage in sequence. A failed stage is recorded and the run
/// moves on; later stages operate on whatever inputs exist, so a rerun
/// after a partial failure picks up where the data allows.
pub async fn run_all(config: &Config, run_date: NaiveDate) -> RunReport {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    info!("Starting pipeline run {} for {}", run_id, run_date);

    let mut stages = Vec::new();

    record(
        &mut stages,
        Stage::Extract,
        extract::run_extract(config).map(|r| {
            format!(
                "{} patients, {} providers, {} transactions, {} claim files ({} skipped)",
                r.patients, r.providers, r.transactions, r.claim_files, r.claim_files_skipped
            )
        }),
    );

    record(
        &mut stages,
        Stage::Clean,
        run_clean(config, run_date).map(|r| {
            format!(
                "{} patients ({} excluded), {} claims ({} excluded), {} flagged",
                r.patients, r.patients_excluded, r.claims, r.claims_excluded, r.flagged
            )
        }),
    );

    record(
        &mut stages,
        Stage::Build,
        star::run_build(config).map(|r| {
            let built: Vec<String> = r
                .built
                .iter()
                .map(|(t, n)| format!("{t}={n}"))
                .collect();
            if r.failed.is_empty() {
                built.join(", ")
            } else {
                let failed: Vec<String> =
                    r.failed.iter().map(|(t, _)| t.clone()).collect();
                format!("{}; skipped: {}", built.join(", "), failed.join(", "))
            }
        }),
    );

    record(
        &mut stages,
        Stage::Scd,
        run_scd(config, run_date).map(|r| {
            format!(
                "{} inserted, {} superseded, {} unchanged, {} rejected, table={} rows",
                r.inserted, r.superseded, r.unchanged, r.rejected, r.table_rows
            )
        }),
    );

    let load_result = match warehouse::from_config(&config.warehouse) {
        Ok(wh) => {
            let tables = warehouse::final_tables(config);
            let report = warehouse::run_load(wh.as_ref(), &tables).await;
            if report.failed.is_empty() {
                Ok(format!("{} tables loaded", report.loaded.len()))
            } else {
                let failed: Vec<String> =
                    report.failed.iter().map(|(t, _)| t.clone()).collect();
                Ok(format!(
                    "{} tables loaded, failed: {}",
                    report.loaded.len(),
                    failed.join(", ")
                ))
            }
        }
        Err(e) => Err(e),
    };
    record(&mut stages, Stage::Load, load_result);

    let report = RunReport {
        run_id,
        started_at,
        run_date,
        stages,
    };
    info!(
        "Pipeline run {} finished ({})",
        run_id,
        if report.succeeded() { "ok" } else { "with failures" }
    );
    report
}
