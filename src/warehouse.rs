use async_trait::async_trait;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{error, info, instrument};

use crate::config::{Config, WarehouseBackend, WarehouseConfig};
use crate::error::{PipelineError, Result};

/// Outcome of one table load.
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub table: String,
    pub rows: usize,
}

/// A warehouse target. Every load fully replaces the table's contents or
/// fails leaving the previous contents in place.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn load_table(&self, table: &str, csv_path: &Path) -> Result<LoadReport>;
}

/// Column affinity inferred from the file header plus type sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
}

impl ColumnType {
    fn sql(self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
        }
    }
}

/// Sample up to `sample` rows per column and pick the narrowest type every
/// non-empty value fits. All-empty columns fall back to TEXT.
pub fn infer_column_types(rows: &[csv::StringRecord], width: usize, sample: usize) -> Vec<ColumnType> {
    (0..width)
        .map(|col| {
            let mut seen_any = false;
            let mut integer = true;
            let mut real = true;
            for row in rows.iter().take(sample) {
                let value = row.get(col).unwrap_or("").trim();
                if value.is_empty() {
                    continue;
                }
                seen_any = true;
                if value.parse::<i64>().is_err() {
                    integer = false;
                }
                if value.parse::<f64>().is_err() {
                    real = false;
                }
            }
            match (seen_any, integer, real) {
                (false, _, _) => ColumnType::Text,
                (true, true, _) => ColumnType::Integer,
                (true, false, true) => ColumnType::Real,
                _ => ColumnType::Text,
            }
        })
        .collect()
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Embedded SQLite warehouse for local and development runs.
pub struct SqliteWarehouse {
    path: PathBuf,
}

impl SqliteWarehouse {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    const SAMPLE_ROWS: usize = 100;

    fn load_blocking(&self, table: &str, csv_path: &Path) -> Result<LoadReport> {
        let mut reader = csv::Reader::from_path(csv_path)?;
        let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
        let mut rows: Vec<csv::StringRecord> = Vec::new();
        for record in reader.records() {
            rows.push(record?);
        }

        let types = infer_column_types(&rows, headers.len(), Self::SAMPLE_ROWS);
        let column_defs: Vec<String> = headers
            .iter()
            .zip(&types)
            .map(|(name, ty)| format!("{} {}", quote_ident(name), ty.sql()))
            .collect();

        let mut conn = Connection::open(&self.path)?;
        let tx = conn.transaction()?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {t}; CREATE TABLE {t} ({defs});",
            t = quote_ident(table),
            defs = column_defs.join(", ")
        ))?;

        {
            let placeholders: Vec<&str> = headers.iter().map(|_| "?").collect();
            let sql = format!(
                "INSERT INTO {} VALUES ({})",
                quote_ident(table),
                placeholders.join(", ")
            );
            let mut stmt = tx.prepare(&sql)?;
            for row in &rows {
                let values: Vec<Option<&str>> = (0..headers.len())
                    .map(|i| row.get(i).filter(|v| !v.is_empty()))
                    .collect();
                stmt.execute(params_from_iter(values))?;
            }
        }
        tx.commit()?;

        Ok(LoadReport {
            table: table.to_string(),
            rows: rows.len(),
        })
    }
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    async fn load_table(&self, table: &str, csv_path: &Path) -> Result<LoadReport> {
        self.load_blocking(table, csv_path)
    }
}

/// Remote warehouse over its HTTP load API. The CSV body is posted as one
/// replace-mode job per table; the header row rides along so the service
/// can autodetect the schema.
pub struct HttpWarehouse {
    client: reqwest::Client,
    base_url: String,
    dataset: String,
    token: Option<String>,
}

impl HttpWarehouse {
    pub fn new(base_url: String, dataset: String, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            dataset,
            token,
        }
    }
}

#[async_trait]
impl Warehouse for HttpWarehouse {
    async fn load_table(&self, table: &str, csv_path: &Path) -> Result<LoadReport> {
        let body = tokio::fs::read(csv_path).await?;
        let rows = {
            let mut reader = csv::Reader::from_reader(body.as_slice());
            reader.records().filter_map(|r| r.ok()).count()
        };

        let url = format!(
            "{}/v1/datasets/{}/tables/{}/load?mode=replace",
            self.base_url, self.dataset, table
        );
        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "text/csv")
            .body(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(PipelineError::Warehouse {
                table: table.to_string(),
                message: format!("load job returned status {}", response.status()),
            });
        }

        Ok(LoadReport {
            table: table.to_string(),
            rows,
        })
    }
}

/// Build the configured warehouse backend.
pub fn from_config(config: &WarehouseConfig) -> Result<Box<dyn Warehouse>> {
    match config.backend {
        WarehouseBackend::Sqlite => {
            let path = config.sqlite_path.clone().ok_or_else(|| {
                PipelineError::Config("warehouse.sqlite_path is required".to_string())
            })?;
            Ok(Box::new(SqliteWarehouse::new(path)))
        }
        WarehouseBackend::Http => {
            let base_url = config.base_url.clone().ok_or_else(|| {
                PipelineError::Config("warehouse.base_url is required".to_string())
            })?;
            Ok(Box::new(HttpWarehouse::new(
                base_url,
                config.dataset.clone(),
                config.token(),
            )))
        }
    }
}

/// Per-table outcomes for the load stage.
#[derive(Debug, Default)]
pub struct LoadStageReport {
    pub loaded: Vec<LoadReport>,
    pub failed: Vec<(String, String)>,
}

/// The final tables, in load order.
pub fn final_tables(config: &Config) -> Vec<(String, PathBuf)> {
    let dim_dir = config.outputs.dim_dir();
    let fact_dir = config.outputs.fact_dir();
    vec![
        ("dim_date".to_string(), dim_dir.join("dim_date.csv")),
        ("dim_patients".to_string(), dim_dir.join("dim_patients.csv")),
        ("dim_providers".to_string(), dim_dir.join("dim_providers.csv")),
        ("dim_procedures".to_string(), dim_dir.join("dim_procedures.csv")),
        ("fact_claims".to_string(), fact_dir.join("fact_claims.csv")),
        (
            "fact_transactions".to_string(),
            fact_dir.join("fact_transactions.csv"),
        ),
    ]
}

/// Load every final table, one sequenced job per table. A failing table is
/// reported and does not abort the rest.
#[instrument(skip(warehouse, tables))]
pub async fn run_load(
    warehouse: &dyn Warehouse,
    tables: &[(String, PathBuf)],
) -> LoadStageReport {
    let mut report = LoadStageReport::default();
    for (table, path) in tables {
        info!("Loading {} from {}", table, path.display());
        match warehouse.load_table(table, path).await {
            Ok(load) => {
                info!("Loaded {} ({} rows)", table, load.rows);
                report.loaded.push(load);
            }
            Err(e) => {
                error!("Failed to load {}: {}", table, e);
                report.failed.push((table.clone(), e.to_string()));
            }
        }
    }
    report
}
