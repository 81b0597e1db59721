use crate::error::{PipelineError, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Pipeline configuration, loaded from a TOML file.
///
/// Credentials never live in the file: the warehouse token is resolved from
/// the environment at load time so configs can be committed safely.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub sources: SourcesConfig,
    pub outputs: OutputsConfig,
    pub warehouse: WarehouseConfig,
}

/// Where the operational inputs live.
#[derive(Debug, Clone, Deserialize)]
pub struct SourcesConfig {
    /// Hospital A operational database (SQLite file).
    pub hospital_a_db: PathBuf,
    /// Hospital B operational database (SQLite file).
    pub hospital_b_db: PathBuf,
    /// Directory of flat claim files (*.csv).
    pub claims_dir: PathBuf,
    /// CPT procedure code reference CSV.
    pub cpt_codes: PathBuf,
}

impl SourcesConfig {
    /// The hospital databases in a fixed order, keyed by source name.
    pub fn hospitals(&self) -> Vec<(&'static str, &Path)> {
        vec![
            ("hospital_a", self.hospital_a_db.as_path()),
            ("hospital_b", self.hospital_b_db.as_path()),
        ]
    }
}

/// Root directory for every stage's flat-file outputs.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputsConfig {
    pub root: PathBuf,
}

impl OutputsConfig {
    pub fn extract_dir(&self) -> PathBuf {
        self.root.join("extract")
    }

    pub fn clean_dir(&self) -> PathBuf {
        self.root.join("clean")
    }

    pub fn dim_dir(&self) -> PathBuf {
        self.root.join("dim")
    }

    pub fn fact_dir(&self) -> PathBuf {
        self.root.join("fact")
    }

    pub fn reject_dir(&self) -> PathBuf {
        self.root.join("rejects")
    }
}

/// Warehouse backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarehouseBackend {
    Sqlite,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WarehouseConfig {
    pub backend: WarehouseBackend,
    /// Target dataset/schema name in the warehouse.
    pub dataset: String,
    /// SQLite warehouse file (backend = "sqlite").
    pub sqlite_path: Option<PathBuf>,
    /// Warehouse API base URL (backend = "http").
    pub base_url: Option<String>,
}

impl WarehouseConfig {
    /// Bearer token for the HTTP backend, sourced from the environment.
    pub fn token(&self) -> Option<String> {
        std::env::var("RCM_WAREHOUSE_TOKEN").ok().filter(|t| !t.trim().is_empty())
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        let config: Config = toml::from_str(&config_content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        match self.warehouse.backend {
            WarehouseBackend::Sqlite if self.warehouse.sqlite_path.is_none() => {
                Err(PipelineError::Config(
                    "warehouse.backend = \"sqlite\" requires warehouse.sqlite_path".to_string(),
                ))
            }
            WarehouseBackend::Http if self.warehouse.base_url.is_none() => {
                Err(PipelineError::Config(
                    "warehouse.backend = \"http\" requires warehouse.base_url".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }
}
