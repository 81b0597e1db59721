use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;

use rcm_pipeline::config::Config;
use rcm_pipeline::pipeline::{self, StageStatus};
use rcm_pipeline::{extract, logging, star, warehouse};

#[derive(Parser)]
#[command(name = "rcm_pipeline")]
#[command(about = "Healthcare revenue-cycle data pipeline")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to the pipeline configuration file
    #[arg(long, default_value = "pipeline.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract from the hospital databases and claim files
    Extract,
    /// Clean and standardize the extracted tables
    Clean {
        /// Run date override (YYYY-MM-DD); defaults to today
        #[arg(long)]
        run_date: Option<NaiveDate>,
    },
    /// Build the dimension and fact tables
    Build,
    /// Apply SCD Type 2 reconciliation to dim_patients
    Scd {
        /// Run date override (YYYY-MM-DD); defaults to today
        #[arg(long)]
        run_date: Option<NaiveDate>,
    },
    /// Load the final tables into the warehouse
    Load,
    /// Run every stage in sequence
    Run {
        /// Run date override (YYYY-MM-DD); defaults to today
        #[arg(long)]
        run_date: Option<NaiveDate>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    logging::init_logging();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    let today = Utc::now().date_naive();

    match cli.command {
        Commands::Extract => {
            println!("🔄 Running extraction...");
            let report = extract::run_extract(&config)?;
            println!("\n📊 Extraction Results:");
            println!("   Sources connected: {}", report.sources_connected);
            println!("   Patients: {}", report.patients);
            println!("   Providers: {}", report.providers);
            println!("   Transactions: {}", report.transactions);
            println!(
                "   Claim files: {} ({} skipped)",
                report.claim_files, report.claim_files_skipped
            );
        }
        Commands::Clean { run_date } => {
            println!("🔄 Running cleaners...");
            let report = pipeline::run_clean(&config, run_date.unwrap_or(today))?;
            println!("\n📊 Cleaning Results:");
            println!(
                "   Patients: {} kept, {} excluded",
                report.patients, report.patients_excluded
            );
            println!(
                "   Claims: {} kept, {} excluded",
                report.claims, report.claims_excluded
            );
            println!("   Rows flagged: {}", report.flagged);
        }
        Commands::Build => {
            println!("🔄 Building star schema...");
            let report = star::run_build(&config)?;
            println!("\n📊 Build Results:");
            for (table, rows) in &report.built {
                println!("   ✅ {} ({} rows)", table, rows);
            }
            for (table, reason) in &report.failed {
                println!("   ⚠️  {} skipped: {}", table, reason);
            }
        }
        Commands::Scd { run_date } => {
            println!("🔁 Running SCD Type 2 load for dim_patients...");
            let report = pipeline::run_scd(&config, run_date.unwrap_or(today))?;
            println!("\n📊 SCD Results:");
            println!("   Inserted: {}", report.inserted);
            println!("   Superseded: {}", report.superseded);
            println!("   Unchanged: {}", report.unchanged);
            println!("   Rejected: {}", report.rejected);
            println!("   Snapshots excluded: {}", report.snapshot_excluded);
            println!("   ✅ dim_patients written with {} records", report.table_rows);
        }
        Commands::Load => {
            println!("🔄 Loading warehouse tables...");
            let wh = warehouse::from_config(&config.warehouse)?;
            let tables = warehouse::final_tables(&config);
            let report = warehouse::run_load(wh.as_ref(), &tables).await;
            println!("\n📊 Load Results:");
            for load in &report.loaded {
                println!("   ✅ Loaded {} ({} rows)", load.table, load.rows);
            }
            for (table, reason) in &report.failed {
                println!("   ❌ Failed to load {}: {}", table, reason);
            }
            if !report.failed.is_empty() {
                error!("{} table loads failed", report.failed.len());
                std::process::exit(1);
            }
        }
        Commands::Run { run_date } => {
            println!("🚀 Starting full pipeline run...");
            let report = pipeline::run_all(&config, run_date.unwrap_or(today)).await;
            println!("\n📊 Pipeline Run {}:", report.run_id);
            for stage in &report.stages {
                let icon = match stage.status {
                    StageStatus::Completed => "✅",
                    StageStatus::Failed => "❌",
                };
                println!("   {} {:?}: {}", icon, stage.stage, stage.detail);
            }
            if !report.succeeded() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
