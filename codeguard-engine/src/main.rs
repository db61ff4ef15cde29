//! codeguard: run integrity sweeps against a store and print the report.

use std::path::PathBuf;

use chrono::Utc;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use codeguard_engine::{EngineConfig, IntegrityEngine, SweepKind};

#[derive(Parser)]
#[command(name = "codeguard")]
#[command(about = "Fraud and integrity sweeps for the code economy")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQLite database (overrides config file)
    #[arg(short, long, env = "CODEGUARD_DB")]
    database: Option<String>,

    /// Sweep to run
    #[arg(value_enum)]
    sweep: SweepKind,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    // RUST_LOG wins over the configured level; stdout carries the report
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("codeguard_engine={}", config.general.log_level))
        }))
        .with_writer(std::io::stderr)
        .init();

    if let Some(database) = cli.database {
        config.general.database_path = database;
    }
    info!(database = %config.general.database_path, sweep = ?cli.sweep, "running sweep");

    let engine = IntegrityEngine::open(config)?;
    let report = engine.run_sweeps(cli.sweep, Utc::now())?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
