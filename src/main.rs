use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use log::{error, info, warn};
use sqlx::mysql::MySqlPoolOptions;
use tokio_util::sync::CancellationToken;

mod analyzer;
mod apply;
mod bigquery;
mod checkpoint;
mod config;
mod error;
mod extract;
mod mapper;
mod normalize;
mod report;
mod sync;
mod warehouse;

use crate::bigquery::BigQueryWarehouse;
use crate::config::SyncParams;
use crate::sync::SyncEngine;

/// Replicates multi-tenant MySQL schemas into shared BigQuery tables.
#[derive(Parser, Debug)]
#[command(name = "mysql-bq-sync")]
struct Cli {
    /// Force a full sync of every table, ignoring checkpoints.
    #[arg(long)]
    full: bool,

    /// Path to the parameter file.
    #[arg(long, default_value = "params.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(0) => ExitCode::SUCCESS,
        Ok(failed) => {
            error!("{} tables failed to sync", failed);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<usize> {
    let params = SyncParams::load(&cli.config)?;

    info!(
        "Connecting to source MySQL at {}:{}...",
        params.db_host, params.db_port
    );
    let pool = MySqlPoolOptions::new()
        .max_connections(params.pool_size)
        .connect(&params.source_url())
        .await?;
    // Fail fast before any table is scheduled.
    sqlx::query("SELECT 1").execute(&pool).await?;

    info!("Connecting to BigQuery project {}...", params.bq_project);
    let key_file = params.bq_key_file()?;
    let warehouse = Arc::new(
        BigQueryWarehouse::connect(
            &key_file,
            &params.bq_project,
            &params.bq_location,
            params.batch_size,
        )
        .await?,
    );

    let force_full = cli.full;
    let engine = Arc::new(SyncEngine::new(params, pool, warehouse)?);

    if let Err(e) = engine.migrate_legacy_checkpoints() {
        warn!("Legacy checkpoint migration failed: {}", e);
    }

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, initiating graceful shutdown...");
                cancel_clone.cancel();
            }
            Err(e) => {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        }
    });

    let report = engine.run(force_full, cancel).await;
    report.log_summary();
    Ok(report.failed_count())
}
