use std::path::PathBuf;

use anyhow::{Context, Result};
use choka_storage::ConditionsStore;
use choka_sync::{export_training_snapshot, run_once, run_scheduled, SyncConfig};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};

mod logging;

#[derive(Debug, Parser)]
#[command(name = "choka")]
#[command(about = "Marine weather, tide and catch report collector")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run ingestion on the weekly schedule until interrupted.
    Run,
    /// Run a single ingestion cycle for today, then exit.
    Once,
    /// Create the database tables.
    Migrate,
    /// Write parquet training snapshots and a manifest.
    Export {
        #[arg(long, default_value = "snapshots")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = logging::init_logging()?;
    let config = SyncConfig::load().context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("interrupt received; stopping runner");
                        let _ = shutdown_tx.send(true);
                    }
                    Err(err) => error!(error = %err, "cannot listen for interrupt"),
                }
            });
            let stats = run_scheduled(&config, shutdown_rx).await?;
            println!(
                "runner stopped: cycles_ok={} cycles_failed={}",
                stats.cycles_ok, stats.cycles_failed
            );
        }
        Commands::Once => {
            let report = run_once(&config).await?;
            println!(
                "cycle {} for {}: weather={} tide={} reports={} inserted={} existing={} failed={} issues={}",
                report.cycle_id,
                report.date,
                report.weather,
                report.tide,
                report.reports,
                report.reports_inserted,
                report.reports_existing,
                report.reports_failed,
                report.parse_issues
            );
        }
        Commands::Migrate => {
            open_store(&config).await?;
            println!("migrated {}", config.database_url);
        }
        Commands::Export { out } => {
            let store = open_store(&config).await?;
            let manifest = export_training_snapshot(&store, &out).await?;
            println!("snapshot manifest: {}", manifest.display());
        }
    }

    Ok(())
}

async fn open_store(config: &SyncConfig) -> Result<ConditionsStore> {
    let store = ConditionsStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening store {}", config.database_url))?;
    store.migrate().await.context("running store migrations")?;
    Ok(store)
}
