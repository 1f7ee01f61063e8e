//! Ingestion orchestration: configuration, the per-cycle pipeline, the slot runner and snapshot export.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;

pub mod config;
pub mod export;
pub mod merge;
pub mod pipeline;
pub mod schedule;

#[cfg(test)]
mod test_logs;

pub use config::SyncConfig;
pub use export::{export_training_snapshot, SnapshotFile, SnapshotManifest};
pub use merge::merge_daily_conditions;
pub use pipeline::{CycleContext, CycleReport, IngestionCycle, IngestionPipeline, SourceStatus};
pub use schedule::{Clock, Runner, RunnerState, RunnerStats, SystemClock, WeeklySchedule};

pub const CRATE_NAME: &str = "choka-sync";

/// Build the production runner from `config`: migrated store, HTTP fetcher, system clock.
pub async fn runner_from_config(config: &SyncConfig) -> Result<Runner> {
    let pipeline = IngestionPipeline::from_config(config).await?;
    Ok(Runner::new(
        Arc::new(pipeline),
        Arc::new(SystemClock),
        config.weekly_schedule()?,
        config.poll_interval(),
    )
    .with_warm_up(config.schedule.warm_up)
    .with_failure_retry(config.failure_retry()))
}

/// Run until `shutdown` turns `true`.
pub async fn run_scheduled(config: &SyncConfig, shutdown: watch::Receiver<bool>) -> Result<RunnerStats> {
    let runner = runner_from_config(config).await?;
    Ok(runner.run(shutdown).await)
}

/// One cycle for the current local date, outside the schedule.
pub async fn run_once(config: &SyncConfig) -> Result<CycleReport> {
    let pipeline = IngestionPipeline::from_config(config).await?;
    let ctx = CycleContext {
        cycle_id: uuid::Uuid::new_v4(),
        started_at: SystemClock.now(),
    };
    pipeline.run(ctx).await
}
