//! One ingestion cycle: fetch the three sources concurrently, merge, persist.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use choka_adapters::{
    fetch_and_parse, AdapterContext, AdapterError, FetchedPage, PayloadFetcher, ReportAdapter,
    SourceAdapter, SourceAttempt, TideAdapter, WeatherAdapter,
};
use choka_core::{Availability, SourceKind, TableKind};
use choka_storage::{ConditionsStore, HttpFetcher, InsertOutcome, PayloadArchive};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::merge::merge_daily_conditions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleContext {
    pub cycle_id: Uuid,
    pub started_at: NaiveDateTime,
}

impl CycleContext {
    /// The calendar date at cycle start; every record of the cycle is keyed on it.
    pub fn reference_date(&self) -> NaiveDate {
        self.started_at.date()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceStatus {
    Present,
    /// Well-formed payload without the day's data.
    Absent { reason: String },
    /// Fetch, format or timeout failure; defaults were used.
    Degraded { reason: String },
    /// Not fetched because the day's conditions are already stored.
    Skipped,
}

impl SourceStatus {
    pub fn is_present(&self) -> bool {
        matches!(self, SourceStatus::Present)
    }
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceStatus::Present => f.write_str("present"),
            SourceStatus::Absent { .. } => f.write_str("absent"),
            SourceStatus::Degraded { .. } => f.write_str("degraded"),
            SourceStatus::Skipped => f.write_str("skipped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub date: NaiveDate,
    pub weather: SourceStatus,
    pub tide: SourceStatus,
    pub reports: SourceStatus,
    /// `None` when the conditions insert was skipped.
    pub conditions: Option<InsertOutcome>,
    pub reports_inserted: usize,
    pub reports_existing: usize,
    pub reports_failed: usize,
    pub parse_issues: usize,
}

impl CycleReport {
    pub fn empty(ctx: CycleContext) -> Self {
        Self {
            cycle_id: ctx.cycle_id,
            date: ctx.reference_date(),
            weather: SourceStatus::Skipped,
            tide: SourceStatus::Skipped,
            reports: SourceStatus::Skipped,
            conditions: None,
            reports_inserted: 0,
            reports_existing: 0,
            reports_failed: 0,
            parse_issues: 0,
        }
    }
}

/// Unit of work driven by the runner. Errors and panics stop at the runner's cycle boundary.
#[async_trait]
pub trait IngestionCycle: Send + Sync + 'static {
    async fn run_cycle(&self, ctx: CycleContext) -> Result<CycleReport>;
}

pub struct IngestionPipeline {
    store: ConditionsStore,
    fetcher: Arc<dyn PayloadFetcher>,
    archive: Option<PayloadArchive>,
    weather: WeatherAdapter,
    tide: TideAdapter,
    reports: ReportAdapter,
    source_deadline: Duration,
}

impl IngestionPipeline {
    pub fn new(
        store: ConditionsStore,
        fetcher: Arc<dyn PayloadFetcher>,
        weather: WeatherAdapter,
        tide: TideAdapter,
        reports: ReportAdapter,
    ) -> Self {
        Self {
            store,
            fetcher,
            archive: None,
            weather,
            tide,
            reports,
            source_deadline: Duration::from_secs(60),
        }
    }

    pub fn with_archive(mut self, archive: PayloadArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Bound on each source leg; a slower leg is treated as degraded.
    pub fn with_source_deadline(mut self, deadline: Duration) -> Self {
        self.source_deadline = deadline;
        self
    }

    /// Build the production pipeline: migrated store, HTTP fetcher, optional archive.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let store = ConditionsStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening store {}", config.database_url))?;
        store.migrate().await.context("running store migrations")?;
        let fetcher = HttpFetcher::new(config.http_client_config())?;

        let mut pipeline = Self::new(
            store,
            Arc::new(fetcher),
            config.weather_adapter(),
            config.tide_adapter(),
            config.report_adapter()?,
        )
        .with_source_deadline(config.source_deadline());
        if let Some(dir) = &config.archive_dir {
            pipeline = pipeline.with_archive(PayloadArchive::new(dir));
        }
        Ok(pipeline)
    }

    pub fn store(&self) -> &ConditionsStore {
        &self.store
    }

    pub async fn run(&self, ctx: CycleContext) -> Result<CycleReport> {
        let date = ctx.reference_date();
        let actx = AdapterContext {
            cycle_id: ctx.cycle_id,
            reference_date: date,
        };
        info!(cycle_id = %ctx.cycle_id, %date, "ingestion cycle started");

        let conditions_stored = match self.store.exists(date, TableKind::DailyConditions).await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(cycle_id = %ctx.cycle_id, %date, error = %err, "existence check failed; fetching all sources");
                false
            }
        };
        if conditions_stored {
            debug!(cycle_id = %ctx.cycle_id, %date, "conditions already stored; skipping weather and tide");
        }

        let weather_leg = async {
            if conditions_stored {
                None
            } else {
                Some(self.guarded(&self.weather, &actx).await)
            }
        };
        let tide_leg = async {
            if conditions_stored {
                None
            } else {
                Some(self.guarded(&self.tide, &actx).await)
            }
        };
        let (weather, tide, reports) =
            tokio::join!(weather_leg, tide_leg, self.guarded(&self.reports, &actx));

        let mut report = CycleReport::empty(ctx);
        // Held until the report batch is persisted; the two tables are written independently.
        let mut conditions_result: Result<()> = Ok(());

        if let (Some(weather), Some(tide)) = (weather, tide) {
            let (weather_status, weather) = self.settle(&ctx, SourceKind::Weather, weather).await;
            let (tide_status, tide) = self.settle(&ctx, SourceKind::Tide, tide).await;
            report.weather = weather_status;
            report.tide = tide_status;

            let conditions = merge_daily_conditions(date, weather, tide);
            match self.store.insert_daily_conditions(&conditions).await {
                Ok(outcome) => {
                    if outcome == InsertOutcome::AlreadyExists {
                        debug!(cycle_id = %ctx.cycle_id, %date, "daily conditions already stored; first write kept");
                    }
                    report.conditions = Some(outcome);
                }
                Err(err) => {
                    warn!(cycle_id = %ctx.cycle_id, %date, error = %err, "daily conditions insert failed; still storing reports");
                    conditions_result = Err(anyhow::Error::new(err)
                        .context(format!("storing daily conditions for {date}")));
                }
            }
        }

        let (reports_status, batch) = self.settle(&ctx, SourceKind::Reports, reports).await;
        report.reports = reports_status;
        if let Some(batch) = batch {
            for issue in &batch.issues {
                if issue.skips_card() {
                    info!(cycle_id = %ctx.cycle_id, %issue, "report card skipped");
                } else {
                    debug!(cycle_id = %ctx.cycle_id, %issue, "report row skipped");
                }
            }
            let outcome = self.store.insert_catch_reports(&batch.reports).await;
            report.reports_inserted = outcome.inserted;
            report.reports_existing = outcome.already_existed;
            report.reports_failed = outcome.failed;
            report.parse_issues = batch.issues.len();
        }

        info!(
            cycle_id = %ctx.cycle_id,
            %date,
            weather = %report.weather,
            tide = %report.tide,
            reports = %report.reports,
            conditions = ?report.conditions,
            reports_inserted = report.reports_inserted,
            reports_existing = report.reports_existing,
            reports_failed = report.reports_failed,
            parse_issues = report.parse_issues,
            "ingestion cycle finished"
        );
        conditions_result?;
        Ok(report)
    }

    async fn guarded<A: SourceAdapter>(
        &self,
        adapter: &A,
        actx: &AdapterContext,
    ) -> Option<SourceAttempt<A::Output>> {
        tokio::time::timeout(
            self.source_deadline,
            fetch_and_parse(adapter, self.fetcher.as_ref(), actx),
        )
        .await
        .ok()
    }

    /// Archive the payload and reduce an attempt to a status plus the parsed value.
    /// `None` means the leg ran past its deadline.
    async fn settle<T>(
        &self,
        ctx: &CycleContext,
        source: SourceKind,
        attempt: Option<SourceAttempt<T>>,
    ) -> (SourceStatus, Option<T>) {
        let Some(attempt) = attempt else {
            let reason = format!("no result within {}s", self.source_deadline.as_secs());
            warn!(cycle_id = %ctx.cycle_id, %source, %reason, "source timed out; using defaults");
            return (SourceStatus::Degraded { reason }, None);
        };

        if let Some(page) = &attempt.page {
            self.archive_page(ctx, source, page).await;
        }

        match attempt.outcome {
            Ok(Availability::Present(value)) => (SourceStatus::Present, Some(value)),
            Ok(Availability::Absent { reason }) => {
                warn!(cycle_id = %ctx.cycle_id, %source, %reason, "source has no data for the day");
                (SourceStatus::Absent { reason }, None)
            }
            Err(err) => {
                if let AdapterError::Format { snippet, .. } = &err {
                    warn!(cycle_id = %ctx.cycle_id, %source, error = %err, body = %snippet, "source payload malformed; using defaults");
                } else {
                    warn!(cycle_id = %ctx.cycle_id, %source, error = %err, "source fetch failed; using defaults");
                }
                (SourceStatus::Degraded { reason: err.to_string() }, None)
            }
        }
    }

    async fn archive_page(&self, ctx: &CycleContext, source: SourceKind, page: &FetchedPage) {
        let Some(archive) = &self.archive else {
            return;
        };
        match archive.store_bytes(page.fetched_at, source, &page.body).await {
            Ok(stored) => debug!(
                cycle_id = %ctx.cycle_id,
                %source,
                path = %stored.relative_path.display(),
                deduplicated = stored.deduplicated,
                "payload archived"
            ),
            Err(err) => warn!(cycle_id = %ctx.cycle_id, %source, error = ?err, "payload archive failed"),
        }
    }
}

#[async_trait]
impl IngestionCycle for IngestionPipeline {
    async fn run_cycle(&self, ctx: CycleContext) -> Result<CycleReport> {
        self.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use choka_adapters::FixtureFetcher;
    use choka_core::TideReading;

    const FORECAST: &str = r#"[{"timeSeries": [
        {"timeDefines": ["2024-05-01T05:00:00+09:00"],
         "areas": [{"area": {"name": "東部", "code": "140010"}, "waves": ["2メートル"]}]},
        {"timeDefines": ["2024-05-01T06:00:00+09:00", "2024-05-01T12:00:00+09:00"],
         "areas": [{"area": {"name": "東部", "code": "140010"}, "pops": ["20", "50"]}]}
    ]}]"#;

    fn ctx() -> CycleContext {
        CycleContext {
            cycle_id: Uuid::new_v4(),
            started_at: NaiveDate::from_ymd_opt(2024, 5, 1)
                .unwrap()
                .and_hms_opt(6, 0, 0)
                .unwrap(),
        }
    }

    async fn pipeline(fetcher: FixtureFetcher) -> IngestionPipeline {
        let config = SyncConfig::default();
        let store = ConditionsStore::in_memory().await.unwrap();
        store.migrate().await.unwrap();
        IngestionPipeline::new(
            store,
            Arc::new(fetcher),
            config.weather_adapter(),
            config.tide_adapter(),
            config.report_adapter().unwrap(),
        )
    }

    #[tokio::test]
    async fn every_source_failing_still_persists_defaults() {
        let fetcher = FixtureFetcher::new()
            .with_status(SourceKind::Weather, 503)
            .with_body(SourceKind::Tide, "<html>maintenance</html>");
        let pipeline = pipeline(fetcher).await;

        let report = pipeline.run(ctx()).await.unwrap();

        assert!(matches!(report.weather, SourceStatus::Degraded { .. }));
        assert!(matches!(report.tide, SourceStatus::Degraded { .. }));
        assert!(matches!(report.reports, SourceStatus::Degraded { .. }));
        assert_eq!(report.conditions, Some(InsertOutcome::Inserted));
        assert_eq!(report.reports_inserted, 0);

        let stored = pipeline
            .store()
            .daily_conditions(ctx().reference_date())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.weather.wave_height, 0.0);
        assert_eq!(stored.tide, TideReading::absent(ctx().reference_date()));
        assert_eq!(stored.degraded_sources, vec![SourceKind::Weather, SourceKind::Tide]);
    }

    #[tokio::test]
    async fn stored_conditions_skip_weather_and_tide_fetches() {
        let fetcher = FixtureFetcher::new().with_body(SourceKind::Weather, FORECAST);
        let pipeline = pipeline(fetcher).await;

        let first = pipeline.run(ctx()).await.unwrap();
        assert_eq!(first.weather, SourceStatus::Present);
        assert_eq!(first.conditions, Some(InsertOutcome::Inserted));

        let second = pipeline.run(ctx()).await.unwrap();
        assert_eq!(second.weather, SourceStatus::Skipped);
        assert_eq!(second.tide, SourceStatus::Skipped);
        assert_eq!(second.conditions, None);
        assert_eq!(
            pipeline
                .store()
                .count(TableKind::DailyConditions, ctx().reference_date())
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn archive_keeps_fetched_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FixtureFetcher::new().with_body(SourceKind::Weather, FORECAST);
        let pipeline = pipeline(fetcher)
            .await
            .with_archive(PayloadArchive::new(dir.path()));

        pipeline.run(ctx()).await.unwrap();

        let stamp_dirs: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(stamp_dirs.len(), 1);
        let weather_dir = stamp_dirs[0].as_ref().unwrap().path().join("weather");
        let files: Vec<_> = std::fs::read_dir(weather_dir).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn tide_without_the_day_is_logged_as_a_warning() {
        let (logs, _guard) = crate::test_logs::CapturedLogs::install();
        let fetcher = FixtureFetcher::new()
            .with_body(SourceKind::Weather, FORECAST)
            .with_body(SourceKind::Tide, r#"{"status": 1, "chart": {"2024-05-02": {}}}"#);
        let pipeline = pipeline(fetcher).await;

        let report = pipeline.run(ctx()).await.unwrap();

        assert!(matches!(report.tide, SourceStatus::Absent { .. }));
        let warnings = logs.lines_at("WARN");
        assert!(warnings.iter().any(|line| line.contains("source has no data for the day")
            && line.contains("source=tide")
            && line.contains("2024-05-01")));
    }

    struct StalledFetcher;

    #[async_trait]
    impl PayloadFetcher for StalledFetcher {
        async fn fetch(
            &self,
            _ctx: &AdapterContext,
            _source: SourceKind,
            _url: &str,
        ) -> Result<FetchedPage, choka_storage::FetchError> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn stalled_legs_hit_the_deadline_and_degrade() {
        let config = SyncConfig::default();
        let store = ConditionsStore::in_memory().await.unwrap();
        store.migrate().await.unwrap();
        let pipeline = IngestionPipeline::new(
            store,
            Arc::new(StalledFetcher),
            config.weather_adapter(),
            config.tide_adapter(),
            config.report_adapter().unwrap(),
        )
        .with_source_deadline(Duration::from_millis(20));

        let report = pipeline.run(ctx()).await.unwrap();

        assert!(matches!(report.weather, SourceStatus::Degraded { ref reason } if reason.contains("no result")));
        assert!(matches!(report.reports, SourceStatus::Degraded { .. }));
        assert_eq!(report.conditions, Some(InsertOutcome::Inserted));
    }
}
