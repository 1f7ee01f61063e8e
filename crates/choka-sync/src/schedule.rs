//! Weekly slot schedule and the unattended runner loop.
//!
//! The runner is a cooperative tick loop: it sleeps in bounded poll intervals,
//! checks the slot table against an injectable [`Clock`], and runs at most one
//! ingestion cycle at a time on a spawned task. A failing or panicking cycle is
//! logged and the runner goes back to waiting; only the shutdown signal stops it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Days, Local, NaiveDateTime, NaiveTime, TimeDelta, Weekday};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::pipeline::{CycleContext, IngestionCycle};

const WEEK: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

#[async_trait]
pub trait Clock: Send + Sync {
    /// Local wall-clock time; slots and the cycle's reference date are read from it.
    fn now(&self) -> NaiveDateTime;

    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Declarative table of `(weekday, time)` slots.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WeeklySchedule {
    slots: Vec<(Weekday, NaiveTime)>,
}

impl WeeklySchedule {
    pub fn new(slots: impl IntoIterator<Item = (Weekday, NaiveTime)>) -> Self {
        let mut slots: Vec<_> = slots.into_iter().collect();
        slots.sort_by_key(|(day, time)| (day.num_days_from_monday(), *time));
        slots.dedup();
        Self { slots }
    }

    /// The same times on every day of the week.
    pub fn daily(times: &[NaiveTime]) -> Self {
        Self::new(
            WEEK.iter()
                .flat_map(|day| times.iter().map(move |time| (*day, *time))),
        )
    }

    pub fn slots(&self) -> &[(Weekday, NaiveTime)] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// First slot strictly after `after`, or `None` for an empty table.
    pub fn next_after(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        (0..=7u64).find_map(|offset| {
            let date = after.date().checked_add_days(Days::new(offset))?;
            self.slots
                .iter()
                .filter(|(day, _)| *day == date.weekday())
                .map(|(_, time)| date.and_time(*time))
                .find(|candidate| *candidate > after)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerStats {
    pub cycles_ok: u64,
    pub cycles_failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleEnd {
    Succeeded,
    Failed,
    Interrupted,
}

pub struct Runner {
    cycle: Arc<dyn IngestionCycle>,
    clock: Arc<dyn Clock>,
    schedule: WeeklySchedule,
    poll_interval: Duration,
    warm_up: bool,
    failure_retry: Option<Duration>,
    state: RunnerState,
    stats: RunnerStats,
}

impl Runner {
    pub fn new(
        cycle: Arc<dyn IngestionCycle>,
        clock: Arc<dyn Clock>,
        schedule: WeeklySchedule,
        poll_interval: Duration,
    ) -> Self {
        Self {
            cycle,
            clock,
            schedule,
            poll_interval,
            warm_up: true,
            failure_retry: None,
            state: RunnerState::Idle,
            stats: RunnerStats::default(),
        }
    }

    /// Run one cycle immediately at startup instead of waiting for the first slot.
    pub fn with_warm_up(mut self, warm_up: bool) -> Self {
        self.warm_up = warm_up;
        self
    }

    /// After a failed cycle, retry once at `min(now + retry, next slot)`.
    pub fn with_failure_retry(mut self, retry: Option<Duration>) -> Self {
        self.failure_retry = retry;
        self
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Loop until `shutdown` turns `true`. A dropped sender never stops the runner.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> RunnerStats {
        info!(
            slots = self.schedule.len(),
            poll_secs = self.poll_interval.as_secs(),
            warm_up = self.warm_up,
            "runner started"
        );

        let mut next_due = if self.warm_up {
            Some(self.clock.now())
        } else {
            self.schedule.next_after(self.clock.now())
        };

        loop {
            if *shutdown.borrow() {
                break;
            }

            let now = self.clock.now();
            if let Some(due) = next_due.filter(|due| now >= *due) {
                debug!(%due, %now, "slot reached");
                let end = self.run_cycle(&mut shutdown).await;
                if end == CycleEnd::Interrupted {
                    break;
                }
                next_due = self.next_due(end);
                if let Some(next) = next_due {
                    info!(%next, "next ingestion cycle scheduled");
                }
                continue;
            }

            let wait = next_due
                .and_then(|due| (due - now).to_std().ok())
                .map_or(self.poll_interval, |until_due| until_due.min(self.poll_interval));

            tokio::select! {
                _ = self.clock.sleep(wait) => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        self.state = RunnerState::Stopped;
        info!(
            cycles_ok = self.stats.cycles_ok,
            cycles_failed = self.stats.cycles_failed,
            "runner stopped by interrupt"
        );
        self.stats
    }

    fn next_due(&self, end: CycleEnd) -> Option<NaiveDateTime> {
        let now = self.clock.now();
        let next_slot = self.schedule.next_after(now);
        let retry_at = match (end, self.failure_retry) {
            (CycleEnd::Failed, Some(retry)) => TimeDelta::from_std(retry)
                .ok()
                .and_then(|delta| now.checked_add_signed(delta)),
            _ => None,
        };
        match (retry_at, next_slot) {
            (Some(retry_at), Some(slot)) => Some(retry_at.min(slot)),
            (retry_at, slot) => retry_at.or(slot),
        }
    }

    async fn run_cycle(&mut self, shutdown: &mut watch::Receiver<bool>) -> CycleEnd {
        self.state = RunnerState::Running;
        let ctx = CycleContext {
            cycle_id: Uuid::new_v4(),
            started_at: self.clock.now(),
        };

        let cycle = Arc::clone(&self.cycle);
        let mut handle = tokio::spawn(async move { cycle.run_cycle(ctx).await });

        let joined = tokio::select! {
            joined = &mut handle => Some(joined),
            _ = wait_for_shutdown(shutdown) => None,
        };

        let end = match joined {
            None => {
                handle.abort();
                warn!(cycle_id = %ctx.cycle_id, "interrupt received; abandoning in-flight cycle");
                CycleEnd::Interrupted
            }
            Some(Ok(Ok(report))) => {
                debug!(cycle_id = %ctx.cycle_id, inserted = report.reports_inserted, "cycle completed");
                CycleEnd::Succeeded
            }
            Some(Ok(Err(err))) => {
                error!(cycle_id = %ctx.cycle_id, date = %ctx.reference_date(), error = ?err, "ingestion cycle failed");
                CycleEnd::Failed
            }
            Some(Err(join_err)) if join_err.is_panic() => {
                error!(cycle_id = %ctx.cycle_id, date = %ctx.reference_date(), error = %join_err, "ingestion cycle panicked");
                CycleEnd::Failed
            }
            Some(Err(join_err)) => {
                error!(cycle_id = %ctx.cycle_id, error = %join_err, "ingestion cycle task was cancelled");
                CycleEnd::Failed
            }
        };

        match end {
            CycleEnd::Succeeded => self.stats.cycles_ok += 1,
            CycleEnd::Failed => self.stats.cycles_failed += 1,
            CycleEnd::Interrupted => {}
        }
        self.state = RunnerState::Idle;
        end
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
