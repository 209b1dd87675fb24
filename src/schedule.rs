//! Triggers: the fixed-cadence loop and manual dispatch.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::runner::{RunReport, Runner};
use crate::{clog, clog_warn};

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Schedule,
    Manual,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Schedule => f.write_str("schedule"),
            Trigger::Manual => f.write_str("manual"),
        }
    }
}

/// Totals for a scheduler session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleStats {
    pub runs: u64,
    pub failures: u64,
}

/// Runs the job every `interval` until cancelled.
///
/// Runs never overlap: the next tick is only awaited after the current run
/// returns, and ticks missed while a run was busy are skipped rather than
/// replayed.
pub struct Scheduler {
    runner: Arc<Runner>,
    interval: Duration,
    run_on_start: bool,
}

impl Scheduler {
    pub fn new(runner: Arc<Runner>) -> Self {
        let schedule = &runner.config().schedule;
        let interval = schedule.interval();
        let run_on_start = schedule.run_on_start;
        Self {
            runner,
            interval,
            run_on_start,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn run(&self, cancel: CancellationToken) -> ScheduleStats {
        self.run_with(cancel, |_| {}).await
    }

    /// Like [`Scheduler::run`], handing every report to `on_report`.
    pub async fn run_with<F>(&self, cancel: CancellationToken, mut on_report: F) -> ScheduleStats
    where
        F: FnMut(&RunReport),
    {
        let first = if self.run_on_start {
            Instant::now()
        } else {
            Instant::now() + self.interval
        };
        let mut ticker = interval_at(first, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        clog!(
            "scheduler: every {:?} (run_on_start={})",
            self.interval,
            self.run_on_start
        );

        let mut stats = ScheduleStats::default();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let report = self.runner.run(Trigger::Schedule).await;
            stats.runs += 1;
            if !report.is_success() {
                stats.failures += 1;
                clog_warn!("scheduler: run {} failed; retrying at next tick", report.run_id);
            }
            on_report(&report);
        }

        clog!(
            "scheduler: stopped after {} runs ({} failed)",
            stats.runs,
            stats.failures
        );
        stats
    }
}
