use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::ChainSection;
use crate::video::{SqliteVideoStore, VideoResult};

use super::{ChainOrchestrator, ChainOutcome};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunnerReport {
    pub picked: usize,
    pub completed: usize,
    pub failed: usize,
    pub exhausted: usize,
}

/// Intake loop: picks processable records and drives the intake chain for
/// each, one at a time.
pub struct ChainRunner {
    store: SqliteVideoStore,
    chain: Arc<ChainOrchestrator>,
    settings: ChainSection,
}

impl ChainRunner {
    pub fn new(store: SqliteVideoStore, chain: Arc<ChainOrchestrator>, settings: ChainSection) -> Self {
        Self {
            store,
            chain,
            settings,
        }
    }

    pub async fn run_once(&self) -> VideoResult<RunnerReport> {
        let records = self
            .store
            .list_processable(self.settings.max_attempts, self.settings.batch_limit)?;
        let mut report = RunnerReport {
            picked: records.len(),
            ..RunnerReport::default()
        };
        for record in records {
            let outcome = match self.chain.run(&record.video_id).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(target: "chain", video_id = %record.video_id, error = %err, "chain run aborted");
                    report.failed += 1;
                    continue;
                }
            };
            match (&outcome.outcome, outcome.attempts) {
                (ChainOutcome::Completed { .. }, _) => report.completed += 1,
                (ChainOutcome::Failed { error, .. }, attempts) => {
                    report.failed += 1;
                    if attempts.unwrap_or(0) >= self.settings.max_attempts {
                        warn!(target: "chain", video_id = %record.video_id, attempts = attempts.unwrap_or(0), "attempts exhausted, marking failed");
                        self.store.mark_failed(&record.video_id, Some(error.as_str()))?;
                        report.exhausted += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    /// Runs until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(self.settings.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(target: "chain", interval_secs = self.settings.interval_secs, "chain runner started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            match self.run_once().await {
                Ok(report) if report.picked > 0 => {
                    info!(target: "chain", picked = report.picked, completed = report.completed, failed = report.failed, "chain runner pass finished");
                }
                Ok(_) => {}
                Err(err) => error!(target: "chain", error = %err, "chain runner pass failed"),
            }
        }
        info!(target: "chain", "chain runner stopped");
    }
}
