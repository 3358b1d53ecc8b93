use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::state::ProcessingState;
use crate::video::{SqliteVideoStore, VideoResult};

use super::{ExecutionContext, Task};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChainOutcome {
    Completed { stages: Vec<String> },
    Failed { stage: String, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainReport {
    pub run_id: Uuid,
    pub video_id: String,
    pub outcome: ChainOutcome,
    /// Attempt total after a counted failure.
    pub attempts: Option<u32>,
}

impl ChainReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, ChainOutcome::Completed { .. })
    }
}

/// How a failed run is written back to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// `attempts + 1` and `last_error`.
    CountAttempt,
    /// `last_error` only; the record stays eligible unchanged.
    NoteOnly,
}

/// Runs an ordered list of tasks for one video, stopping at the first
/// failure. Status advances after each completed stage that declares one.
pub struct ChainOrchestrator {
    name: String,
    store: SqliteVideoStore,
    work_dir: PathBuf,
    tasks: Vec<Arc<dyn Task>>,
    failure_policy: FailurePolicy,
}

impl ChainOrchestrator {
    pub fn new(
        name: impl Into<String>,
        store: SqliteVideoStore,
        work_dir: impl AsRef<Path>,
        tasks: Vec<Arc<dyn Task>>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            work_dir: work_dir.as_ref().to_path_buf(),
            tasks,
            failure_policy: FailurePolicy::CountAttempt,
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.tasks.iter().map(|task| task.name().to_string()).collect()
    }

    pub async fn run(&self, video_id: &str) -> VideoResult<ChainReport> {
        let record = self.store.require(video_id)?;
        let run_id = Uuid::new_v4();
        let state = ProcessingState::new(&self.work_dir, &record.video_id);
        let mut ctx = ExecutionContext::new(state, record);
        info!(target: "chain", chain = %self.name, %run_id, video_id, "chain started");

        let mut completed = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            let stage = task.name().to_string();
            if !task.execute(&mut ctx).await {
                let error = ctx
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("{stage} failed"));
                let message = format!("{stage}: {error}");
                let attempts = match self.failure_policy {
                    FailurePolicy::CountAttempt => {
                        Some(self.store.record_failure(video_id, &message)?)
                    }
                    FailurePolicy::NoteOnly => {
                        self.store.note_error(video_id, &message)?;
                        None
                    }
                };
                warn!(target: "chain", chain = %self.name, %run_id, video_id, stage = %stage, error = %error, "chain failed");
                return Ok(ChainReport {
                    run_id,
                    video_id: video_id.to_string(),
                    outcome: ChainOutcome::Failed { stage, error },
                    attempts,
                });
            }
            if let Some(status) = task.completes() {
                if self.store.advance_status(video_id, status)? {
                    ctx.record.status = status;
                    info!(target: "chain", %run_id, video_id, stage = %stage, status = %status, "status advanced");
                }
            }
            completed.push(stage);
        }

        if ctx.record.last_error.is_some() {
            self.store.clear_error(video_id)?;
        }
        info!(target: "chain", chain = %self.name, %run_id, video_id, stages = completed.len(), "chain completed");
        Ok(ChainReport {
            run_id,
            video_id: video_id.to_string(),
            outcome: ChainOutcome::Completed { stages: completed },
            attempts: None,
        })
    }
}
