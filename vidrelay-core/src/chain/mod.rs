pub mod orchestrator;
pub mod runner;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::srt::SrtCue;
use crate::state::ProcessingState;
use crate::video::{VideoRecord, VideoStatus};

pub use orchestrator::{ChainOrchestrator, ChainOutcome, ChainReport, FailurePolicy};
pub use runner::{ChainRunner, RunnerReport};

/// Working data shared by the stages of one run. Rebuilt for every run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub state: ProcessingState,
    pub record: VideoRecord,
    pub downloaded_file: Option<PathBuf>,
    pub original_title: Option<String>,
    pub original_description: Option<String>,
    pub transcript: Option<Vec<SrtCue>>,
    pub subtitle_path: Option<PathBuf>,
    pub translated_subtitle_path: Option<PathBuf>,
    pub translated_title: Option<String>,
    pub translated_description: Option<String>,
    pub cover_path: Option<PathBuf>,
    pub cover_url: Option<String>,
    pub remote_id: Option<String>,
    pub error: Option<String>,
}

impl ExecutionContext {
    pub fn new(state: ProcessingState, record: VideoRecord) -> Self {
        Self {
            original_title: record.title.clone(),
            original_description: record.description.clone(),
            translated_title: record.translated_title.clone(),
            translated_description: record.translated_description.clone(),
            remote_id: record.remote_id.clone(),
            state,
            record,
            downloaded_file: None,
            transcript: None,
            subtitle_path: None,
            translated_subtitle_path: None,
            cover_path: None,
            cover_url: None,
            error: None,
        }
    }

    pub fn video_id(&self) -> &str {
        &self.state.video_id
    }

    /// Records `err` as the run's failure cause and returns `false` so a task
    /// can `return ctx.fail(...)`.
    pub fn fail(&mut self, stage: &str, err: impl fmt::Display) -> bool {
        let message = err.to_string();
        warn!(target: "chain", video_id = %self.state.video_id, stage, error = %message, "stage failed");
        self.error = Some(message);
        false
    }
}

/// One named stage of a chain. Dependencies are injected at construction.
#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    /// Status the record reaches once this task succeeds.
    fn completes(&self) -> Option<VideoStatus> {
        None
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> bool;
}

/// Tries alternatives in order. The first success wins; when every
/// alternative fails the last one's error is kept.
pub struct Fallback {
    name: String,
    alternatives: Vec<Arc<dyn Task>>,
    completes: Option<VideoStatus>,
}

impl Fallback {
    pub fn new(name: impl Into<String>, alternatives: Vec<Arc<dyn Task>>) -> Self {
        Self {
            name: name.into(),
            alternatives,
            completes: None,
        }
    }

    pub fn completing(mut self, status: VideoStatus) -> Self {
        self.completes = Some(status);
        self
    }
}

#[async_trait]
impl Task for Fallback {
    fn name(&self) -> &str {
        &self.name
    }

    fn completes(&self) -> Option<VideoStatus> {
        self.completes
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> bool {
        if self.alternatives.is_empty() {
            return ctx.fail(&self.name, "no alternatives configured");
        }
        for task in &self.alternatives {
            ctx.error = None;
            if task.execute(ctx).await {
                tracing::info!(target: "chain", video_id = %ctx.video_id(), stage = %self.name, via = task.name(), "alternative succeeded");
                return true;
            }
        }
        false
    }
}


#[cfg(test)]
mod tests {
    use super::testing::StubTask;
    use super::*;

    fn context() -> ExecutionContext {
        ExecutionContext::new(ProcessingState::new("/tmp", "vid"), VideoRecord::new("vid"))
    }

    #[tokio::test]
    async fn fallback_stops_at_first_success() {
        let first = StubTask::failing("stored");
        let second = StubTask::ok("platform", None);
        let third = StubTask::ok("transcribe", None);
        let fallback = Fallback::new(
            "subtitles",
            vec![first.clone(), second.clone(), third.clone()],
        );
        let mut ctx = context();
        assert!(fallback.execute(&mut ctx).await);
        assert!(ctx.error.is_none());
        assert_eq!((first.calls(), second.calls(), third.calls()), (1, 1, 0));
    }

    #[tokio::test]
    async fn fallback_keeps_last_error() {
        let fallback = Fallback::new(
            "subtitles",
            vec![StubTask::failing("stored"), StubTask::failing("platform")],
        );
        let mut ctx = context();
        assert!(!fallback.execute(&mut ctx).await);
        assert_eq!(ctx.error.as_deref(), Some("platform broke"));
    }
}
