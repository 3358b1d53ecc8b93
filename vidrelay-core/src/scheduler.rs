//! Time-driven publishing, independent of intake.
//!
//! Every tick publishes `translated` records through the upload chain, then
//! attaches subtitles to videos published at least `subtitle_delay_secs`
//! ago. A failing record is noted and retried on the next tick.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::chain::ChainOrchestrator;
use crate::config::SchedulerSection;
use crate::publish::Publisher;
use crate::state::ProcessingState;
use crate::video::{SqliteVideoStore, VideoError, VideoRecord};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Video(#[from] VideoError),
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub published: usize,
    pub publish_failed: usize,
    pub attached: usize,
    pub attach_failed: usize,
}

pub struct UploadScheduler {
    store: SqliteVideoStore,
    upload_chain: Arc<ChainOrchestrator>,
    publisher: Arc<dyn Publisher>,
    work_dir: PathBuf,
    settings: SchedulerSection,
    subtitle_language: String,
}

impl UploadScheduler {
    pub fn new(
        store: SqliteVideoStore,
        upload_chain: Arc<ChainOrchestrator>,
        publisher: Arc<dyn Publisher>,
        work_dir: impl AsRef<Path>,
        settings: SchedulerSection,
        subtitle_language: impl Into<String>,
    ) -> Self {
        Self {
            store,
            upload_chain,
            publisher,
            work_dir: work_dir.as_ref().to_path_buf(),
            settings,
            subtitle_language: subtitle_language.into(),
        }
    }

    pub async fn run_tick(&self, now: DateTime<Utc>) -> SchedulerResult<TickReport> {
        let mut report = TickReport::default();
        self.publish_phase(&mut report).await?;
        self.subtitle_phase(now, &mut report).await?;
        Ok(report)
    }

    async fn publish_phase(&self, report: &mut TickReport) -> SchedulerResult<()> {
        let ready = self.store.list_ready_for_publish(self.settings.batch_limit)?;
        for record in ready {
            match self.upload_chain.run(&record.video_id).await {
                Ok(run) if run.succeeded() => report.published += 1,
                Ok(_) => report.publish_failed += 1,
                Err(err) => {
                    error!(target: "scheduler", video_id = %record.video_id, error = %err, "upload chain aborted");
                    report.publish_failed += 1;
                }
            }
        }
        Ok(())
    }

    async fn subtitle_phase(&self, now: DateTime<Utc>, report: &mut TickReport) -> SchedulerResult<()> {
        let delay = chrono::Duration::seconds(self.settings.subtitle_delay_secs as i64);
        let due = self
            .store
            .list_pending_subtitle_attach(now - delay, self.settings.batch_limit)?;
        for record in due {
            let result = match self.attach(&record).await {
                Ok(()) => self
                    .store
                    .mark_subtitle_attached(&record.video_id)
                    .map_err(|err| format!("store update failed: {err}")),
                Err(message) => Err(message),
            };
            match result {
                Ok(()) => report.attached += 1,
                Err(message) => {
                    warn!(target: "scheduler", video_id = %record.video_id, error = %message, "subtitle attach failed");
                    if let Err(err) = self
                        .store
                        .note_error(&record.video_id, &format!("subtitle_attach: {message}"))
                    {
                        error!(target: "scheduler", video_id = %record.video_id, error = %err, "failed to note attach error");
                    }
                    report.attach_failed += 1;
                }
            }
        }
        Ok(())
    }

    async fn attach(&self, record: &VideoRecord) -> Result<(), String> {
        let remote_id = record
            .remote_id
            .as_deref()
            .ok_or_else(|| "published record has no remote id".to_string())?;
        let state = ProcessingState::new(&self.work_dir, &record.video_id);
        let subtitle = state
            .publishable_subtitle()
            .ok_or_else(|| format!("no subtitle file in {}", state.current_dir.display()))?;
        self.publisher
            .attach_subtitle(remote_id, subtitle, &self.subtitle_language)
            .await
            .map_err(|err| err.to_string())?;
        info!(target: "scheduler", video_id = %record.video_id, remote_id, subtitle = %subtitle.display(), "subtitle attached");
        Ok(())
    }

    /// Ticks every `tick_secs` until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(self.settings.tick_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(target: "scheduler", tick_secs = self.settings.tick_secs, "upload scheduler started");
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
            match self.run_tick(Utc::now()).await {
                Ok(report) => {
                    info!(target: "scheduler", published = report.published, publish_failed = report.publish_failed, attached = report.attached, attach_failed = report.attach_failed, "tick finished");
                }
                Err(err) => error!(target: "scheduler", error = %err, "tick failed"),
            }
        }
        info!(target: "scheduler", "upload scheduler stopped");
    }
}
