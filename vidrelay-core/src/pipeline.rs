//! Wiring from a [`RelayConfig`] to the intake chain, the upload chain and
//! the two loops that drive them.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::ai::{AiError, AiServiceManager};
use crate::asr::{AsrError, BcutClient};
use crate::chain::{ChainOrchestrator, ChainRunner, Fallback, FailurePolicy, Task};
use crate::command::CommandExecutor;
use crate::config::{RelayConfig, SubtitleSource};
use crate::handlers::{
    CoverUploadTask, DownloadTask, PlatformSubtitleTask, StoredSubtitleTask, TranscribeTask,
    TranslateTask, UploadTask,
};
use crate::network::CookieSource;
use crate::publish::{CommandPublisher, PublishError, Publisher};
use crate::scheduler::UploadScheduler;
use crate::video::{SqliteVideoStore, VideoError, VideoStatus};

const PLATFORM_SUBTITLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Video(#[from] VideoError),
    #[error(transparent)]
    Ai(#[from] AiError),
    #[error(transparent)]
    Asr(#[from] AsrError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Every long-lived component built from one configuration.
pub struct Pipeline {
    pub store: SqliteVideoStore,
    pub ai: Arc<AiServiceManager>,
    pub publisher: Arc<dyn Publisher>,
    pub intake: Arc<ChainOrchestrator>,
    pub upload: Arc<ChainOrchestrator>,
}

impl Pipeline {
    pub fn from_config(
        config: &RelayConfig,
        executor: Arc<dyn CommandExecutor>,
    ) -> PipelineResult<Self> {
        let publisher: Arc<dyn Publisher> = Arc::new(CommandPublisher::new(
            config.publisher.clone(),
            Arc::clone(&executor),
        )?);
        Self::with_publisher(config, executor, publisher)
    }

    /// Same as [`Pipeline::from_config`] with a caller-supplied publisher.
    pub fn with_publisher(
        config: &RelayConfig,
        executor: Arc<dyn CommandExecutor>,
        publisher: Arc<dyn Publisher>,
    ) -> PipelineResult<Self> {
        std::fs::create_dir_all(config.work_dir())?;
        if let Some(parent) = config.database_path().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = SqliteVideoStore::new(config.database_path())?;
        store.initialize()?;
        let ai = Arc::new(AiServiceManager::from_config(&config.ai)?);
        let proxy = config.proxy.active_host().map(str::to_string);

        let subtitle_sources = config
            .subtitles
            .sources
            .iter()
            .map(|source| -> PipelineResult<Arc<dyn Task>> {
                let task: Arc<dyn Task> = match source {
                    SubtitleSource::Stored => Arc::new(StoredSubtitleTask),
                    SubtitleSource::Platform => Arc::new(PlatformSubtitleTask::new(
                        proxy.clone(),
                        PLATFORM_SUBTITLE_TIMEOUT,
                    )),
                    SubtitleSource::Transcribe => Arc::new(TranscribeTask::new(
                        BcutClient::new(&config.transcription)?,
                        &config.downloader,
                        Arc::clone(&executor),
                    )),
                };
                Ok(task)
            })
            .collect::<PipelineResult<Vec<_>>>()?;

        let intake_tasks: Vec<Arc<dyn Task>> = vec![
            Arc::new(DownloadTask::new(
                store.clone(),
                config.downloader.clone(),
                proxy,
                CookieSource::resolve(config),
                Arc::clone(&executor),
            )),
            Arc::new(Fallback::new("subtitles", subtitle_sources).completing(VideoStatus::Captioned)),
            Arc::new(
                TranslateTask::new(store.clone(), Arc::clone(&ai), config.translate.clone())
                    .keep_original(
                        config.publisher.use_original_title,
                        config.publisher.use_original_description,
                    ),
            ),
        ];
        let intake = Arc::new(ChainOrchestrator::new(
            "intake",
            store.clone(),
            config.work_dir(),
            intake_tasks,
        ));

        let upload_tasks: Vec<Arc<dyn Task>> = vec![
            Arc::new(CoverUploadTask::new(
                Arc::clone(&publisher),
                config.publisher.cover_required,
            )),
            Arc::new(UploadTask::new(
                store.clone(),
                Arc::clone(&publisher),
                config.publisher.clone(),
            )),
        ];
        let upload = Arc::new(
            ChainOrchestrator::new("upload", store.clone(), config.work_dir(), upload_tasks)
                .with_failure_policy(FailurePolicy::NoteOnly),
        );

        info!(target: "chain", intake = ?intake.stage_names(), upload = ?upload.stage_names(), "pipeline assembled");
        Ok(Self {
            store,
            ai,
            publisher,
            intake,
            upload,
        })
    }

    pub fn runner(&self, config: &RelayConfig) -> ChainRunner {
        ChainRunner::new(self.store.clone(), Arc::clone(&self.intake), config.chain.clone())
    }

    pub fn scheduler(&self, config: &RelayConfig) -> UploadScheduler {
        UploadScheduler::new(
            self.store.clone(),
            Arc::clone(&self.upload),
            Arc::clone(&self.publisher),
            config.work_dir(),
            config.scheduler.clone(),
            config.publisher.subtitle_language.clone(),
        )
    }
}
