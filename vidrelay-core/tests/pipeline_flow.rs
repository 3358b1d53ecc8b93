use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use vidrelay_core::ai::{AiResult, ChatBackend};
use vidrelay_core::chain::Task;
use vidrelay_core::config::{ChainSection, PublisherSection, SchedulerSection, TranslateSection};
use vidrelay_core::handlers::{
    CoverUploadTask, DownloadTask, StoredSubtitleTask, TranslateTask, UploadTask,
};
use vidrelay_core::publish::PublishResult;
use vidrelay_core::{
    AiServiceManager, ChainOrchestrator, ChainRunner, CommandExecutor, CookieSource, Fallback,
    FailurePolicy, ProcessingState, ProviderKind, ProviderSettings, PublishRequest,
    PublishedVideo, Publisher, SqliteVideoStore, SubtitleSegment, UploadScheduler, VideoStatus,
    VideoSubmission,
};

const VIDEO_ID: &str = "dQw4w9WgXcQ";

/// Stands in for `yt-dlp`: writes the video on download and prints
/// metadata on `--dump-json`.
#[derive(Default)]
struct FakeDownloader {
    downloads: Mutex<usize>,
}

#[async_trait]
impl CommandExecutor for FakeDownloader {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        let stdout = if args.iter().any(|arg| arg == "--dump-json") {
            r#"{"title":"Never Gonna Give You Up","description":"Official video","uploader":"Rick"}"#
                .to_string()
        } else {
            let index = args.iter().position(|arg| arg == "-P").unwrap();
            std::fs::write(Path::new(&args[index + 1]).join(format!("{VIDEO_ID}.mp4")), b"mp4")?;
            *self.downloads.lock().unwrap() += 1;
            String::new()
        };
        Ok(Output {
            status: ExitStatus::from_raw(0),
            stdout: stdout.into_bytes(),
            stderr: Vec::new(),
        })
    }
}

/// Prefixes every numbered line and answers metadata prompts with JSON.
struct Translator;

#[async_trait]
impl ChatBackend for Translator {
    async fn complete(&self, _: &ProviderSettings, _: &str, user: &str) -> AiResult<String> {
        if user.starts_with('{') {
            return Ok(r#"{"title":"永远不会放弃你","description":"官方视频"}"#.into());
        }
        Ok(user
            .lines()
            .map(|line| match line.split_once('|') {
                Some((n, text)) => format!("{n}|译:{text}"),
                None => line.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

#[derive(Default)]
struct FakePublisher {
    published: Mutex<Vec<PublishRequest>>,
    attached: Mutex<Vec<(String, PathBuf)>>,
}

#[async_trait]
impl Publisher for FakePublisher {
    async fn upload_cover(&self, path: &Path) -> PublishResult<String> {
        Ok(path.display().to_string())
    }

    async fn publish_video(&self, request: &PublishRequest) -> PublishResult<PublishedVideo> {
        self.published.lock().unwrap().push(request.clone());
        Ok(PublishedVideo {
            remote_id: "BV1GJ411x7h7".into(),
        })
    }

    async fn attach_subtitle(&self, remote_id: &str, subtitle: &Path, _: &str) -> PublishResult<()> {
        self.attached
            .lock()
            .unwrap()
            .push((remote_id.to_string(), subtitle.to_path_buf()));
        Ok(())
    }
}

fn ai() -> Arc<AiServiceManager> {
    let settings = ProviderSettings::from_section(
        ProviderKind::OpenAiCompatible,
        &vidrelay_core::config::ProviderSection {
            enabled: true,
            api_key: "k".into(),
            ..Default::default()
        },
    );
    Arc::new(AiServiceManager::new(None, vec![settings], Arc::new(Translator)))
}

#[tokio::test]
async fn video_moves_from_intake_to_subtitle_attach() {
    let root = tempfile::tempdir().unwrap();
    let work_dir = root.path().join("videos");
    let store = SqliteVideoStore::new(root.path().join("vidrelay.sqlite")).unwrap();
    store.initialize().unwrap();

    let mut submission = VideoSubmission::from_url(format!("https://www.youtube.com/watch?v={VIDEO_ID}"));
    submission.subtitles = vec![
        SubtitleSegment {
            start: 0.0,
            duration: 1.5,
            text: "Never gonna give you up".into(),
        },
        SubtitleSegment {
            start: 1.5,
            duration: 2.0,
            text: "Never gonna let you down".into(),
        },
    ];
    store.submit(&submission).unwrap();

    let downloader = Arc::new(FakeDownloader::default());
    let intake_tasks: Vec<Arc<dyn Task>> = vec![
        Arc::new(DownloadTask::new(
            store.clone(),
            Default::default(),
            None,
            CookieSource::Browser("chrome".into()),
            downloader.clone(),
        )),
        Arc::new(
            Fallback::new("subtitles", vec![Arc::new(StoredSubtitleTask) as Arc<dyn Task>])
                .completing(VideoStatus::Captioned),
        ),
        Arc::new(TranslateTask::new(store.clone(), ai(), TranslateSection::default())),
    ];
    let intake = Arc::new(ChainOrchestrator::new("intake", store.clone(), &work_dir, intake_tasks));
    let runner = ChainRunner::new(store.clone(), Arc::clone(&intake), ChainSection::default());

    let report = runner.run_once().await.unwrap();
    assert_eq!(report.completed, 1, "{report:?}");
    let record = store.require(VIDEO_ID).unwrap();
    assert_eq!(record.status, VideoStatus::Translated);
    assert_eq!(record.title.as_deref(), Some("Never Gonna Give You Up"));
    assert_eq!(record.translated_title.as_deref(), Some("永远不会放弃你"));

    let state = ProcessingState::new(&work_dir, VIDEO_ID);
    let original = std::fs::read(&state.original_srt).unwrap();
    let translated = std::fs::read_to_string(&state.translated_srt).unwrap();
    assert!(translated.starts_with("1\n00:00:00,000 --> 00:00:01,500\n译:Never gonna give you up\n\n"));

    // Re-running completed stages reuses artifacts and keeps one record.
    assert!(intake.run(VIDEO_ID).await.unwrap().succeeded());
    assert_eq!(*downloader.downloads.lock().unwrap(), 1);
    assert_eq!(std::fs::read(&state.original_srt).unwrap(), original);
    assert_eq!(std::fs::read_to_string(&state.translated_srt).unwrap(), translated);
    assert_eq!(store.list(None, 10).unwrap().len(), 1);

    let publisher = Arc::new(FakePublisher::default());
    let upload_tasks: Vec<Arc<dyn Task>> = vec![
        Arc::new(CoverUploadTask::new(publisher.clone(), false)),
        Arc::new(UploadTask::new(store.clone(), publisher.clone(), PublisherSection::default())),
    ];
    let upload = Arc::new(
        ChainOrchestrator::new("upload", store.clone(), &work_dir, upload_tasks)
            .with_failure_policy(FailurePolicy::NoteOnly),
    );
    let scheduler = UploadScheduler::new(
        store.clone(),
        upload,
        publisher.clone(),
        &work_dir,
        SchedulerSection::default(),
        "zh-CN",
    );

    let now = Utc::now();
    let tick = scheduler.run_tick(now).await.unwrap();
    assert_eq!(tick.published, 1);
    assert_eq!(tick.attached, 0);
    let request = publisher.published.lock().unwrap()[0].clone();
    assert_eq!(request.title, "永远不会放弃你");
    assert_eq!(request.source_url, format!("https://www.youtube.com/watch?v={VIDEO_ID}"));
    assert!(request.video_path.ends_with(format!("{VIDEO_ID}.mp4")));

    let record = store.require(VIDEO_ID).unwrap();
    assert_eq!(record.status, VideoStatus::Uploaded);
    assert_eq!(record.remote_id.as_deref(), Some("BV1GJ411x7h7"));

    let tick = scheduler
        .run_tick(now + chrono::Duration::seconds(3601))
        .await
        .unwrap();
    assert_eq!(tick.attached, 1);
    let attached = publisher.attached.lock().unwrap().clone();
    assert_eq!(attached, vec![("BV1GJ411x7h7".to_string(), state.translated_srt.clone())]);
    assert!(store.require(VIDEO_ID).unwrap().subtitle_attached);
}
