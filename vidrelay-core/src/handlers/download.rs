use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::chain::{ExecutionContext, Task};
use crate::command::{run_with_timeout, CommandExecutor};
use crate::config::DownloaderSection;
use crate::network::{with_proxy_fallback, CookieSource, NetworkPath};
use crate::video::{source_url_for, SqliteVideoStore, VideoStatus};

use super::{HandlerError, HandlerResult};

const PRIMARY_EXTENSIONS: &[&str] = &["mp4"];
const SECONDARY_EXTENSIONS: &[&str] = &["webm", "mkv", "flv"];

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct VideoMetadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
}

impl VideoMetadata {
    /// Reads the first JSON object line of a `--dump-json` run.
    pub fn parse(stdout: &str) -> HandlerResult<Self> {
        let line = stdout
            .lines()
            .map(str::trim)
            .find(|line| line.starts_with('{'))
            .ok_or_else(|| HandlerError::Invalid("metadata dump produced no JSON".into()))?;
        Ok(serde_json::from_str(line)?)
    }
}

/// Fetches the source video with `yt-dlp`, then its metadata.
pub struct DownloadTask {
    store: SqliteVideoStore,
    settings: DownloaderSection,
    proxy: Option<String>,
    cookies: CookieSource,
    executor: Arc<dyn CommandExecutor>,
}

impl DownloadTask {
    pub fn new(
        store: SqliteVideoStore,
        settings: DownloaderSection,
        proxy: Option<String>,
        cookies: CookieSource,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            store,
            settings,
            proxy,
            cookies,
            executor,
        }
    }

    fn download_command(&self, dir: &Path, source: &str, path: &NetworkPath) -> Command {
        let mut command = Command::new(&self.settings.ytdlp_path);
        command
            .arg("-P")
            .arg(dir)
            .args(["-o", "%(id)s.%(ext)s", "--merge-output-format", "mp4"])
            .args(self.cookies.args());
        if let Some(host) = path.proxy() {
            command.args(["--proxy", host]);
        }
        command.arg("--").arg(source);
        command
    }

    fn metadata_command(&self, source: &str, path: &NetworkPath) -> Command {
        let mut command = Command::new(&self.settings.ytdlp_path);
        command
            .args(["--dump-json", "--no-download"])
            .args(self.cookies.args());
        if let Some(host) = path.proxy() {
            command.args(["--proxy", host]);
        }
        command.arg("--").arg(source);
        command
    }

    async fn download(&self, dir: &Path, video_id: &str, source: &str) -> HandlerResult<PathBuf> {
        let limit = Duration::from_secs(self.settings.timeout_secs);
        with_proxy_fallback("download", self.proxy.as_deref(), |path| {
            let mut command = self.download_command(dir, source, &path);
            let executor = Arc::clone(&self.executor);
            async move {
                run_with_timeout(executor.as_ref(), &mut command, limit)
                    .await
                    .map_err(HandlerError::from)
            }
        })
        .await?;
        find_downloaded_file(dir, video_id)
            .ok_or_else(|| HandlerError::Missing(format!("no video file in {}", dir.display())))
    }

    async fn fetch_metadata(&self, source: &str) -> HandlerResult<VideoMetadata> {
        let limit = Duration::from_secs(self.settings.metadata_timeout_secs);
        let output = with_proxy_fallback("metadata", self.proxy.as_deref(), |path| {
            let mut command = self.metadata_command(source, &path);
            let executor = Arc::clone(&self.executor);
            async move {
                run_with_timeout(executor.as_ref(), &mut command, limit)
                    .await
                    .map_err(HandlerError::from)
            }
        })
        .await?;
        VideoMetadata::parse(&String::from_utf8_lossy(&output.stdout))
    }

    async fn apply_metadata(&self, ctx: &mut ExecutionContext, source: &str) {
        match self.fetch_metadata(source).await {
            Ok(metadata) => {
                let title = metadata.title.filter(|value| !value.trim().is_empty());
                let description = metadata.description.filter(|value| !value.trim().is_empty());
                if let Err(err) =
                    self.store
                        .update_metadata(ctx.video_id(), title.as_deref(), description.as_deref())
                {
                    warn!(target: "download", video_id = %ctx.video_id(), error = %err, "failed to store metadata");
                }
                if title.is_some() {
                    ctx.original_title = title;
                }
                if description.is_some() {
                    ctx.original_description = description;
                }
                info!(target: "download", video_id = %ctx.video_id(), uploader = ?metadata.uploader, duration = ?metadata.duration, "metadata fetched");
            }
            Err(err) => {
                warn!(target: "download", video_id = %ctx.video_id(), error = %err, "metadata fetch failed, continuing");
            }
        }
    }
}

#[async_trait]
impl Task for DownloadTask {
    fn name(&self) -> &str {
        "download"
    }

    fn completes(&self) -> Option<VideoStatus> {
        Some(VideoStatus::Downloaded)
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> bool {
        if let Err(err) = ctx.state.ensure_dir().await {
            return ctx.fail("download", err);
        }
        let dir = ctx.state.current_dir.clone();
        let source = source_url_for(&ctx.record.video_id, ctx.record.source_url.as_deref());

        let file = match find_downloaded_file(&dir, ctx.video_id()) {
            Some(existing) => {
                info!(target: "download", video_id = %ctx.video_id(), file = %existing.display(), "reusing downloaded file");
                existing
            }
            None => {
                info!(target: "download", video_id = %ctx.video_id(), source = %source, "downloading");
                match self.download(&dir, ctx.video_id(), &source).await {
                    Ok(file) => file,
                    Err(err) => return ctx.fail("download", err),
                }
            }
        };
        ctx.downloaded_file = Some(file);

        if ctx.original_title.is_none() || ctx.original_description.is_none() {
            self.apply_metadata(ctx, &source).await;
        }
        true
    }
}

/// Newest `<video_id>.mp4` in `dir`, else the newest `<video_id>.webm|mkv|flv`.
///
/// Only the name the `%(id)s.%(ext)s` template produces counts. Per-format
/// streams (`<id>.f137.mp4`), merge leftovers (`<id>.temp.mp4`) and partial
/// downloads (`<id>.mp4.part`) are ignored so an interrupted run downloads again.
pub fn find_downloaded_file(dir: &Path, video_id: &str) -> Option<PathBuf> {
    newest_with_extension(dir, video_id, PRIMARY_EXTENSIONS)
        .or_else(|| newest_with_extension(dir, video_id, SECONDARY_EXTENSIONS))
}

fn is_finished_output(path: &Path, video_id: &str, extensions: &[&str]) -> bool {
    let stem_matches = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .is_some_and(|stem| stem == video_id);
    let ext_matches = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|wanted| ext.eq_ignore_ascii_case(wanted)));
    stem_matches && ext_matches
}

fn newest_with_extension(dir: &Path, video_id: &str, extensions: &[&str]) -> Option<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| is_finished_output(entry.path(), video_id, extensions))
        .map(|entry| {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|meta| meta.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, entry.into_path())
        })
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
        .map(|(_, path)| path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::ScriptedExecutor;
    use crate::state::ProcessingState;
    use crate::video::VideoSubmission;

    fn setup() -> (tempfile::TempDir, SqliteVideoStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteVideoStore::new(dir.path().join("db.sqlite")).unwrap();
        store.initialize().unwrap();
        store.submit(&VideoSubmission::from_url("dQw4w9WgXcQ")).unwrap();
        (dir, store)
    }

    fn writes_video_file(args: &[String]) {
        if args.iter().any(|arg| arg == "--dump-json") {
            return;
        }
        if let Some(index) = args.iter().position(|arg| arg == "-P") {
            let dir = PathBuf::from(&args[index + 1]);
            std::fs::write(dir.join("dQw4w9WgXcQ.mp4"), b"video").unwrap();
        }
    }

    fn without_proxy(args: &[String]) -> Vec<String> {
        let mut out = Vec::new();
        let mut skip = false;
        for arg in args {
            if skip {
                skip = false;
                continue;
            }
            if arg == "--proxy" {
                skip = true;
                continue;
            }
            out.push(arg.clone());
        }
        out
    }

    fn context(store: &SqliteVideoStore, root: &Path) -> ExecutionContext {
        let record = store.require("dQw4w9WgXcQ").unwrap();
        ExecutionContext::new(ProcessingState::new(root.join("work"), "dQw4w9WgXcQ"), record)
    }

    #[tokio::test]
    async fn proxy_failure_retries_direct_and_reads_metadata() {
        let (root, store) = setup();
        let executor = Arc::new(
            ScriptedExecutor::new()
                .respond(1, "", "proxy refused")
                .respond(0, "", "")
                .respond(0, r#"{"title":"Never Gonna","description":"Classic","uploader":"Rick","duration":212.0}"#, "")
                .with_hook(writes_video_file),
        );
        let task = DownloadTask::new(
            store.clone(),
            DownloaderSection::default(),
            Some("http://127.0.0.1:7890".into()),
            CookieSource::Browser("chrome".into()),
            executor.clone(),
        );
        let mut ctx = context(&store, root.path());

        assert!(task.execute(&mut ctx).await);
        let calls = executor.invocations();
        assert_eq!(calls.len(), 3);
        let (program, proxied) = &calls[0];
        assert_eq!(program, "yt-dlp");
        assert!(proxied.windows(2).any(|pair| pair == ["--proxy", "http://127.0.0.1:7890"]));
        assert_eq!(without_proxy(proxied), calls[1].1);
        assert!(calls[1]
            .1
            .ends_with(&["--".to_string(), "https://www.youtube.com/watch?v=dQw4w9WgXcQ".to_string()]));
        assert!(calls[1].1.windows(2).any(|pair| pair == ["--cookies-from-browser", "chrome"]));

        assert_eq!(
            ctx.downloaded_file.as_deref(),
            Some(ctx.state.current_dir.join("dQw4w9WgXcQ.mp4").as_path())
        );
        assert_eq!(ctx.original_title.as_deref(), Some("Never Gonna"));
        let record = store.require("dQw4w9WgXcQ").unwrap();
        assert_eq!(record.description.as_deref(), Some("Classic"));
    }

    #[tokio::test]
    async fn existing_file_skips_download_and_metadata_failure_is_tolerated() {
        let (root, store) = setup();
        let executor = Arc::new(ScriptedExecutor::new().respond(1, "", "offline"));
        let task = DownloadTask::new(
            store.clone(),
            DownloaderSection::default(),
            None,
            CookieSource::File(PathBuf::from("/etc/cookies.txt")),
            executor.clone(),
        );
        let mut ctx = context(&store, root.path());
        ctx.state.ensure_dir().await.unwrap();
        std::fs::write(ctx.state.current_dir.join("dQw4w9WgXcQ.webm"), b"v").unwrap();

        assert!(task.execute(&mut ctx).await);
        let calls = executor.invocations();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1[0], "--dump-json");
        assert!(calls[0].1.windows(2).any(|pair| pair == ["--cookies", "/etc/cookies.txt"]));
        assert!(ctx.downloaded_file.unwrap().ends_with("dQw4w9WgXcQ.webm"));
    }

    #[tokio::test]
    async fn download_failure_sets_error() {
        let (root, store) = setup();
        let executor = Arc::new(ScriptedExecutor::new().respond(2, "", "ERROR: Video unavailable"));
        let task = DownloadTask::new(
            store.clone(),
            DownloaderSection::default(),
            None,
            CookieSource::Browser("chrome".into()),
            executor,
        );
        let mut ctx = context(&store, root.path());
        assert!(!task.execute(&mut ctx).await);
        assert!(ctx.error.unwrap().contains("Video unavailable"));
    }

    #[test]
    fn prefers_mp4_over_other_containers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.mkv"), b"x").unwrap();
        std::fs::write(dir.path().join("a.mp4.part"), b"x").unwrap();
        assert!(find_downloaded_file(dir.path(), "a").unwrap().ends_with("a.mkv"));
        std::fs::write(dir.path().join("a.mp4"), b"x").unwrap();
        assert!(find_downloaded_file(dir.path(), "a").unwrap().ends_with("a.mp4"));
    }

    #[test]
    fn format_streams_and_merge_leftovers_are_not_a_download() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "dQw4w9WgXcQ.f137.mp4",
            "dQw4w9WgXcQ.f251.webm",
            "dQw4w9WgXcQ.temp.mp4",
            "dQw4w9WgXcQ.mp4.part",
            "other.mp4",
        ] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        assert_eq!(find_downloaded_file(dir.path(), "dQw4w9WgXcQ"), None);

        std::fs::write(dir.path().join("dQw4w9WgXcQ.mp4"), b"merged").unwrap();
        assert!(find_downloaded_file(dir.path(), "dQw4w9WgXcQ")
            .unwrap()
            .ends_with("dQw4w9WgXcQ.mp4"));
    }

    #[tokio::test]
    async fn leftover_format_stream_triggers_a_fresh_download() {
        let (root, store) = setup();
        let executor = Arc::new(
            ScriptedExecutor::new()
                .respond(0, "", "")
                .respond(0, r#"{"title":"t","description":"d"}"#, "")
                .with_hook(writes_video_file),
        );
        let task = DownloadTask::new(
            store.clone(),
            DownloaderSection::default(),
            None,
            CookieSource::Browser("chrome".into()),
            executor.clone(),
        );
        let mut ctx = context(&store, root.path());
        ctx.state.ensure_dir().await.unwrap();
        std::fs::write(ctx.state.current_dir.join("dQw4w9WgXcQ.f137.mp4"), b"video only").unwrap();

        assert!(task.execute(&mut ctx).await, "{:?}", ctx.error);
        let calls = executor.invocations();
        assert!(calls[0].1.iter().any(|arg| arg == "-P"));
        assert_eq!(
            ctx.downloaded_file.as_deref(),
            Some(ctx.state.current_dir.join("dQw4w9WgXcQ.mp4").as_path())
        );
    }

    #[test]
    fn metadata_and_download_share_source_separator() {
        let (root, store) = setup();
        let task = DownloadTask::new(
            store,
            DownloaderSection::default(),
            None,
            CookieSource::Browser("chrome".into()),
            Arc::new(ScriptedExecutor::new()),
        );
        let source = "-dQw4w9WgXcQ";
        let args = |command: Command| -> Vec<String> {
            command
                .as_std()
                .get_args()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect()
        };
        let metadata = args(task.metadata_command(source, &NetworkPath::Direct));
        let download = args(task.download_command(root.path(), source, &NetworkPath::Direct));
        assert!(metadata.ends_with(&["--".to_string(), source.to_string()]));
        assert!(download.ends_with(&["--".to_string(), source.to_string()]));
    }
}
