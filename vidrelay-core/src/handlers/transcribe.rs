use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::asr::BcutClient;
use crate::chain::{ExecutionContext, Task};
use crate::command::{run_with_timeout, CommandExecutor};
use crate::config::DownloaderSection;
use crate::srt;

use super::download::find_downloaded_file;
use super::{HandlerError, HandlerResult};

/// Speech recognition over the video's audio track.
pub struct TranscribeTask {
    client: BcutClient,
    ffmpeg_path: String,
    audio_timeout: Duration,
    executor: Arc<dyn CommandExecutor>,
}

impl TranscribeTask {
    pub fn new(
        client: BcutClient,
        downloader: &DownloaderSection,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            client,
            ffmpeg_path: downloader.ffmpeg_path.clone(),
            audio_timeout: Duration::from_secs(downloader.audio_timeout_secs),
            executor,
        }
    }

    fn extract_command(&self, video: &Path, wav: &Path) -> Command {
        let mut command = Command::new(&self.ffmpeg_path);
        command
            .arg("-y")
            .arg("-i")
            .arg(video)
            .args(["-vn", "-ac", "1", "-ar", "16000", "-c:a", "pcm_s16le"])
            .arg(wav);
        command
    }

    async fn audio_source(&self, ctx: &ExecutionContext) -> HandlerResult<PathBuf> {
        if let Some(existing) = ctx.state.existing_audio() {
            return Ok(existing.to_path_buf());
        }
        let video = ctx
            .downloaded_file
            .clone()
            .or_else(|| find_downloaded_file(&ctx.state.current_dir, ctx.video_id()))
            .ok_or_else(|| HandlerError::Missing("no audio or video file to transcribe".into()))?;
        let wav = ctx.state.original_wav.clone();
        let mut command = self.extract_command(&video, &wav);
        run_with_timeout(self.executor.as_ref(), &mut command, self.audio_timeout).await?;
        if !wav.is_file() {
            return Err(HandlerError::Missing(format!(
                "audio extraction produced no {}",
                wav.display()
            )));
        }
        info!(target: "asr", video_id = %ctx.video_id(), wav = %wav.display(), "audio extracted");
        Ok(wav)
    }

    async fn transcribe(&self, ctx: &mut ExecutionContext) -> HandlerResult<usize> {
        ctx.state.ensure_dir().await?;
        let audio_path = self.audio_source(ctx).await?;
        let audio = tokio::fs::read(&audio_path).await?;
        let cues = self.client.transcribe(&audio).await?;
        if cues.is_empty() {
            return Err(HandlerError::Missing("recognition returned no speech".into()));
        }
        srt::write_file(&ctx.state.original_srt, &cues).await?;
        let count = cues.len();
        ctx.transcript = Some(cues);
        ctx.subtitle_path = Some(ctx.state.original_srt.clone());
        Ok(count)
    }
}

#[async_trait]
impl Task for TranscribeTask {
    fn name(&self) -> &str {
        "transcribe"
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> bool {
        match self.transcribe(ctx).await {
            Ok(count) => {
                info!(target: "asr", video_id = %ctx.video_id(), cues = count, "transcript written");
                true
            }
            Err(err) => ctx.fail(self.name(), err),
        }
    }
}
