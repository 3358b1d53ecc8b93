use std::io;
use std::path::{Path, PathBuf};

/// Working directory and derived artifact paths for one pipeline run.
///
/// Every path is a pure function of the work root and the video id, so a
/// re-run overwrites the same files instead of scattering new ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingState {
    pub video_id: String,
    pub current_dir: PathBuf,
    pub original_wav: PathBuf,
    pub original_mp3: PathBuf,
    pub original_srt: PathBuf,
    pub original_json: PathBuf,
    pub translated_srt: PathBuf,
}

impl ProcessingState {
    pub fn new(work_dir: impl AsRef<Path>, video_id: impl Into<String>) -> Self {
        let video_id = video_id.into();
        let current_dir = work_dir.as_ref().join(&video_id);
        Self {
            original_wav: current_dir.join("original.wav"),
            original_mp3: current_dir.join("original.mp3"),
            original_srt: current_dir.join("original.srt"),
            original_json: current_dir.join("original.json"),
            translated_srt: current_dir.join("translated.srt"),
            current_dir,
            video_id,
        }
    }

    pub async fn ensure_dir(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.current_dir).await
    }

    /// Audio input for transcription: wav first, then mp3.
    pub fn existing_audio(&self) -> Option<&Path> {
        [&self.original_wav, &self.original_mp3]
            .into_iter()
            .find(|path| path.is_file())
            .map(PathBuf::as_path)
    }

    /// Subtitle file to publish: translated when present, else original.
    pub fn publishable_subtitle(&self) -> Option<&Path> {
        [&self.translated_srt, &self.original_srt]
            .into_iter()
            .find(|path| path.is_file())
            .map(PathBuf::as_path)
    }
}
