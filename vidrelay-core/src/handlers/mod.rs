//! Pipeline stages. Each handler is a [`Task`](crate::chain::Task) that turns
//! its internal errors into one message on the execution context.

pub mod download;
pub mod subtitles;
pub mod transcribe;
pub mod translate;
pub mod upload;

use thiserror::Error;

use crate::ai::AiError;
use crate::asr::AsrError;
use crate::command::CommandError;
use crate::publish::PublishError;
use crate::video::VideoError;

pub use download::{find_downloaded_file, DownloadTask, VideoMetadata};
pub use subtitles::{PlatformSubtitleTask, StoredSubtitleTask};
pub use transcribe::TranscribeTask;
pub use translate::TranslateTask;
pub use upload::{CoverUploadTask, UploadTask};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected http status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store error: {0}")]
    Video(#[from] VideoError),
    #[error("transcription error: {0}")]
    Asr(#[from] AsrError),
    #[error("ai error: {0}")]
    Ai(#[from] AiError),
    #[error("publish error: {0}")]
    Publish(#[from] PublishError),
    #[error("missing input: {0}")]
    Missing(String),
    #[error("{0}")]
    Invalid(String),
}

pub type HandlerResult<T> = std::result::Result<T, HandlerError>;
