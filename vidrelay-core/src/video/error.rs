use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VideoError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("video {video_id} not found")]
    NotFound { video_id: String },
    #[error("cannot extract a video id from {input:?}")]
    InvalidSource { input: String },
    #[error("video store path not configured")]
    MissingStore,
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
}

pub type VideoResult<T> = std::result::Result<T, VideoError>;
