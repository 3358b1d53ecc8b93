//! Target platform boundary. The pipeline only talks to a [`Publisher`];
//! the shipped adapter drives an external uploader program.

pub mod command;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::command::CommandError;

pub use command::{render_args, CommandPublisher};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("invalid remote id pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("uploader output contained no {what}: {output}")]
    MissingOutput { what: &'static str, output: String },
    #[error("{0} is not configured for this publisher")]
    Unsupported(&'static str),
}

pub type PublishResult<T> = std::result::Result<T, PublishError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishRequest {
    pub video_id: String,
    pub video_path: PathBuf,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    /// Uploaded cover URL, or a local path the uploader reads itself.
    pub cover: Option<String>,
    pub source_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedVideo {
    pub remote_id: String,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn upload_cover(&self, path: &Path) -> PublishResult<String>;

    async fn publish_video(&self, request: &PublishRequest) -> PublishResult<PublishedVideo>;

    async fn attach_subtitle(
        &self,
        remote_id: &str,
        subtitle: &Path,
        language: &str,
    ) -> PublishResult<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// In-memory publisher that records every call.
    #[derive(Default)]
    pub struct RecordingPublisher {
        pub fail_publish: bool,
        pub fail_cover: bool,
        pub published: Mutex<Vec<PublishRequest>>,
        pub attached: Mutex<Vec<(String, PathBuf, String)>>,
        pub on_attach: Option<Box<dyn Fn(&str) + Send + Sync>>,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn upload_cover(&self, path: &Path) -> PublishResult<String> {
            if self.fail_cover {
                return Err(PublishError::Unsupported("cover upload"));
            }
            Ok(format!("https://covers.example/{}", path.display()))
        }

        async fn publish_video(&self, request: &PublishRequest) -> PublishResult<PublishedVideo> {
            if self.fail_publish {
                return Err(PublishError::MissingOutput {
                    what: "remote id",
                    output: String::new(),
                });
            }
            let mut published = self.published.lock().unwrap();
            published.push(request.clone());
            Ok(PublishedVideo {
                remote_id: format!("BV{:010}", published.len()),
            })
        }

        async fn attach_subtitle(
            &self,
            remote_id: &str,
            subtitle: &Path,
            language: &str,
        ) -> PublishResult<()> {
            self.attached.lock().unwrap().push((
                remote_id.to_string(),
                subtitle.to_path_buf(),
                language.to_string(),
            ));
            if let Some(hook) = &self.on_attach {
                hook(remote_id);
            }
            Ok(())
        }
    }
}
