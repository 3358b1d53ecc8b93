use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::chain::{ExecutionContext, Task};
use crate::config::PublisherSection;
use crate::publish::{PublishRequest, Publisher};
use crate::video::{source_url_for, SqliteVideoStore};

use super::download::find_downloaded_file;
use super::{HandlerError, HandlerResult};

const COVER_EXTENSIONS: &[&str] = &["jpg", "png", "webp"];

/// `cover.<ext>` first, then `<video_id>.<ext>`, inside the working dir.
pub fn find_cover(ctx: &ExecutionContext) -> Option<PathBuf> {
    ["cover", ctx.video_id()]
        .into_iter()
        .flat_map(|stem| {
            COVER_EXTENSIONS
                .iter()
                .map(move |ext| ctx.state.current_dir.join(format!("{stem}.{ext}")))
        })
        .find(|path| path.is_file())
}

/// Uploads the cover image. Missing or failed covers only fail the chain
/// when the publisher requires one.
pub struct CoverUploadTask {
    publisher: Arc<dyn Publisher>,
    required: bool,
}

impl CoverUploadTask {
    pub fn new(publisher: Arc<dyn Publisher>, required: bool) -> Self {
        Self {
            publisher,
            required,
        }
    }
}

#[async_trait]
impl Task for CoverUploadTask {
    fn name(&self) -> &str {
        "cover_upload"
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> bool {
        let Some(cover) = find_cover(ctx) else {
            if self.required {
                return ctx.fail(self.name(), "no cover image in working directory");
            }
            info!(target: "publish", video_id = %ctx.video_id(), "no cover image, publishing without one");
            return true;
        };
        ctx.cover_path = Some(cover.clone());
        match self.publisher.upload_cover(&cover).await {
            Ok(url) => {
                ctx.cover_url = Some(url);
                true
            }
            Err(err) if self.required => ctx.fail(self.name(), err),
            Err(err) => {
                warn!(target: "publish", video_id = %ctx.video_id(), error = %err, "cover upload failed, continuing");
                true
            }
        }
    }
}

/// Publishes the video and records the remote id and publish time.
pub struct UploadTask {
    store: SqliteVideoStore,
    publisher: Arc<dyn Publisher>,
    settings: PublisherSection,
}

impl UploadTask {
    pub fn new(
        store: SqliteVideoStore,
        publisher: Arc<dyn Publisher>,
        settings: PublisherSection,
    ) -> Self {
        Self {
            store,
            publisher,
            settings,
        }
    }

    pub fn build_request(&self, ctx: &ExecutionContext) -> HandlerResult<PublishRequest> {
        let video_path = ctx
            .downloaded_file
            .clone()
            .or_else(|| find_downloaded_file(&ctx.state.current_dir, ctx.video_id()))
            .ok_or_else(|| {
                HandlerError::Missing(format!(
                    "no video file in {}",
                    ctx.state.current_dir.display()
                ))
            })?;
        let title = if self.settings.use_original_title {
            ctx.original_title.clone()
        } else {
            ctx.translated_title.clone().or_else(|| ctx.original_title.clone())
        }
        .unwrap_or_else(|| ctx.video_id().to_string());
        let description = if self.settings.use_original_description {
            ctx.original_description.clone()
        } else {
            ctx.translated_description
                .clone()
                .or_else(|| ctx.original_description.clone())
        }
        .unwrap_or_default();

        Ok(PublishRequest {
            video_id: ctx.video_id().to_string(),
            video_path,
            title,
            description,
            tags: self.settings.tags.clone(),
            cover: ctx.cover_url.clone(),
            source_url: source_url_for(ctx.video_id(), ctx.record.source_url.as_deref()),
        })
    }

    async fn upload(&self, ctx: &mut ExecutionContext) -> HandlerResult<()> {
        let request = self.build_request(ctx)?;
        let published = self.publisher.publish_video(&request).await?;
        let now = Utc::now();
        if !self
            .store
            .mark_published(ctx.video_id(), &published.remote_id, now)?
        {
            warn!(target: "publish", video_id = %ctx.video_id(), status = %ctx.record.status, "record left translated state before publish was stored");
        }
        ctx.record.video_published_at = Some(now);
        ctx.remote_id = Some(published.remote_id);
        Ok(())
    }
}

#[async_trait]
impl Task for UploadTask {
    fn name(&self) -> &str {
        "upload"
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> bool {
        if ctx.record.video_published_at.is_some() {
            info!(target: "publish", video_id = %ctx.video_id(), remote_id = ?ctx.remote_id, "already published");
            return true;
        }
        match self.upload(ctx).await {
            Ok(()) => {
                info!(target: "publish", video_id = %ctx.video_id(), remote_id = ?ctx.remote_id, "upload stored");
                true
            }
            Err(err) => ctx.fail(self.name(), err),
        }
    }
}
