use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::{Captures, Regex};
use tokio::process::Command;
use tracing::info;

use crate::command::{run_with_timeout, CommandExecutor};
use crate::config::PublisherSection;

use super::{PublishError, PublishRequest, PublishResult, PublishedVideo, Publisher};

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\{([a-z_]+)\}").expect("valid regex"))
}

/// Expands `{name}` placeholders in every argument in one pass over the
/// template, so substituted text is never expanded again. Unknown names are
/// left as written. An argument naming a placeholder without a value is
/// dropped, together with the flag right before it.
pub fn render_args(template: &[String], values: &[(&str, Option<String>)]) -> Vec<String> {
    let mut rendered: Vec<String> = Vec::with_capacity(template.len());
    for arg in template {
        let mut missing = false;
        let out = placeholder().replace_all(arg, |caps: &Captures<'_>| {
            match values.iter().find(|(name, _)| *name == &caps[1]) {
                Some((_, Some(value))) => value.clone(),
                Some((_, None)) => {
                    missing = true;
                    String::new()
                }
                None => caps[0].to_string(),
            }
        });
        if missing {
            if rendered.last().is_some_and(|prev| prev.starts_with('-')) {
                rendered.pop();
            }
            continue;
        }
        rendered.push(out.into_owned());
    }
    rendered
}

/// Publisher that shells out to an uploader program such as `biliup`.
pub struct CommandPublisher {
    settings: PublisherSection,
    remote_id: Regex,
    url: Regex,
    executor: Arc<dyn CommandExecutor>,
}

impl CommandPublisher {
    pub fn new(settings: PublisherSection, executor: Arc<dyn CommandExecutor>) -> PublishResult<Self> {
        let remote_id = Regex::new(&settings.remote_id_pattern)?;
        let url = Regex::new(r"https?://\S+")?;
        Ok(Self {
            settings,
            remote_id,
            url,
            executor,
        })
    }

    fn command(&self, args: Vec<String>) -> Command {
        let mut command = Command::new(&self.settings.program);
        command.args(args);
        command
    }

    async fn invoke(&self, args: Vec<String>) -> PublishResult<String> {
        let mut command = self.command(args);
        let output = run_with_timeout(
            self.executor.as_ref(),
            &mut command,
            Duration::from_secs(self.settings.timeout_secs),
        )
        .await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn excerpt(output: &str) -> String {
    output.trim().chars().take(300).collect()
}

#[async_trait]
impl Publisher for CommandPublisher {
    async fn upload_cover(&self, path: &Path) -> PublishResult<String> {
        let local = path.display().to_string();
        if self.settings.cover_args.is_empty() {
            return Ok(local);
        }
        let args = render_args(&self.settings.cover_args, &[("cover", Some(local))]);
        let stdout = self.invoke(args).await?;
        let url = self
            .url
            .find(&stdout)
            .map(|found| found.as_str().trim_end_matches(['"', '\'', ',']).to_string())
            .ok_or_else(|| PublishError::MissingOutput {
                what: "cover url",
                output: excerpt(&stdout),
            })?;
        info!(target: "publish", cover = %path.display(), url = %url, "cover uploaded");
        Ok(url)
    }

    async fn publish_video(&self, request: &PublishRequest) -> PublishResult<PublishedVideo> {
        let args = render_args(
            &self.settings.video_args,
            &[
                ("video", Some(request.video_path.display().to_string())),
                ("title", Some(request.title.clone())),
                ("description", Some(request.description.clone())),
                ("tags", Some(request.tags.join(","))),
                ("cover", request.cover.clone()),
                ("source_url", Some(request.source_url.clone())),
            ],
        );
        let stdout = self.invoke(args).await?;
        let remote_id = self
            .remote_id
            .find(&stdout)
            .map(|found| found.as_str().to_string())
            .ok_or_else(|| PublishError::MissingOutput {
                what: "remote id",
                output: excerpt(&stdout),
            })?;
        info!(target: "publish", video_id = %request.video_id, remote_id = %remote_id, "video published");
        Ok(PublishedVideo { remote_id })
    }

    async fn attach_subtitle(
        &self,
        remote_id: &str,
        subtitle: &Path,
        language: &str,
    ) -> PublishResult<()> {
        if self.settings.subtitle_args.is_empty() {
            return Err(PublishError::Unsupported("subtitle attach"));
        }
        let args = render_args(
            &self.settings.subtitle_args,
            &[
                ("remote_id", Some(remote_id.to_string())),
                ("subtitle", Some(subtitle.display().to_string())),
                ("language", Some(language.to_string())),
            ],
        );
        self.invoke(args).await?;
        info!(target: "publish", remote_id, subtitle = %subtitle.display(), language, "subtitle attached");
        Ok(())
    }
}
