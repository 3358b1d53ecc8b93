use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::info;

use crate::chain::{ExecutionContext, Task};
use crate::network::{http_client, with_proxy_fallback, NetworkPath};
use crate::srt::{self, TranscriptDocument, TranscriptEntry};

use super::{HandlerError, HandlerResult};

const YOUTUBE_BASE: &str = "https://www.youtube.com";

/// Writes the transcript as pretty JSON and SRT, then records both on the
/// context.
pub(crate) async fn persist_transcript(
    ctx: &mut ExecutionContext,
    document: &TranscriptDocument,
) -> HandlerResult<()> {
    ctx.state.ensure_dir().await?;
    let json = serde_json::to_string_pretty(document)?;
    tokio::fs::write(&ctx.state.original_json, json).await?;
    let cues = document.to_cues();
    srt::write_file(&ctx.state.original_srt, &cues).await?;
    ctx.transcript = Some(cues);
    ctx.subtitle_path = Some(ctx.state.original_srt.clone());
    Ok(())
}

/// Uses subtitles submitted together with the video.
#[derive(Debug, Default)]
pub struct StoredSubtitleTask;

#[async_trait]
impl Task for StoredSubtitleTask {
    fn name(&self) -> &str {
        "stored_subtitles"
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> bool {
        if ctx.record.subtitles.is_empty() {
            return ctx.fail(self.name(), "no stored subtitles");
        }
        let document = TranscriptDocument {
            transcript: ctx
                .record
                .subtitles
                .iter()
                .map(|segment| TranscriptEntry {
                    start_time: segment.start,
                    duration: segment.duration,
                    content: segment.text.trim().to_string(),
                })
                .collect(),
        };
        match persist_transcript(ctx, &document).await {
            Ok(()) => {
                info!(target: "subtitles", video_id = %ctx.video_id(), lines = document.transcript.len(), "stored subtitles written");
                true
            }
            Err(err) => ctx.fail(self.name(), err),
        }
    }
}

/// Fetches the caption track published on the watch page.
pub struct PlatformSubtitleTask {
    base_url: String,
    proxy: Option<String>,
    timeout: Duration,
}

impl PlatformSubtitleTask {
    pub fn new(proxy: Option<String>, timeout: Duration) -> Self {
        Self {
            base_url: YOUTUBE_BASE.to_string(),
            proxy,
            timeout,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn get_text(&self, url: &str, path: NetworkPath) -> HandlerResult<String> {
        let client = http_client(&path, self.timeout)?;
        let response = client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(HandlerError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.text().await?)
    }

    async fn track_url(&self, video_id: &str) -> HandlerResult<String> {
        let watch_url = format!("{}/watch?v={video_id}", self.base_url);
        let page = with_proxy_fallback("watch_page", self.proxy.as_deref(), |path| {
            self.get_text(&watch_url, path)
        })
        .await?;
        let pattern = Regex::new(&format!(
            r#"{}/api/timedtext\?v=[^"]*"#,
            regex::escape(&self.base_url)
        ))
        .map_err(|err| HandlerError::Invalid(err.to_string()))?;
        let found = pattern
            .find(&page)
            .ok_or_else(|| HandlerError::Missing("no caption track on watch page".into()))?;
        Ok(found.as_str().replace("\\u0026", "&"))
    }

    async fn fetch(&self, video_id: &str) -> HandlerResult<TranscriptDocument> {
        let track = self.track_url(video_id).await?;
        let xml = with_proxy_fallback("timedtext", self.proxy.as_deref(), |path| {
            self.get_text(&track, path)
        })
        .await?;
        let document = parse_timedtext(&xml);
        if document.transcript.is_empty() {
            return Err(HandlerError::Missing("caption track is empty".into()));
        }
        Ok(document)
    }
}

#[async_trait]
impl Task for PlatformSubtitleTask {
    fn name(&self) -> &str {
        "platform_subtitles"
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> bool {
        let video_id = ctx.video_id().to_string();
        if video_id.len() != 11 {
            return ctx.fail(self.name(), "platform captions only exist for YouTube ids");
        }
        let document = match self.fetch(&video_id).await {
            Ok(document) => document,
            Err(err) => return ctx.fail(self.name(), err),
        };
        match persist_transcript(ctx, &document).await {
            Ok(()) => {
                info!(target: "subtitles", video_id = %video_id, lines = document.transcript.len(), "platform captions written");
                true
            }
            Err(err) => ctx.fail(self.name(), err),
        }
    }
}

fn text_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)<text\b([^>]*)>(.*?)</text>").expect("valid regex")
    })
}

fn attribute(attrs: &str, name: &str) -> Option<f64> {
    attrs.split_whitespace().find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key != name {
            return None;
        }
        value.trim_matches(|c| c == '"' || c == '\'').parse().ok()
    })
}

/// Parses `<text start dur>` elements. Entities are decoded twice because
/// caption text arrives HTML-escaped inside XML.
pub fn parse_timedtext(xml: &str) -> TranscriptDocument {
    let transcript = text_pattern()
        .captures_iter(xml)
        .filter_map(|caps| {
            let attrs = caps.get(1)?.as_str();
            let start = attribute(attrs, "start")?;
            let duration = attribute(attrs, "dur").unwrap_or(0.0);
            let content = unescape(&unescape(caps.get(2)?.as_str()))
                .replace('\u{a0}', " ")
                .trim()
                .to_string();
            Some(TranscriptEntry {
                start_time: start,
                duration,
                content,
            })
        })
        .collect();
    TranscriptDocument { transcript }
}

pub fn unescape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(index) = rest.find('&') {
        out.push_str(&rest[..index]);
        rest = &rest[index..];
        let decoded = rest.find(';').filter(|end| *end <= 10).and_then(|end| {
            let entity = &rest[1..end];
            let ch = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some('\u{a0}'),
                _ => {
                    if let Some(hex) = entity.strip_prefix("#x").or_else(|| entity.strip_prefix("#X")) {
                        u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
                    } else if let Some(dec) = entity.strip_prefix('#') {
                        dec.parse().ok().and_then(char::from_u32)
                    } else {
                        None
                    }
                }
            };
            ch.map(|ch| (ch, end))
        });
        match decoded {
            Some((ch, end)) => {
                out.push(ch);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
