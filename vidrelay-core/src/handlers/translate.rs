use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::ai::AiServiceManager;
use crate::chain::{ExecutionContext, Task};
use crate::config::TranslateSection;
use crate::srt::{self, SrtCue};
use crate::video::{SqliteVideoStore, VideoStatus};

use super::{HandlerError, HandlerResult};

#[derive(Debug, Default, Deserialize)]
struct TranslatedMetadata {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Digest of the cues and target language a translation was made from.
/// Stored next to `translated.srt`; a mismatch means the file is stale.
fn source_digest(cues: &[SrtCue], target_language: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(target_language.as_bytes());
    hasher.update([0u8]);
    hasher.update(srt::render(cues).as_bytes());
    hex::encode(hasher.finalize())
}

/// Numbered `<n>|<text>` lines, one per cue, counting from `first`.
pub fn numbered_lines(cues: &[SrtCue], first: usize) -> String {
    cues.iter()
        .enumerate()
        .map(|(offset, cue)| format!("{}|{}", first + offset, cue.text.replace('\n', " ")))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Reads `<n>|<text>` lines back. Lines without a numeric prefix are ignored.
pub fn parse_numbered_lines(reply: &str) -> HashMap<usize, String> {
    reply
        .lines()
        .filter_map(|line| {
            let (number, text) = line.trim().split_once('|')?;
            let number = number.trim().parse().ok()?;
            let text = text.trim();
            (!text.is_empty()).then(|| (number, text.to_string()))
        })
        .collect()
}

/// Extracts the JSON object from a reply that may wrap it in prose or a
/// code fence.
fn json_object(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (start < end).then(|| &reply[start..=end])
}

/// Translates subtitles, title and description through the AI providers.
pub struct TranslateTask {
    store: SqliteVideoStore,
    ai: Arc<AiServiceManager>,
    settings: TranslateSection,
    keep_original_title: bool,
    keep_original_description: bool,
}

impl TranslateTask {
    pub fn new(store: SqliteVideoStore, ai: Arc<AiServiceManager>, settings: TranslateSection) -> Self {
        Self {
            store,
            ai,
            settings,
            keep_original_title: false,
            keep_original_description: false,
        }
    }

    pub fn keep_original(mut self, title: bool, description: bool) -> Self {
        self.keep_original_title = title;
        self.keep_original_description = description;
        self
    }

    async fn source_cues(&self, ctx: &ExecutionContext) -> HandlerResult<Vec<SrtCue>> {
        if let Some(cues) = ctx.transcript.as_ref().filter(|cues| !cues.is_empty()) {
            return Ok(cues.clone());
        }
        let path = ctx
            .subtitle_path
            .clone()
            .unwrap_or_else(|| ctx.state.original_srt.clone());
        if !path.is_file() {
            return Err(HandlerError::Missing(format!(
                "no subtitles to translate at {}",
                path.display()
            )));
        }
        let cues = srt::read_file(&path).await?;
        if cues.is_empty() {
            return Err(HandlerError::Missing(format!("{} holds no cues", path.display())));
        }
        Ok(cues)
    }

    async fn translate_cues(&self, video_id: &str, cues: &[SrtCue]) -> HandlerResult<Vec<SrtCue>> {
        let system = format!(
            "You are a professional subtitle translator. Translate every line into {}. \
             Each input line looks like `<n>|<text>`; answer with exactly one `<n>|<translation>` \
             line per input line, keep the numbers, and add nothing else.",
            self.settings.target_language
        );
        let mut translated = Vec::with_capacity(cues.len());
        for (batch, chunk) in cues.chunks(self.settings.batch_size.max(1)).enumerate() {
            let first = batch * self.settings.batch_size.max(1) + 1;
            let reply = self
                .ai
                .chat_completion(&system, &numbered_lines(chunk, first))
                .await?;
            let lines = parse_numbered_lines(&reply.content);
            let missing = (first..first + chunk.len())
                .filter(|n| !lines.contains_key(n))
                .count();
            if missing > 0 {
                warn!(target: "ai", video_id, batch, missing, "reply skipped lines, keeping originals");
            }
            debug!(target: "ai", video_id, batch, lines = chunk.len(), provider = %reply.provider, "batch translated");
            translated.extend(chunk.iter().enumerate().map(|(offset, cue)| {
                let text = lines
                    .get(&(first + offset))
                    .cloned()
                    .unwrap_or_else(|| cue.text.clone());
                SrtCue::new(cue.start_ms, cue.end_ms, text)
            }));
        }
        Ok(translated)
    }

    async fn translate_metadata(
        &self,
        title: Option<&str>,
        description: Option<&str>,
    ) -> HandlerResult<TranslatedMetadata> {
        let system = format!(
            "Translate the video title and description into {}. Reply with a JSON object \
             {{\"title\": string, \"description\": string}} and nothing else.",
            self.settings.target_language
        );
        let user = serde_json::json!({
            "title": title.unwrap_or_default(),
            "description": description.unwrap_or_default(),
        })
        .to_string();
        let reply = self.ai.chat_completion(&system, &user).await?;
        match json_object(&reply.content).map(serde_json::from_str::<TranslatedMetadata>) {
            Some(Ok(parsed)) => Ok(parsed),
            _ => {
                warn!(target: "ai", provider = %reply.provider, "metadata reply was not JSON, keeping originals");
                Ok(TranslatedMetadata::default())
            }
        }
    }

    async fn translate(&self, ctx: &mut ExecutionContext) -> HandlerResult<()> {
        ctx.state.ensure_dir().await?;
        let video_id = ctx.video_id().to_string();
        let target = ctx.state.translated_srt.clone();

        let cues = self.source_cues(ctx).await?;
        let digest = source_digest(&cues, &self.settings.target_language);
        let stamp = target.with_extension("srt.sha256");
        let current = target.is_file()
            && tokio::fs::read_to_string(&stamp)
                .await
                .is_ok_and(|stored| stored.trim() == digest);
        if current {
            info!(target: "ai", video_id = %video_id, "reusing translated subtitles");
        } else {
            let translated = self.translate_cues(&video_id, &cues).await?;
            srt::write_file(&target, &translated).await?;
            tokio::fs::write(&stamp, &digest).await?;
            info!(target: "ai", video_id = %video_id, cues = translated.len(), "subtitles translated");
        }
        ctx.translated_subtitle_path = Some(target);

        let title = ctx.original_title.clone();
        let description = ctx.original_description.clone();
        let need_title = !self.keep_original_title && ctx.translated_title.is_none();
        let need_description =
            !self.keep_original_description && ctx.translated_description.is_none();
        let metadata = if need_title || need_description {
            self.translate_metadata(title.as_deref(), description.as_deref())
                .await?
        } else {
            TranslatedMetadata::default()
        };
        let pick = |keep: bool, existing: &Option<String>, fresh: Option<String>, original: &Option<String>| {
            if keep {
                return original.clone();
            }
            existing
                .clone()
                .or(fresh.filter(|value| !value.trim().is_empty()))
                .or_else(|| original.clone())
        };
        ctx.translated_title = pick(self.keep_original_title, &ctx.translated_title, metadata.title, &title);
        ctx.translated_description = pick(
            self.keep_original_description,
            &ctx.translated_description,
            metadata.description,
            &description,
        );
        self.store.update_translation(
            &video_id,
            ctx.translated_title.as_deref(),
            ctx.translated_description.as_deref(),
        )?;
        Ok(())
    }
}

#[async_trait]
impl Task for TranslateTask {
    fn name(&self) -> &str {
        "translate"
    }

    fn completes(&self) -> Option<VideoStatus> {
        Some(VideoStatus::Translated)
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> bool {
        match self.translate(ctx).await {
            Ok(()) => true,
            Err(err) => ctx.fail(self.name(), err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::ai::{AiResult, ChatBackend, ProviderKind, ProviderSettings};
    use crate::config::ProviderSection;
    use crate::state::ProcessingState;
    use crate::video::VideoSubmission;

    /// Answers batches by upper-casing each line and metadata with fixed JSON.
    struct EchoBackend {
        prompts: Mutex<Vec<String>>,
        drop_line: Option<usize>,
    }

    #[async_trait]
    impl ChatBackend for EchoBackend {
        async fn complete(&self, _: &ProviderSettings, _: &str, user: &str) -> AiResult<String> {
            self.prompts.lock().unwrap().push(user.to_string());
            if user.starts_with('{') {
                return Ok("```json\n{\"title\": \"标题\", \"description\": \"简介\"}\n```".into());
            }
            Ok(user
                .lines()
                .filter(|line| {
                    let number = line.split('|').next().and_then(|n| n.parse::<usize>().ok());
                    number != self.drop_line
                })
                .map(str::to_uppercase)
                .collect::<Vec<_>>()
                .join("\n"))
        }
    }

    fn manager(backend: Arc<EchoBackend>) -> Arc<AiServiceManager> {
        let section = ProviderSection {
            enabled: true,
            api_key: "k".into(),
            ..ProviderSection::default()
        };
        Arc::new(AiServiceManager::new(
            None,
            vec![ProviderSettings::from_section(ProviderKind::DeepSeek, &section)],
            backend,
        ))
    }

    #[test]
    fn numbered_line_parsing() {
        let parsed = parse_numbered_lines("1|你好\n garbage\n3| a|b \n4|");
        assert_eq!(parsed.get(&1).map(String::as_str), Some("你好"));
        assert_eq!(parsed.get(&3).map(String::as_str), Some("a|b"));
        assert!(!parsed.contains_key(&4));
        assert_eq!(parsed.len(), 2);
    }

    #[tokio::test]
    async fn batches_keep_numbering_and_fill_gaps() {
        let root = tempfile::tempdir().unwrap();
        let store = SqliteVideoStore::new(root.path().join("db.sqlite")).unwrap();
        store.initialize().unwrap();
        let mut submission = VideoSubmission::from_url("dQw4w9WgXcQ");
        submission.title = Some("Title".into());
        let record = store.submit(&submission).unwrap();

        let backend = Arc::new(EchoBackend {
            prompts: Mutex::new(Vec::new()),
            drop_line: Some(3),
        });
        let task = TranslateTask::new(
            store.clone(),
            manager(backend.clone()),
            TranslateSection {
                batch_size: 2,
                ..TranslateSection::default()
            },
        )
        .keep_original(false, true);
        let mut ctx = ExecutionContext::new(ProcessingState::new(root.path(), "dQw4w9WgXcQ"), record);
        ctx.transcript = Some(vec![
            SrtCue::new(0, 1000, "one"),
            SrtCue::new(1000, 2000, "two"),
            SrtCue::new(2000, 3000, "three"),
        ]);

        assert!(task.execute(&mut ctx).await, "{:?}", ctx.error);
        let cues = srt::read_file(&ctx.state.translated_srt).await.unwrap();
        let texts: Vec<&str> = cues.iter().map(|cue| cue.text.as_str()).collect();
        assert_eq!(texts, vec!["ONE", "TWO", "three"]);

        let prompts = backend.prompts.lock().unwrap().clone();
        assert_eq!(prompts[0], "1|one\n2|two");
        assert_eq!(prompts[1], "3|three");
        assert_eq!(prompts.len(), 3);

        let stored = store.require("dQw4w9WgXcQ").unwrap();
        assert_eq!(stored.translated_title.as_deref(), Some("标题"));
        assert_eq!(stored.translated_description, None);
    }

    async fn submit_and_translate(
        store: &SqliteVideoStore,
        task: &TranslateTask,
        root: &std::path::Path,
        text: &str,
    ) -> String {
        use crate::handlers::StoredSubtitleTask;
        use crate::video::SubtitleSegment;

        let mut submission = VideoSubmission::from_url("dQw4w9WgXcQ");
        submission.subtitles = vec![SubtitleSegment {
            start: 0.0,
            duration: 1.0,
            text: text.into(),
        }];
        let record = store.submit(&submission).unwrap();
        let mut ctx = ExecutionContext::new(ProcessingState::new(root, "dQw4w9WgXcQ"), record);
        assert!(StoredSubtitleTask.execute(&mut ctx).await);
        assert!(task.execute(&mut ctx).await, "{:?}", ctx.error);
        std::fs::read_to_string(&ctx.state.translated_srt).unwrap()
    }

    #[tokio::test]
    async fn resubmitted_subtitles_replace_stale_translation() {
        let root = tempfile::tempdir().unwrap();
        let store = SqliteVideoStore::new(root.path().join("db.sqlite")).unwrap();
        store.initialize().unwrap();
        let backend = Arc::new(EchoBackend {
            prompts: Mutex::new(Vec::new()),
            drop_line: None,
        });
        let task = TranslateTask::new(store.clone(), manager(backend.clone()), TranslateSection::default())
            .keep_original(true, true);

        let old = submit_and_translate(&store, &task, root.path(), "old").await;
        assert_eq!(old, "1\n00:00:00,000 --> 00:00:01,000\nOLD\n\n");
        let new = submit_and_translate(&store, &task, root.path(), "new").await;
        assert_eq!(new, "1\n00:00:00,000 --> 00:00:01,000\nNEW\n\n");
        assert_eq!(backend.prompts.lock().unwrap().len(), 2);

        // Same source again: the file is reused without another call.
        let again = submit_and_translate(&store, &task, root.path(), "new").await;
        assert_eq!(again, new);
        assert_eq!(backend.prompts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_subtitles_fail_without_calls() {
        let root = tempfile::tempdir().unwrap();
        let store = SqliteVideoStore::new(root.path().join("db.sqlite")).unwrap();
        store.initialize().unwrap();
        let record = store.submit(&VideoSubmission::from_url("dQw4w9WgXcQ")).unwrap();
        let backend = Arc::new(EchoBackend {
            prompts: Mutex::new(Vec::new()),
            drop_line: None,
        });
        let task = TranslateTask::new(store, manager(backend.clone()), TranslateSection::default());
        let mut ctx = ExecutionContext::new(ProcessingState::new(root.path(), "dQw4w9WgXcQ"), record);
        assert!(!task.execute(&mut ctx).await);
        assert!(ctx.error.unwrap().contains("no subtitles to translate"));
        assert!(backend.prompts.lock().unwrap().is_empty());
    }
}
