//! Client for the Bcut speech recognition service.
//!
//! A transcription is six steps: request an upload slot, PUT the audio in
//! parts, commit the parts, create a recognition task, poll it, and turn
//! the utterances into subtitle cues.

use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, ETAG};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::TranscriptionSection;
use crate::network::BROWSER_USER_AGENT;
use crate::srt::SrtCue;

const MODEL_ID: u32 = 7;
const TASK_MODEL_ID: &str = "8";

#[derive(Debug, Error)]
pub enum AsrError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid response payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("service error (code {code}): {message}")]
    Api { code: i64, message: String },
    #[error("response carried no data")]
    MissingData,
    #[error("part {part} upload failed with status {status}")]
    PartStatus { part: usize, status: u16 },
    #[error("part {part} upload failed: {source}")]
    PartTransport {
        part: usize,
        source: reqwest::Error,
    },
    #[error("transcription task failed with error code {error_code}")]
    TaskFailed { error_code: String },
    #[error("transcription task reported unknown status {0}")]
    UnknownStatus(i64),
    #[error("transcription result not ready after {polls} polls")]
    Timeout { polls: u32 },
}

pub type AsrResult<T> = std::result::Result<T, AsrError>;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn checked(self) -> AsrResult<Option<T>> {
        if self.code != 0 {
            return Err(AsrError::Api {
                code: self.code,
                message: self.message,
            });
        }
        Ok(self.data)
    }

    fn into_data(self) -> AsrResult<T> {
        self.checked()?.ok_or(AsrError::MissingData)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadTicket {
    pub upload_id: String,
    pub in_boss_key: String,
    pub per_size: usize,
    pub upload_urls: Vec<String>,
}

#[derive(Debug, Serialize)]
struct PartTag {
    part_number: usize,
    etag: String,
}

#[derive(Debug, Deserialize)]
struct CreatedTask {
    task_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskResult {
    pub status: i64,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error_code: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Utterance {
    pub transcript: String,
    /// Milliseconds.
    pub start_time: u64,
    pub end_time: u64,
}

#[derive(Debug, Deserialize)]
struct RecognitionResult {
    #[serde(default)]
    utterances: Vec<Utterance>,
    #[serde(default)]
    language: Option<String>,
}

pub fn utterances_to_cues(utterances: &[Utterance]) -> Vec<SrtCue> {
    utterances
        .iter()
        .map(|u| SrtCue::new(u.start_time, u.end_time, u.transcript.trim()))
        .collect()
}

#[derive(Debug, Clone)]
pub struct BcutClient {
    base_url: String,
    client: reqwest::Client,
    part_timeout: Duration,
    poll_interval: Duration,
    max_polls: u32,
}

impl BcutClient {
    pub fn new(settings: &TranscriptionSection) -> AsrResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;
        Ok(Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            client,
            part_timeout: Duration::from_secs(settings.part_timeout_secs),
            poll_interval: settings.poll_interval(),
            max_polls: settings.max_polls,
        })
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> AsrResult<Envelope<T>> {
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> AsrResult<Envelope<T>> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(&body)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: serde_json::Value) -> AsrResult<T> {
        self.send_json(path, body).await?.into_data()
    }

    pub async fn request_upload(&self, size: usize) -> AsrResult<UploadTicket> {
        let ticket: UploadTicket = self
            .post(
                "/resource/create",
                json!({
                    "type": 2,
                    "name": "audio.wav",
                    "size": size,
                    "resource_id": 0,
                    "model_id": MODEL_ID,
                }),
            )
            .await?;
        info!(target: "asr", upload_id = %ticket.upload_id, parts = ticket.upload_urls.len(), per_size = ticket.per_size, "upload slot granted");
        Ok(ticket)
    }

    /// PUTs every part in order. The first failing part aborts the upload.
    pub async fn upload_parts(&self, ticket: &UploadTicket, data: &[u8]) -> AsrResult<Vec<String>> {
        let mut etags = Vec::with_capacity(ticket.upload_urls.len());
        for (index, url) in ticket.upload_urls.iter().enumerate() {
            let start = (index * ticket.per_size).min(data.len());
            let end = ((index + 1) * ticket.per_size).min(data.len());
            let response = self
                .client
                .put(url)
                .header(CONTENT_TYPE, "application/octet-stream")
                .timeout(self.part_timeout)
                .body(data[start..end].to_vec())
                .send()
                .await
                .map_err(|source| AsrError::PartTransport {
                    part: index + 1,
                    source,
                })?;
            if response.status() != reqwest::StatusCode::OK {
                return Err(AsrError::PartStatus {
                    part: index + 1,
                    status: response.status().as_u16(),
                });
            }
            let etag = response
                .headers()
                .get(ETAG)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .trim_matches('"')
                .to_string();
            debug!(target: "asr", part = index + 1, bytes = end - start, etag = %etag, "part uploaded");
            etags.push(etag);
        }
        Ok(etags)
    }

    pub async fn commit_upload(&self, ticket: &UploadTicket, etags: &[String]) -> AsrResult<()> {
        let parts: Vec<PartTag> = etags
            .iter()
            .enumerate()
            .map(|(index, etag)| PartTag {
                part_number: index + 1,
                etag: etag.clone(),
            })
            .collect();
        self.send_json::<serde_json::Value>(
            "/resource/create/complete",
            json!({
                "in_boss_key": ticket.in_boss_key,
                "upload_id": ticket.upload_id,
                "model_id": MODEL_ID,
                "parts": parts,
            }),
        )
        .await?
        .checked()?;
        Ok(())
    }

    pub async fn create_task(&self, ticket: &UploadTicket) -> AsrResult<String> {
        let created: CreatedTask = self
            .post(
                "/task",
                json!({
                    "resource": {
                        "in_boss_key": ticket.in_boss_key,
                        "upload_id": ticket.upload_id,
                        "model_id": MODEL_ID,
                    },
                    "model_id": TASK_MODEL_ID,
                }),
            )
            .await?;
        info!(target: "asr", task_id = %created.task_id, "recognition task created");
        Ok(created.task_id)
    }

    pub async fn query_result(&self, task_id: &str) -> AsrResult<TaskResult> {
        let model_id = MODEL_ID.to_string();
        let response = self
            .client
            .get(format!("{}/task/result", self.base_url))
            .query(&[("model_id", model_id.as_str()), ("task_id", task_id)])
            .send()
            .await?;
        Self::decode(response).await?.into_data()
    }

    /// Polls until the task succeeds, fails, or `max_polls` queries pass.
    pub async fn poll_result(&self, task_id: &str) -> AsrResult<Vec<Utterance>> {
        for poll in 1..=self.max_polls {
            let result = self.query_result(task_id).await?;
            match result.status {
                0 | 1 => {
                    debug!(target: "asr", task_id, poll, max_polls = self.max_polls, "recognition in progress");
                    if poll < self.max_polls {
                        tokio::time::sleep(self.poll_interval).await;
                    }
                }
                2 => {
                    let raw = result.result.unwrap_or_default();
                    let parsed: RecognitionResult = serde_json::from_str(&raw)?;
                    info!(target: "asr", task_id, utterances = parsed.utterances.len(), language = ?parsed.language, "recognition finished");
                    return Ok(parsed.utterances);
                }
                3 => {
                    let error_code = match result.error_code {
                        Some(serde_json::Value::String(code)) => code,
                        Some(other) => other.to_string(),
                        None => "unknown".to_string(),
                    };
                    return Err(AsrError::TaskFailed { error_code });
                }
                other => return Err(AsrError::UnknownStatus(other)),
            }
        }
        Err(AsrError::Timeout {
            polls: self.max_polls,
        })
    }

    /// Full pipeline over an in-memory audio file.
    pub async fn transcribe(&self, audio: &[u8]) -> AsrResult<Vec<SrtCue>> {
        let ticket = self.request_upload(audio.len()).await?;
        let etags = self.upload_parts(&ticket, audio).await?;
        self.commit_upload(&ticket, &etags).await?;
        let task_id = self.create_task(&ticket).await?;
        let utterances = self.poll_result(&task_id).await?;
        Ok(utterances_to_cues(&utterances))
    }
}
