use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::AiSection;

use super::{AiError, AiResult, ChatBackend, ProviderSettings};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub rate_limit_delay: Duration,
}

impl RetryPolicy {
    pub fn from_section(section: &AiSection) -> Self {
        Self {
            max_retries: section.max_retries,
            retry_delay: Duration::from_millis(section.retry_delay_ms),
            rate_limit_delay: Duration::from_millis(section.rate_limit_delay_ms),
        }
    }

    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            retry_delay: Duration::ZERO,
            rate_limit_delay: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_section(&AiSection::default())
    }
}

/// Endpoint for a configured base URL. Full endpoints pass through; bare
/// hosts gain `/v1` before `/chat/completions`.
pub fn chat_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.contains("/chat/completions") {
        return base.to_string();
    }
    if base.ends_with("/v1") {
        format!("{base}/chat/completions")
    } else {
        format!("{base}/v1/chat/completions")
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

/// Chat backend speaking the OpenAI chat-completions dialect.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleClient {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl OpenAiCompatibleClient {
    pub fn new(policy: RetryPolicy) -> AiResult<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client, policy })
    }

    async fn attempt(&self, provider: &ProviderSettings, system: &str, user: &str) -> AiResult<String> {
        let body = json!({
            "model": provider.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "stream": false,
            "temperature": provider.temperature,
            "max_tokens": provider.max_tokens,
        });
        let response = self
            .client
            .post(chat_url(&provider.base_url))
            .header(AUTHORIZATION, format!("Bearer {}", provider.api_key))
            .header(CONTENT_TYPE, "application/json")
            .timeout(provider.timeout)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            if let Ok(CompletionResponse {
                error: Some(error), ..
            }) = serde_json::from_str::<CompletionResponse>(&text)
            {
                return Err(AiError::Api(error.message));
            }
            return Err(AiError::Status {
                status: status.as_u16(),
                body: text.chars().take(500).collect(),
            });
        }

        let parsed: CompletionResponse = serde_json::from_str(&text)?;
        if let Some(error) = parsed.error {
            return Err(AiError::Api(error.message));
        }
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(AiError::EmptyChoices)
    }
}

#[async_trait]
impl ChatBackend for OpenAiCompatibleClient {
    async fn complete(&self, provider: &ProviderSettings, system: &str, user: &str) -> AiResult<String> {
        let mut last_error = None;
        for attempt in 0..=self.policy.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.policy.retry_delay * attempt).await;
            }
            match self.attempt(provider, system, user).await {
                Ok(content) => {
                    debug!(target: "ai", provider = %provider.kind, attempt, chars = content.len(), "completion received");
                    return Ok(content);
                }
                Err(err) => {
                    warn!(target: "ai", provider = %provider.kind, attempt, error = %err, "completion attempt failed");
                    if err.is_rate_limited() && attempt < self.policy.max_retries {
                        tokio::time::sleep(self.policy.rate_limit_delay * (attempt + 1)).await;
                    }
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or(AiError::EmptyChoices))
    }
}
