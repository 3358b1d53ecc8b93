pub mod client;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{AiSection, ProviderSection};

pub use client::{chat_url, OpenAiCompatibleClient, RetryPolicy};

#[derive(Debug, Error)]
pub enum AiError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("api error: {0}")]
    Api(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("response contained no choices")]
    EmptyChoices,
    #[error("no AI provider configured")]
    NoProviderConfigured,
    #[error("all {attempted} AI providers failed, last error: {last}")]
    AllProvidersFailed { attempted: usize, last: String },
}

impl AiError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, AiError::Api(message) if message.to_lowercase().contains("rate limit"))
    }
}

pub type AiResult<T> = std::result::Result<T, AiError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "openai_compatible")]
    OpenAiCompatible,
    #[serde(rename = "deepseek")]
    DeepSeek,
    #[serde(rename = "gemini")]
    Gemini,
}

impl ProviderKind {
    pub const DEFAULT_ORDER: [ProviderKind; 3] = [
        ProviderKind::OpenAiCompatible,
        ProviderKind::DeepSeek,
        ProviderKind::Gemini,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAiCompatible => "openai_compatible",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::Gemini => "gemini",
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenAiCompatible => "https://api.openai.com/v1",
            ProviderKind::DeepSeek => "https://api.deepseek.com/v1",
            ProviderKind::Gemini => {
                "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions"
            }
        }
    }

    fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::OpenAiCompatible => "gpt-4o-mini",
            ProviderKind::DeepSeek => "deepseek-chat",
            ProviderKind::Gemini => "gemini-1.5-flash",
        }
    }

    fn default_temperature(&self) -> f64 {
        match self {
            ProviderKind::DeepSeek => 0.3,
            _ => 0.7,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai_compatible" | "openai" => Ok(ProviderKind::OpenAiCompatible),
            "deepseek" => Ok(ProviderKind::DeepSeek),
            "gemini" => Ok(ProviderKind::Gemini),
            other => Err(format!("unknown AI provider: {other}")),
        }
    }
}

/// Resolved connection settings for one provider.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub name: String,
    pub enabled: bool,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl ProviderSettings {
    pub fn from_section(kind: ProviderKind, section: &ProviderSection) -> Self {
        let api_key = section.resolved_api_key();
        let non_blank = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        Self {
            kind,
            name: non_blank(&section.vendor).unwrap_or_else(|| kind.as_str().to_string()),
            enabled: section.enabled && !api_key.is_empty(),
            api_key,
            base_url: non_blank(&section.base_url)
                .unwrap_or_else(|| kind.default_base_url().to_string()),
            model: if section.model.trim().is_empty() {
                kind.default_model().to_string()
            } else {
                section.model.trim().to_string()
            },
            temperature: section
                .temperature
                .unwrap_or_else(|| kind.default_temperature()),
            max_tokens: section.max_tokens.unwrap_or(4096),
            timeout: Duration::from_secs(section.timeout_secs.unwrap_or(60)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub provider: ProviderKind,
    pub name: String,
    pub enabled: bool,
    pub available: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub model: String,
    pub base_url: String,
}

impl ProviderStatus {
    fn initial(settings: &ProviderSettings) -> Self {
        Self {
            provider: settings.kind,
            name: settings.name.clone(),
            enabled: settings.enabled,
            available: settings.enabled,
            last_checked: None,
            last_error: None,
            model: settings.model.clone(),
            base_url: settings.base_url.clone(),
        }
    }
}

/// Primary first, then the default order, without duplicates.
pub fn candidate_order(primary: Option<ProviderKind>) -> Vec<ProviderKind> {
    let mut order = Vec::with_capacity(ProviderKind::DEFAULT_ORDER.len());
    for kind in primary.into_iter().chain(ProviderKind::DEFAULT_ORDER) {
        if !order.contains(&kind) {
            order.push(kind);
        }
    }
    order
}

/// First provider in `order` that is enabled and not yet tried.
pub fn select_next(
    order: &[ProviderKind],
    statuses: &[ProviderStatus],
    tried: &[ProviderKind],
) -> Option<ProviderKind> {
    order.iter().copied().find(|kind| {
        !tried.contains(kind)
            && statuses
                .iter()
                .any(|status| status.provider == *kind && status.enabled)
    })
}

pub fn preferred_provider(
    primary: Option<ProviderKind>,
    statuses: &[ProviderStatus],
) -> Option<ProviderKind> {
    select_next(&candidate_order(primary), statuses, &[])
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(&self, provider: &ProviderSettings, system: &str, user: &str)
        -> AiResult<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatReply {
    pub content: String,
    pub provider: ProviderKind,
    pub name: String,
}

/// Routes chat requests across providers, failing over in priority order.
/// Provider status has a single owner behind one lock.
pub struct AiServiceManager {
    primary: Option<ProviderKind>,
    providers: Vec<ProviderSettings>,
    statuses: Mutex<Vec<ProviderStatus>>,
    backend: Arc<dyn ChatBackend>,
}

impl AiServiceManager {
    pub fn new(
        primary: Option<ProviderKind>,
        providers: Vec<ProviderSettings>,
        backend: Arc<dyn ChatBackend>,
    ) -> Self {
        let statuses = providers.iter().map(ProviderStatus::initial).collect();
        Self {
            primary,
            providers,
            statuses: Mutex::new(statuses),
            backend,
        }
    }

    pub fn from_config(section: &AiSection) -> AiResult<Self> {
        let providers = ProviderKind::DEFAULT_ORDER
            .iter()
            .map(|kind| ProviderSettings::from_section(*kind, section.provider(*kind)))
            .collect();
        let backend = OpenAiCompatibleClient::new(RetryPolicy::from_section(section))?;
        Ok(Self::new(section.primary, providers, Arc::new(backend)))
    }

    fn settings(&self, kind: ProviderKind) -> Option<&ProviderSettings> {
        self.providers.iter().find(|settings| settings.kind == kind)
    }

    pub async fn statuses(&self) -> Vec<ProviderStatus> {
        self.statuses.lock().await.clone()
    }

    pub async fn preferred(&self) -> AiResult<ProviderKind> {
        let snapshot = self.statuses().await;
        preferred_provider(self.primary, &snapshot).ok_or(AiError::NoProviderConfigured)
    }

    async fn record(&self, kind: ProviderKind, error: Option<String>) {
        let mut statuses = self.statuses.lock().await;
        if let Some(status) = statuses.iter_mut().find(|status| status.provider == kind) {
            status.available = error.is_none();
            status.last_error = error;
            status.last_checked = Some(Utc::now());
        }
    }

    pub async fn chat_completion(&self, system: &str, user: &str) -> AiResult<ChatReply> {
        let order = candidate_order(self.primary);
        let mut tried = Vec::new();
        let mut last_error: Option<String> = None;

        loop {
            let snapshot = self.statuses().await;
            let Some(kind) = select_next(&order, &snapshot, &tried) else {
                break;
            };
            tried.push(kind);
            let Some(settings) = self.settings(kind) else {
                continue;
            };
            match self.backend.complete(settings, system, user).await {
                Ok(content) => {
                    self.record(kind, None).await;
                    info!(target: "ai", provider = %kind, name = %settings.name, model = %settings.model, "chat completion succeeded");
                    return Ok(ChatReply {
                        content,
                        provider: kind,
                        name: settings.name.clone(),
                    });
                }
                Err(err) => {
                    warn!(target: "ai", provider = %kind, error = %err, "provider failed, trying next");
                    let message = err.to_string();
                    self.record(kind, Some(message.clone())).await;
                    last_error = Some(format!("{kind}: {message}"));
                }
            }
        }

        match last_error {
            Some(last) => Err(AiError::AllProvidersFailed {
                attempted: tried.len(),
                last,
            }),
            None => Err(AiError::NoProviderConfigured),
        }
    }
}
