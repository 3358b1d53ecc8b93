use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::ai::ProviderKind;
use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RelayConfig {
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub downloader: DownloaderSection,
    #[serde(default)]
    pub subtitles: SubtitlesSection,
    #[serde(default)]
    pub transcription: TranscriptionSection,
    #[serde(default)]
    pub ai: AiSection,
    #[serde(default)]
    pub translate: TranslateSection,
    #[serde(default)]
    pub publisher: PublisherSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub chain: ChainSection,
    #[serde(default)]
    pub security: SecuritySection,
}

impl RelayConfig {
    /// Directory holding the loaded config file. Cookie lookup starts here.
    pub fn config_dir(&self) -> PathBuf {
        self.source_path
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.database)
    }

    pub fn accounts_database_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.accounts_database)
    }

    pub fn work_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.work_dir)
    }

    pub fn cookie_archive_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.data_dir).join("cookies")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_accounts_database")]
    pub accounts_database: String,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            data_dir: default_data_dir(),
            work_dir: default_work_dir(),
            database: default_database(),
            accounts_database: default_accounts_database(),
        }
    }
}

fn default_base_dir() -> String {
    ".".to_string()
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_work_dir() -> String {
    "data/videos".to_string()
}

fn default_database() -> String {
    "data/vidrelay.sqlite".to_string()
}

fn default_accounts_database() -> String {
    "data/accounts.sqlite".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxySection {
    #[serde(default)]
    pub use_proxy: bool,
    #[serde(default)]
    pub host: String,
}

impl ProxySection {
    /// The proxy host when proxying is switched on and a host is set.
    pub fn active_host(&self) -> Option<&str> {
        let host = self.host.trim();
        if self.use_proxy && !host.is_empty() {
            Some(host)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloaderSection {
    #[serde(default = "default_ytdlp")]
    pub ytdlp_path: String,
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_path: String,
    #[serde(default = "default_download_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_metadata_timeout")]
    pub metadata_timeout_secs: u64,
    #[serde(default = "default_audio_timeout")]
    pub audio_timeout_secs: u64,
    #[serde(default = "default_cookie_browser")]
    pub cookie_browser: String,
}

impl Default for DownloaderSection {
    fn default() -> Self {
        Self {
            ytdlp_path: default_ytdlp(),
            ffmpeg_path: default_ffmpeg(),
            timeout_secs: default_download_timeout(),
            metadata_timeout_secs: default_metadata_timeout(),
            audio_timeout_secs: default_audio_timeout(),
            cookie_browser: default_cookie_browser(),
        }
    }
}

fn default_ytdlp() -> String {
    "yt-dlp".to_string()
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_download_timeout() -> u64 {
    3600
}

fn default_metadata_timeout() -> u64 {
    120
}

fn default_audio_timeout() -> u64 {
    900
}

fn default_cookie_browser() -> String {
    "chrome".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtitleSource {
    /// Subtitles submitted together with the video.
    Stored,
    /// Caption track published on the source platform.
    Platform,
    /// Remote speech recognition over the extracted audio.
    Transcribe,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubtitlesSection {
    #[serde(default = "default_subtitle_sources")]
    pub sources: Vec<SubtitleSource>,
}

impl Default for SubtitlesSection {
    fn default() -> Self {
        Self {
            sources: default_subtitle_sources(),
        }
    }
}

fn default_subtitle_sources() -> Vec<SubtitleSource> {
    vec![
        SubtitleSource::Stored,
        SubtitleSource::Platform,
        SubtitleSource::Transcribe,
    ]
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptionSection {
    #[serde(default = "default_bcut_base")]
    pub base_url: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_part_timeout")]
    pub part_timeout_secs: u64,
}

impl TranscriptionSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for TranscriptionSection {
    fn default() -> Self {
        Self {
            base_url: default_bcut_base(),
            poll_interval_ms: default_poll_interval_ms(),
            max_polls: default_max_polls(),
            request_timeout_secs: default_request_timeout(),
            part_timeout_secs: default_part_timeout(),
        }
    }
}

fn default_bcut_base() -> String {
    "https://member.bilibili.com/x/bcut/rubick-interface".to_string()
}

fn default_poll_interval_ms() -> u64 {
    3000
}

fn default_max_polls() -> u32 {
    60
}

fn default_request_timeout() -> u64 {
    30
}

fn default_part_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: String,
    /// Environment variable consulted when `api_key` is empty.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Vendor behind an OpenAI-compatible endpoint (openai, qwen, zhipu, ...).
    #[serde(default)]
    pub vendor: Option<String>,
}

impl ProviderSection {
    pub fn resolved_api_key(&self) -> String {
        if !self.api_key.trim().is_empty() {
            return self.api_key.trim().to_string();
        }
        self.api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .map(|value| value.trim().to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AiSection {
    #[serde(default)]
    pub primary: Option<ProviderKind>,
    #[serde(default)]
    pub openai_compatible: ProviderSection,
    #[serde(default)]
    pub deepseek: ProviderSection,
    #[serde(default)]
    pub gemini: ProviderSection,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_rate_limit_delay_ms")]
    pub rate_limit_delay_ms: u64,
}

impl Default for AiSection {
    fn default() -> Self {
        Self {
            primary: None,
            openai_compatible: ProviderSection::default(),
            deepseek: ProviderSection::default(),
            gemini: ProviderSection::default(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            rate_limit_delay_ms: default_rate_limit_delay_ms(),
        }
    }
}

impl AiSection {
    pub fn provider(&self, kind: ProviderKind) -> &ProviderSection {
        match kind {
            ProviderKind::OpenAiCompatible => &self.openai_compatible,
            ProviderKind::DeepSeek => &self.deepseek,
            ProviderKind::Gemini => &self.gemini,
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_rate_limit_delay_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranslateSection {
    #[serde(default = "default_target_language")]
    pub target_language: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for TranslateSection {
    fn default() -> Self {
        Self {
            target_language: default_target_language(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_target_language() -> String {
    "Simplified Chinese".to_string()
}

fn default_batch_size() -> usize {
    40
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublisherSection {
    #[serde(default = "default_publisher_program")]
    pub program: String,
    #[serde(default = "default_video_args")]
    pub video_args: Vec<String>,
    /// Empty means the cover is handed to `video_args` as a local path.
    #[serde(default)]
    pub cover_args: Vec<String>,
    #[serde(default)]
    pub subtitle_args: Vec<String>,
    #[serde(default = "default_remote_id_pattern")]
    pub remote_id_pattern: String,
    #[serde(default = "default_publish_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub use_original_title: bool,
    #[serde(default)]
    pub use_original_description: bool,
    #[serde(default = "default_subtitle_language")]
    pub subtitle_language: String,
    #[serde(default)]
    pub cover_required: bool,
}

impl Default for PublisherSection {
    fn default() -> Self {
        Self {
            program: default_publisher_program(),
            video_args: default_video_args(),
            cover_args: Vec::new(),
            subtitle_args: Vec::new(),
            remote_id_pattern: default_remote_id_pattern(),
            timeout_secs: default_publish_timeout(),
            tags: Vec::new(),
            use_original_title: false,
            use_original_description: false,
            subtitle_language: default_subtitle_language(),
            cover_required: false,
        }
    }
}

fn default_publisher_program() -> String {
    "biliup".to_string()
}

fn default_video_args() -> Vec<String> {
    [
        "upload",
        "--title",
        "{title}",
        "--desc",
        "{description}",
        "--tag",
        "{tags}",
        "--source",
        "{source_url}",
        "--cover",
        "{cover}",
        "{video}",
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect()
}

fn default_remote_id_pattern() -> String {
    "BV[0-9A-Za-z]{10}".to_string()
}

fn default_publish_timeout() -> u64 {
    1800
}

fn default_subtitle_language() -> String {
    "zh-CN".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_subtitle_delay_secs")]
    pub subtitle_delay_secs: u64,
    #[serde(default = "default_scheduler_batch")]
    pub batch_limit: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            subtitle_delay_secs: default_subtitle_delay_secs(),
            batch_limit: default_scheduler_batch(),
        }
    }
}

fn default_tick_secs() -> u64 {
    3600
}

fn default_subtitle_delay_secs() -> u64 {
    3600
}

fn default_scheduler_batch() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainSection {
    #[serde(default = "default_chain_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_chain_batch")]
    pub batch_limit: usize,
}

impl Default for ChainSection {
    fn default() -> Self {
        Self {
            interval_secs: default_chain_interval(),
            max_attempts: default_max_attempts(),
            batch_limit: default_chain_batch(),
        }
    }
}

fn default_chain_interval() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_chain_batch() -> usize {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecuritySection {
    /// Base64 encoded 32-byte key. Prefer the environment variable.
    #[serde(default)]
    pub encryption_key: Option<String>,
    #[serde(default = "default_key_env")]
    pub encryption_key_env: String,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            encryption_key: None,
            encryption_key_env: default_key_env(),
        }
    }
}

fn default_key_env() -> String {
    "VIDRELAY_ENCRYPTION_KEY".to_string()
}

pub fn load_relay_config<P: AsRef<Path>>(path: P) -> Result<RelayConfig> {
    let path = path.as_ref();
    let mut config: RelayConfig = load_toml(path)?;
    config.source_path = Some(path.to_path_buf());
    validate(&config)?;
    Ok(config)
}

fn validate(config: &RelayConfig) -> Result<()> {
    if config.translate.batch_size == 0 {
        return Err(ConfigError::Invalid {
            field: "translate.batch_size",
            reason: "must be greater than zero".into(),
        });
    }
    if config.transcription.max_polls == 0 {
        return Err(ConfigError::Invalid {
            field: "transcription.max_polls",
            reason: "must be greater than zero".into(),
        });
    }
    if let Err(err) = regex::Regex::new(&config.publisher.remote_id_pattern) {
        return Err(ConfigError::Invalid {
            field: "publisher.remote_id_pattern",
            reason: err.to_string(),
        });
    }
    Ok(())
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
