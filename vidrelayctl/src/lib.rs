use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vidrelay_core::chain::ChainOutcome;
use vidrelay_core::cookies::{self, CookieImport};
use vidrelay_core::{
    load_relay_config, srt, AccountBinding, BindingStore, ChainReport, ChatReply, Pipeline,
    ProviderStatus, RelayConfig, RunnerReport, SecretBox, SqliteVideoStore, SubtitleSegment,
    SystemCommandExecutor, TickReport, VideoRecord, VideoStatus, VideoSubmission,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] vidrelay_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Video(#[from] vidrelay_core::VideoError),
    #[error(transparent)]
    Pipeline(#[from] vidrelay_core::PipelineError),
    #[error(transparent)]
    Ai(#[from] vidrelay_core::AiError),
    #[error(transparent)]
    Account(#[from] vidrelay_core::AccountError),
    #[error(transparent)]
    Scheduler(#[from] vidrelay_core::SchedulerError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("chain failed at {stage}: {error}")]
    ChainFailed { stage: String, error: String },
}

#[derive(Parser, Debug)]
#[command(author, version, about = "vidrelay control interface", long_about = None)]
pub struct Cli {
    /// Path to vidrelay.toml
    #[arg(long, default_value = "configs/vidrelay.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Log filter, e.g. `debug` or `chain=debug,ai=info`. Overrides RUST_LOG.
    #[arg(long)]
    pub log_level: Option<String>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create data directories and database schemas
    Init,
    /// Record counts per status and AI provider health
    Status,
    /// Video intake records
    #[command(subcommand)]
    Video(VideoCommands),
    /// Intake chain
    #[command(subcommand)]
    Chain(ChainCommands),
    /// Run the chain runner and the upload scheduler until Ctrl-C
    Serve,
    /// Upload scheduler
    #[command(subcommand)]
    Schedule(ScheduleCommands),
    /// AI providers
    #[command(subcommand)]
    Ai(AiCommands),
    /// Platform account bindings
    #[command(subcommand)]
    Account(AccountCommands),
    /// Downloader cookies
    #[command(subcommand)]
    Cookies(CookieCommands),
    /// Print shell completions
    Completions(CompletionsArgs),
}

#[derive(Subcommand, Debug)]
pub enum VideoCommands {
    /// Submit a video URL or id, resetting an existing record
    Submit(VideoSubmitArgs),
    /// List records
    List(VideoListArgs),
    /// Show one record
    Show(VideoIdArgs),
    /// Put a record back to pending
    Reset(VideoIdArgs),
}

#[derive(Args, Debug)]
pub struct VideoSubmitArgs {
    /// Video URL or bare id
    pub url: String,
    #[arg(long)]
    pub title: Option<String>,
    #[arg(long)]
    pub description: Option<String>,
    /// Subtitles as a JSON segment array or an SRT file
    #[arg(long)]
    pub subtitles: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct VideoListArgs {
    /// Filter by status
    #[arg(long)]
    pub status: Option<VideoStatus>,
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct VideoIdArgs {
    pub video_id: String,
}

#[derive(Subcommand, Debug)]
pub enum ChainCommands {
    /// Run the intake chain once for one video
    Run(VideoIdArgs),
    /// Process one batch of eligible records
    Once,
}

#[derive(Subcommand, Debug)]
pub enum ScheduleCommands {
    /// Run one scheduler tick now
    Tick,
}

#[derive(Subcommand, Debug)]
pub enum AiCommands {
    /// Provider configuration and availability
    Status,
    /// Send one prompt through the failover chain
    Chat(AiChatArgs),
}

#[derive(Args, Debug)]
pub struct AiChatArgs {
    pub prompt: String,
    #[arg(long, default_value = "You are a helpful assistant.")]
    pub system: String,
}

#[derive(Subcommand, Debug)]
pub enum AccountCommands {
    /// List a user's bindings
    List(AccountListArgs),
    /// Make a binding the user's primary one for its platform
    SetPrimary(AccountSetPrimaryArgs),
}

#[derive(Args, Debug)]
pub struct AccountListArgs {
    pub user_id: String,
    #[arg(long)]
    pub platform: Option<String>,
}

#[derive(Args, Debug)]
pub struct AccountSetPrimaryArgs {
    pub user_id: String,
    pub platform: String,
    pub binding_id: i64,
}

#[derive(Subcommand, Debug)]
pub enum CookieCommands {
    /// Convert a browser export or `name=value;` string into cookies.txt
    Import(CookieImportArgs),
}

#[derive(Args, Debug)]
pub struct CookieImportArgs {
    pub file: PathBuf,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    #[arg(value_enum)]
    pub shell: Shell,
}

/// Installs the global subscriber. `--log-level` wins over `RUST_LOG`,
/// which wins over `info`.
pub fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

pub fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(args.shell, &mut command, "vidrelayctl", &mut io::stdout());
        return Ok(());
    }

    init_tracing(cli.log_level.as_deref());
    let context = AppContext::new(&cli.config)?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(context.dispatch(&cli.command, cli.format))
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: RelayConfig,
}

impl AppContext {
    fn new(config_path: &Path) -> Result<Self> {
        let config = load_relay_config(config_path)?;
        Ok(Self { config })
    }

    async fn dispatch(&self, command: &Commands, format: OutputFormat) -> Result<()> {
        match command {
            Commands::Init => render(&self.init()?, format),
            Commands::Status => render(&self.status().await?, format),
            Commands::Video(VideoCommands::Submit(args)) => {
                render(&self.video_submit(args)?, format)
            }
            Commands::Video(VideoCommands::List(args)) => {
                render(&self.video_list(args)?, format)
            }
            Commands::Video(VideoCommands::Show(args)) => {
                render(&self.video_store()?.require(&args.video_id)?, format)
            }
            Commands::Video(VideoCommands::Reset(args)) => {
                let store = self.video_store()?;
                store.reset(&args.video_id)?;
                render(&store.require(&args.video_id)?, format)
            }
            Commands::Chain(ChainCommands::Run(args)) => {
                let report = self.chain_run(&args.video_id).await?;
                render(&report, format)?;
                match report.outcome {
                    ChainOutcome::Completed { .. } => Ok(()),
                    ChainOutcome::Failed { stage, error } => {
                        Err(AppError::ChainFailed { stage, error })
                    }
                }
            }
            Commands::Chain(ChainCommands::Once) => {
                let pipeline = self.pipeline()?;
                let report = pipeline.runner(&self.config).run_once().await?;
                render(&report, format)
            }
            Commands::Serve => self.serve().await,
            Commands::Schedule(ScheduleCommands::Tick) => {
                let pipeline = self.pipeline()?;
                let report = pipeline.scheduler(&self.config).run_tick(Utc::now()).await?;
                render(&report, format)
            }
            Commands::Ai(AiCommands::Status) => {
                let manager = vidrelay_core::AiServiceManager::from_config(&self.config.ai)?;
                render(&ProviderReport(manager.statuses().await), format)
            }
            Commands::Ai(AiCommands::Chat(args)) => {
                let manager = vidrelay_core::AiServiceManager::from_config(&self.config.ai)?;
                let reply = manager.chat_completion(&args.system, &args.prompt).await?;
                render(&reply, format)
            }
            Commands::Account(AccountCommands::List(args)) => {
                let store = self.binding_store()?;
                let bindings = store.list_user_bindings(&args.user_id, args.platform.as_deref())?;
                render(&BindingList(bindings), format)
            }
            Commands::Account(AccountCommands::SetPrimary(args)) => {
                let store = self.binding_store()?;
                store.set_primary(&args.user_id, &args.platform, args.binding_id)?;
                let bindings = store.list_user_bindings(&args.user_id, Some(&args.platform))?;
                render(&BindingList(bindings), format)
            }
            Commands::Cookies(CookieCommands::Import(args)) => {
                let raw = fs::read_to_string(&args.file)?;
                let import = cookies::import(
                    &raw,
                    &self.config.config_dir(),
                    &self.config.cookie_archive_dir(),
                )?;
                render(&CookieReport::from(import), format)
            }
            Commands::Completions(_) => Ok(()),
        }
    }

    fn video_store(&self) -> Result<SqliteVideoStore> {
        let path = self.config.database_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let store = SqliteVideoStore::new(path)?;
        store.initialize()?;
        Ok(store)
    }

    fn binding_store(&self) -> Result<BindingStore> {
        let path = self.config.accounts_database_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let store = BindingStore::builder()
            .path(path)
            .secret(SecretBox::from_config(&self.config.security)?)
            .build()?;
        store.initialize()?;
        Ok(store)
    }

    fn pipeline(&self) -> Result<Pipeline> {
        Ok(Pipeline::from_config(
            &self.config,
            Arc::new(SystemCommandExecutor),
        )?)
    }

    fn init(&self) -> Result<InitReport> {
        let work_dir = self.config.work_dir();
        fs::create_dir_all(&work_dir)?;
        fs::create_dir_all(self.config.cookie_archive_dir())?;
        self.video_store()?;

        let accounts = match self.binding_store() {
            Ok(store) => {
                drop(store);
                Some(self.config.accounts_database_path())
            }
            Err(AppError::Account(err)) => {
                warn!(target: "accounts", error = %err, "account store not initialized");
                None
            }
            Err(err) => return Err(err),
        };
        info!(target: "chain", work_dir = %work_dir.display(), "workspace initialized");
        Ok(InitReport {
            database: self.config.database_path(),
            accounts_database: accounts,
            work_dir,
        })
    }

    async fn status(&self) -> Result<StatusReport> {
        let counts = self.video_store()?.count_by_status()?;
        let manager = vidrelay_core::AiServiceManager::from_config(&self.config.ai)?;
        Ok(StatusReport {
            videos: counts.into_iter().collect(),
            providers: manager.statuses().await,
        })
    }

    fn video_submit(&self, args: &VideoSubmitArgs) -> Result<VideoRecord> {
        let mut submission = VideoSubmission::from_url(args.url.clone());
        submission.title = args.title.clone();
        submission.description = args.description.clone();
        if let Some(path) = &args.subtitles {
            submission.subtitles = read_subtitles(path)?;
        }
        let record = self.video_store()?.submit(&submission)?;
        info!(target: "chain", video_id = %record.video_id, subtitles = record.subtitles.len(), "video submitted");
        Ok(record)
    }

    fn video_list(&self, args: &VideoListArgs) -> Result<VideoList> {
        let rows = self.video_store()?.list(args.status, args.limit)?;
        Ok(VideoList { rows })
    }

    async fn chain_run(&self, video_id: &str) -> Result<ChainReport> {
        let pipeline = self.pipeline()?;
        pipeline.store.require(video_id)?;
        Ok(pipeline.intake.run(video_id).await?)
    }

    async fn serve(&self) -> Result<()> {
        let pipeline = self.pipeline()?;
        let runner = pipeline.runner(&self.config);
        let scheduler = pipeline.scheduler(&self.config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let signal = async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(target: "chain", error = %err, "ctrl-c handler failed, shutting down");
            }
            info!(target: "chain", "shutdown requested");
            let _ = shutdown_tx.send(true);
        };
        tokio::join!(
            runner.run(shutdown_rx.clone()),
            scheduler.run(shutdown_rx),
            signal
        );
        Ok(())
    }
}

/// Reads a JSON segment array, or an SRT file when the extension says so.
fn read_subtitles(path: &Path) -> Result<Vec<SubtitleSegment>> {
    let content = fs::read_to_string(path)?;
    let is_srt = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("srt"));
    if !is_srt {
        return Ok(serde_json::from_str(&content)?);
    }
    let segments: Vec<SubtitleSegment> = srt::parse(&content)
        .into_iter()
        .map(|cue| SubtitleSegment {
            start: cue.start_ms as f64 / 1000.0,
            duration: cue.end_ms.saturating_sub(cue.start_ms) as f64 / 1000.0,
            text: cue.text,
        })
        .collect();
    if segments.is_empty() {
        return Err(AppError::InvalidArgument(format!(
            "no cues in {}",
            path.display()
        )));
    }
    Ok(segments)
}

#[derive(Debug, Serialize)]
struct InitReport {
    database: PathBuf,
    accounts_database: Option<PathBuf>,
    work_dir: PathBuf,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    videos: BTreeMap<String, usize>,
    providers: Vec<ProviderStatus>,
}

#[derive(Debug, Serialize)]
struct VideoList {
    rows: Vec<VideoRecord>,
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
struct ProviderReport(Vec<ProviderStatus>);

#[derive(Debug, Serialize)]
#[serde(transparent)]
struct BindingList(Vec<AccountBinding>);

#[derive(Debug, Serialize)]
struct CookieReport {
    active: PathBuf,
    archived: PathBuf,
    pruned: usize,
}

impl From<CookieImport> for CookieReport {
    fn from(import: CookieImport) -> Self {
        Self {
            active: import.active,
            archived: import.archived,
            pruned: import.pruned,
        }
    }
}

fn or_dash(value: Option<&str>) -> &str {
    value.filter(|value| !value.is_empty()).unwrap_or("-")
}

impl DisplayFallback for InitReport {
    fn display(&self) -> String {
        let accounts = match &self.accounts_database {
            Some(path) => path.display().to_string(),
            None => "skipped (no encryption key)".to_string(),
        };
        format!(
            "database: {}\naccounts: {}\nwork dir: {}",
            self.database.display(),
            accounts,
            self.work_dir.display()
        )
    }
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut lines = vec!["Videos:".to_string()];
        if self.videos.is_empty() {
            lines.push("  (none)".to_string());
        }
        for (status, count) in &self.videos {
            lines.push(format!("  {status}: {count}"));
        }
        lines.push("Providers:".to_string());
        lines.push(ProviderReport(self.providers.clone()).display());
        lines.join("\n")
    }
}

impl DisplayFallback for VideoRecord {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("{} [{}]", self.video_id, self.status),
            format!("  title: {}", or_dash(self.title.as_deref())),
            format!(
                "  translated title: {}",
                or_dash(self.translated_title.as_deref())
            ),
            format!("  source: {}", or_dash(self.source_url.as_deref())),
            format!("  subtitles: {} segments", self.subtitles.len()),
            format!("  remote id: {}", or_dash(self.remote_id.as_deref())),
            format!("  subtitle attached: {}", self.subtitle_attached),
            format!("  attempts: {}", self.attempts),
        ];
        if let Some(published) = self.video_published_at {
            lines.push(format!("  published at: {}", published.to_rfc3339()));
        }
        if let Some(error) = &self.last_error {
            lines.push(format!("  last error: {error}"));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for VideoList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No videos found".to_string();
        }
        self.rows
            .iter()
            .map(|row| {
                format!(
                    "{id} | {status} | attempts {attempts} | {title}",
                    id = row.video_id,
                    status = row.status,
                    attempts = row.attempts,
                    title = or_dash(
                        row.translated_title
                            .as_deref()
                            .or(row.title.as_deref())
                    ),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DisplayFallback for ChainReport {
    fn display(&self) -> String {
        match &self.outcome {
            ChainOutcome::Completed { stages } => format!(
                "{} completed ({}) run {}",
                self.video_id,
                stages.join(" -> "),
                self.run_id
            ),
            ChainOutcome::Failed { stage, error } => format!(
                "{} failed at {stage}: {error} (attempts {})",
                self.video_id,
                self.attempts
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "-".to_string())
            ),
        }
    }
}

impl DisplayFallback for RunnerReport {
    fn display(&self) -> String {
        format!(
            "picked {} | completed {} | failed {} | exhausted {}",
            self.picked, self.completed, self.failed, self.exhausted
        )
    }
}

impl DisplayFallback for TickReport {
    fn display(&self) -> String {
        format!(
            "published {} (failed {}) | subtitles attached {} (failed {})",
            self.published, self.publish_failed, self.attached, self.attach_failed
        )
    }
}

impl DisplayFallback for ProviderReport {
    fn display(&self) -> String {
        self.0
            .iter()
            .map(|status| {
                let state = match (status.enabled, status.available) {
                    (false, _) => "disabled",
                    (true, true) => "available",
                    (true, false) => "unavailable",
                };
                let mut line = format!(
                    "  {} ({}) {state} model={} url={}",
                    status.provider, status.name, status.model, status.base_url
                );
                if let Some(error) = &status.last_error {
                    line.push_str(&format!(" last_error={error}"));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DisplayFallback for ChatReply {
    fn display(&self) -> String {
        format!("[{}] {}", self.name, self.content)
    }
}

impl DisplayFallback for BindingList {
    fn display(&self) -> String {
        if self.0.is_empty() {
            return "No bindings found".to_string();
        }
        self.0
            .iter()
            .map(|binding| {
                format!(
                    "{marker} #{id} {platform}/{uid} {name} [{status}]",
                    marker = if binding.is_primary { "*" } else { " " },
                    id = binding.id,
                    platform = binding.platform,
                    uid = binding.platform_uid,
                    name = or_dash(binding.username.as_deref()),
                    status = binding.status,
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DisplayFallback for CookieReport {
    fn display(&self) -> String {
        format!(
            "cookies written to {} (archived {}, pruned {})",
            self.active.display(),
            self.archived.display(),
            self.pruned
        )
    }
}
