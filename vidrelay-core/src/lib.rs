pub mod account;
pub mod ai;
pub mod asr;
pub mod chain;
pub mod command;
pub mod config;
pub mod cookies;
pub mod error;
pub mod handlers;
pub mod network;
pub mod pipeline;
pub mod publish;
pub mod scheduler;
pub mod sqlite;
pub mod srt;
pub mod state;
pub mod video;

pub use account::{
    AccountBinding, AccountError, AccountResult, BindingCredentials, BindingStore,
    BindingStoreBuilder, NewBinding, SecretBox,
};
pub use ai::{
    AiError, AiResult, AiServiceManager, ChatBackend, ChatReply, OpenAiCompatibleClient,
    ProviderKind, ProviderSettings, ProviderStatus, RetryPolicy,
};
pub use asr::{AsrError, BcutClient};
pub use chain::{
    ChainOrchestrator, ChainOutcome, ChainReport, ChainRunner, ExecutionContext, Fallback,
    FailurePolicy, RunnerReport, Task,
};
pub use command::{CommandError, CommandExecutor, SystemCommandExecutor};
pub use config::{load_relay_config, RelayConfig};
pub use error::{ConfigError, Result};
pub use handlers::{HandlerError, HandlerResult};
pub use network::{CookieSource, NetworkPath};
pub use pipeline::{Pipeline, PipelineError, PipelineResult};
pub use publish::{
    CommandPublisher, PublishError, PublishRequest, PublishResult, PublishedVideo, Publisher,
};
pub use scheduler::{SchedulerError, SchedulerResult, TickReport, UploadScheduler};
pub use srt::SrtCue;
pub use state::ProcessingState;
pub use video::{
    extract_video_id, SqliteVideoStore, SqliteVideoStoreBuilder, SubtitleSegment, VideoError,
    VideoRecord, VideoResult, VideoStatus, VideoSubmission,
};
