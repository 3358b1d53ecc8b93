pub mod error;
pub mod intake;
pub mod models;
pub mod store;

pub use error::{VideoError, VideoResult};
pub use intake::{extract_video_id, source_url_for, VideoSubmission};
pub use models::{SubtitleSegment, VideoRecord, VideoStatus};
pub use store::{SqliteVideoStore, SqliteVideoStoreBuilder};
