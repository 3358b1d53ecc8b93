//! Platform account bindings. Credentials are sealed with [`SecretBox`]
//! before they reach the database.

pub mod secret;
pub mod store;

use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::Row;
use serde::Serialize;
use thiserror::Error;

pub use secret::SecretBox;
pub use store::{BindingStore, BindingStoreBuilder};

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("binding store path not configured")]
    MissingStore,
    #[error("binding store needs an encryption key")]
    MissingSecret,
    #[error("no encryption key configured; set {env}")]
    MissingKey { env: String },
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("binding {id} not found for {user_id}/{platform}")]
    NotFound {
        id: i64,
        user_id: String,
        platform: String,
    },
}

pub type AccountResult<T> = std::result::Result<T, AccountError>;

/// Binding as stored. Sealed credential columns are never serialized.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountBinding {
    pub id: i64,
    pub user_id: String,
    pub platform: String,
    pub platform_uid: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub cookies: Option<String>,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    pub is_primary: bool,
    pub status: String,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl AccountBinding {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let last_used_at: Option<NaiveDateTime> = row.get("last_used_at")?;
        let created_at: Option<NaiveDateTime> = row.get("created_at")?;
        let updated_at: Option<NaiveDateTime> = row.get("updated_at")?;
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            platform: row.get("platform")?,
            platform_uid: row.get("platform_uid")?,
            username: row.get("username")?,
            cookies: row.get("cookies")?,
            access_token: row.get("access_token")?,
            refresh_token: row.get("refresh_token")?,
            is_primary: row.get::<_, i64>("is_primary")? != 0,
            status: row.get("status")?,
            last_used_at: last_used_at.map(|dt| Utc.from_utc_datetime(&dt)),
            created_at: created_at.map(|dt| Utc.from_utc_datetime(&dt)),
            updated_at: updated_at.map(|dt| Utc.from_utc_datetime(&dt)),
        })
    }
}

/// Input for [`BindingStore::save`], secrets in plain text.
#[derive(Debug, Clone, Default)]
pub struct NewBinding {
    pub user_id: String,
    pub platform: String,
    pub platform_uid: String,
    pub username: Option<String>,
    pub cookies: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingCredentials {
    pub cookies: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}
