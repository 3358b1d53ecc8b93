use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::sqlite::configure_connection;

use super::intake::{extract_video_id, VideoSubmission};
use super::models::{VideoRecord, VideoStatus};
use super::{VideoError, VideoResult};

const VIDEO_SCHEMA: &str = include_str!("../../../sql/videos.sql");

#[derive(Debug, Clone)]
pub struct SqliteVideoStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteVideoStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteVideoStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> VideoResult<SqliteVideoStore> {
        let path = self.path.ok_or(VideoError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };

        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }

        Ok(SqliteVideoStore { path, flags })
    }
}

/// Persistent `videos` table. One row per external video id; status only
/// moves forward except through [`SqliteVideoStore::submit`] and
/// [`SqliteVideoStore::reset`].
#[derive(Debug, Clone)]
pub struct SqliteVideoStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteVideoStore {
    pub fn builder() -> SqliteVideoStoreBuilder {
        SqliteVideoStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> VideoResult<Self> {
        SqliteVideoStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> VideoResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            VideoError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| VideoError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> VideoResult<()> {
        let conn = self.open()?;
        conn.execute_batch(VIDEO_SCHEMA)?;
        Ok(())
    }

    /// Inserts the submission or resets the existing row to `pending`,
    /// clearing every completion flag.
    pub fn submit(&self, submission: &VideoSubmission) -> VideoResult<VideoRecord> {
        let video_id =
            extract_video_id(&submission.url).ok_or_else(|| VideoError::InvalidSource {
                input: submission.url.clone(),
            })?;
        let source_url = if submission.url.trim().starts_with("http") {
            Some(submission.url.trim().to_string())
        } else {
            None
        };
        let subtitles = VideoRecord::serialize_subtitles(&submission.subtitles)?;

        let conn = self.open()?;
        conn.execute(
            "INSERT INTO videos (
                video_id, title, description, source_url, status, subtitles,
                playlist_id, operation_type
            ) VALUES (
                :video_id, :title, :description, :source_url, 'pending', :subtitles,
                :playlist_id, :operation_type
            )
            ON CONFLICT(video_id) DO UPDATE SET
                title = COALESCE(excluded.title, videos.title),
                description = COALESCE(excluded.description, videos.description),
                source_url = COALESCE(excluded.source_url, videos.source_url),
                status = 'pending',
                subtitles = excluded.subtitles,
                playlist_id = excluded.playlist_id,
                operation_type = excluded.operation_type,
                translated_title = NULL,
                translated_description = NULL,
                remote_id = NULL,
                video_published_at = NULL,
                subtitle_attached = 0,
                attempts = 0,
                last_error = NULL,
                updated_at = CURRENT_TIMESTAMP",
            rusqlite::named_params! {
                ":video_id": &video_id,
                ":title": non_empty(submission.title.as_deref()),
                ":description": non_empty(submission.description.as_deref()),
                ":source_url": &source_url,
                ":subtitles": &subtitles,
                ":playlist_id": non_empty(submission.playlist_id.as_deref()),
                ":operation_type": non_empty(submission.operation_type.as_deref()),
            },
        )?;
        drop(conn);
        self.fetch(&video_id)?
            .ok_or(VideoError::NotFound { video_id })
    }

    pub fn fetch(&self, video_id: &str) -> VideoResult<Option<VideoRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM videos WHERE video_id = ?1")?;
        let record = stmt
            .query_row([video_id], |row| VideoRecord::from_row(row))
            .optional()?;
        Ok(record)
    }

    pub fn require(&self, video_id: &str) -> VideoResult<VideoRecord> {
        self.fetch(video_id)?.ok_or_else(|| VideoError::NotFound {
            video_id: video_id.to_string(),
        })
    }

    pub fn list(&self, status: Option<VideoStatus>, limit: usize) -> VideoResult<Vec<VideoRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM videos
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY updated_at DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(
                (status.as_ref().map(VideoStatus::as_str), limit as i64),
                |row| VideoRecord::from_row(row),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_by_status(&self) -> VideoResult<HashMap<String, usize>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM videos GROUP BY status")?;
        let mut map = HashMap::new();
        for row in stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })? {
            let (status, count) = row?;
            map.insert(status, count as usize);
        }
        Ok(map)
    }

    /// Moves the record to `status` only when it currently sits earlier in
    /// the pipeline. Returns `Ok(false)` when it is already at or past it.
    pub fn advance_status(&self, video_id: &str, status: VideoStatus) -> VideoResult<bool> {
        if status == VideoStatus::Failed {
            self.mark_failed(video_id, None)?;
            return Ok(true);
        }
        let earlier = status
            .predecessors()
            .iter()
            .map(|status| format!("'{}'", status.as_str()))
            .collect::<Vec<_>>();
        if earlier.is_empty() {
            self.require(video_id)?;
            return Ok(false);
        }
        let conn = self.open()?;
        let affected = conn.execute(
            &format!(
                "UPDATE videos SET status = ?2, updated_at = CURRENT_TIMESTAMP
                 WHERE video_id = ?1 AND status IN ({})",
                earlier.join(", ")
            ),
            params![video_id, status.as_str()],
        )?;
        if affected == 0 {
            drop(conn);
            self.require(video_id)?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Counts a failed run and returns the new attempt total.
    pub fn record_failure(&self, video_id: &str, error: &str) -> VideoResult<u32> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let affected = tx.execute(
            "UPDATE videos
             SET attempts = attempts + 1,
                 last_error = ?2,
                 updated_at = CURRENT_TIMESTAMP
             WHERE video_id = ?1",
            params![video_id, error],
        )?;
        ensure_found(affected, video_id)?;
        let attempts: i64 = tx.query_row(
            "SELECT attempts FROM videos WHERE video_id = ?1",
            [video_id],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(attempts.max(0) as u32)
    }

    /// Notes an error without consuming an attempt.
    pub fn note_error(&self, video_id: &str, error: &str) -> VideoResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE videos SET last_error = ?2, updated_at = CURRENT_TIMESTAMP WHERE video_id = ?1",
            params![video_id, error],
        )?;
        ensure_found(affected, video_id)
    }

    pub fn clear_error(&self, video_id: &str) -> VideoResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE videos SET last_error = NULL, updated_at = CURRENT_TIMESTAMP WHERE video_id = ?1",
            [video_id],
        )?;
        ensure_found(affected, video_id)
    }

    pub fn mark_failed(&self, video_id: &str, error: Option<&str>) -> VideoResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE videos
             SET status = 'failed',
                 last_error = COALESCE(?2, last_error),
                 updated_at = CURRENT_TIMESTAMP
             WHERE video_id = ?1",
            params![video_id, error],
        )?;
        ensure_found(affected, video_id)
    }

    /// Explicit operator reset: back to `pending` with completion flags
    /// cleared. Title, description and subtitles are kept.
    pub fn reset(&self, video_id: &str) -> VideoResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE videos
             SET status = 'pending',
                 translated_title = NULL,
                 translated_description = NULL,
                 remote_id = NULL,
                 video_published_at = NULL,
                 subtitle_attached = 0,
                 attempts = 0,
                 last_error = NULL,
                 updated_at = CURRENT_TIMESTAMP
             WHERE video_id = ?1",
            [video_id],
        )?;
        ensure_found(affected, video_id)
    }

    /// Records still owed intake stages with attempts left, oldest first.
    pub fn list_processable(&self, max_attempts: u32, limit: usize) -> VideoResult<Vec<VideoRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM videos
             WHERE status IN ('pending', 'downloaded', 'captioned')
               AND attempts < ?1
             ORDER BY attempts ASC, created_at ASC, id ASC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![max_attempts as i64, limit as i64], |row| {
                VideoRecord::from_row(row)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_ready_for_publish(&self, limit: usize) -> VideoResult<Vec<VideoRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM videos
             WHERE status = 'translated' AND video_published_at IS NULL
             ORDER BY updated_at ASC, id ASC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| VideoRecord::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_pending_subtitle_attach(
        &self,
        published_before: DateTime<Utc>,
        limit: usize,
    ) -> VideoResult<Vec<VideoRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM videos
             WHERE status = 'uploaded'
               AND subtitle_attached = 0
               AND video_published_at IS NOT NULL
               AND video_published_at <= ?1
             ORDER BY video_published_at ASC, id ASC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(
                params![published_before.naive_utc(), limit as i64],
                |row| VideoRecord::from_row(row),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn update_metadata(
        &self,
        video_id: &str,
        title: Option<&str>,
        description: Option<&str>,
    ) -> VideoResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE videos
             SET title = COALESCE(?2, title),
                 description = COALESCE(?3, description),
                 updated_at = CURRENT_TIMESTAMP
             WHERE video_id = ?1",
            params![video_id, non_empty(title), non_empty(description)],
        )?;
        ensure_found(affected, video_id)
    }

    pub fn update_translation(
        &self,
        video_id: &str,
        title: Option<&str>,
        description: Option<&str>,
    ) -> VideoResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE videos
             SET translated_title = COALESCE(?2, translated_title),
                 translated_description = COALESCE(?3, translated_description),
                 updated_at = CURRENT_TIMESTAMP
             WHERE video_id = ?1",
            params![video_id, non_empty(title), non_empty(description)],
        )?;
        ensure_found(affected, video_id)
    }

    /// Stores the remote id and publish time and moves `translated` to
    /// `uploaded`, all in one statement.
    pub fn mark_published(
        &self,
        video_id: &str,
        remote_id: &str,
        published_at: DateTime<Utc>,
    ) -> VideoResult<bool> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE videos
             SET remote_id = ?2,
                 video_published_at = ?3,
                 status = 'uploaded',
                 last_error = NULL,
                 updated_at = CURRENT_TIMESTAMP
             WHERE video_id = ?1 AND status = 'translated'",
            params![video_id, remote_id, published_at.naive_utc()],
        )?;
        if affected == 0 {
            drop(conn);
            self.require(video_id)?;
            return Ok(false);
        }
        Ok(true)
    }

    pub fn mark_subtitle_attached(&self, video_id: &str) -> VideoResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE videos
             SET subtitle_attached = 1,
                 last_error = NULL,
                 updated_at = CURRENT_TIMESTAMP
             WHERE video_id = ?1",
            [video_id],
        )?;
        ensure_found(affected, video_id)
    }
}

fn ensure_found(affected: usize, video_id: &str) -> VideoResult<()> {
    if affected == 0 {
        return Err(VideoError::NotFound {
            video_id: video_id.to_string(),
        });
    }
    Ok(())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::SubtitleSegment;
    use chrono::Duration;
    use tempfile::tempdir;

    fn setup_store() -> (tempfile::TempDir, SqliteVideoStore) {
        let dir = tempdir().unwrap();
        let store = SqliteVideoStore::builder()
            .path(dir.path().join("videos.sqlite"))
            .build()
            .unwrap();
        store.initialize().unwrap();
        (dir, store)
    }

    fn submission(url: &str) -> VideoSubmission {
        VideoSubmission {
            url: url.to_string(),
            title: Some("Original".into()),
            subtitles: vec![SubtitleSegment {
                start: 0.0,
                duration: 1.0,
                text: "hello".into(),
            }],
            ..VideoSubmission::default()
        }
    }

    #[test]
    fn status_only_moves_forward() {
        let (_dir, store) = setup_store();
        store.submit(&submission("dQw4w9WgXcQ")).unwrap();

        assert!(store.advance_status("dQw4w9WgXcQ", VideoStatus::Captioned).unwrap());
        assert!(!store.advance_status("dQw4w9WgXcQ", VideoStatus::Downloaded).unwrap());
        assert!(!store.advance_status("dQw4w9WgXcQ", VideoStatus::Captioned).unwrap());
        let record = store.require("dQw4w9WgXcQ").unwrap();
        assert_eq!(record.status, VideoStatus::Captioned);

        assert!(matches!(
            store.advance_status("missing0000", VideoStatus::Downloaded),
            Err(VideoError::NotFound { .. })
        ));
    }

    #[test]
    fn resubmission_resets_completion_flags() {
        let (_dir, store) = setup_store();
        let url = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";
        store.submit(&submission(url)).unwrap();
        store.advance_status("dQw4w9WgXcQ", VideoStatus::Translated).unwrap();
        store.update_translation("dQw4w9WgXcQ", Some("标题"), None).unwrap();
        store.record_failure("dQw4w9WgXcQ", "boom").unwrap();
        assert!(store.mark_published("dQw4w9WgXcQ", "BV1xx411c7mD", Utc::now()).unwrap());
        store.mark_subtitle_attached("dQw4w9WgXcQ").unwrap();

        let record = store.submit(&submission(url)).unwrap();
        assert_eq!(record.status, VideoStatus::Pending);
        assert_eq!(record.remote_id, None);
        assert_eq!(record.video_published_at, None);
        assert!(!record.subtitle_attached);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.last_error, None);
        assert_eq!(record.translated_title, None);
        assert_eq!(record.source_url.as_deref(), Some(url));
        assert_eq!(store.list(None, 10).unwrap().len(), 1);
    }

    #[test]
    fn failures_count_attempts() {
        let (_dir, store) = setup_store();
        store.submit(&submission("dQw4w9WgXcQ")).unwrap();
        assert_eq!(store.record_failure("dQw4w9WgXcQ", "one").unwrap(), 1);
        assert_eq!(store.record_failure("dQw4w9WgXcQ", "two").unwrap(), 2);
        assert_eq!(store.list_processable(3, 10).unwrap().len(), 1);
        assert!(store.list_processable(2, 10).unwrap().is_empty());
        let record = store.require("dQw4w9WgXcQ").unwrap();
        assert_eq!(record.last_error.as_deref(), Some("two"));
    }

    #[test]
    fn publish_and_attach_selection() {
        let (_dir, store) = setup_store();
        store.submit(&submission("dQw4w9WgXcQ")).unwrap();
        store.submit(&submission("BV1xx411c7mD")).unwrap();
        store.advance_status("dQw4w9WgXcQ", VideoStatus::Translated).unwrap();
        assert_eq!(store.list_ready_for_publish(10).unwrap().len(), 1);
        assert!(!store.mark_published("BV1xx411c7mD", "x", Utc::now()).unwrap());

        let published = Utc::now() - Duration::hours(2);
        store.mark_published("dQw4w9WgXcQ", "BV1aa411c7mD", published).unwrap();
        assert!(store.list_ready_for_publish(10).unwrap().is_empty());

        let cutoff = Utc::now() - Duration::hours(1);
        let due = store.list_pending_subtitle_attach(cutoff, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].remote_id.as_deref(), Some("BV1aa411c7mD"));
        let early = store
            .list_pending_subtitle_attach(published - Duration::minutes(1), 10)
            .unwrap();
        assert!(early.is_empty());

        store.mark_subtitle_attached("dQw4w9WgXcQ").unwrap();
        assert!(store.list_pending_subtitle_attach(cutoff, 10).unwrap().is_empty());
    }

    #[test]
    fn rejects_unrecognized_source() {
        let (_dir, store) = setup_store();
        assert!(matches!(
            store.submit(&VideoSubmission::from_url("https://example.com/v/1")),
            Err(VideoError::InvalidSource { .. })
        ));
    }
}
