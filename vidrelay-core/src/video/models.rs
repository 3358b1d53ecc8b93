use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::srt::SrtCue;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VideoStatus {
    Pending,
    Downloaded,
    Captioned,
    Translated,
    Uploaded,
    Failed,
}

impl VideoStatus {
    pub const FORWARD: [VideoStatus; 5] = [
        VideoStatus::Pending,
        VideoStatus::Downloaded,
        VideoStatus::Captioned,
        VideoStatus::Translated,
        VideoStatus::Uploaded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::Pending => "pending",
            VideoStatus::Downloaded => "downloaded",
            VideoStatus::Captioned => "captioned",
            VideoStatus::Translated => "translated",
            VideoStatus::Uploaded => "uploaded",
            VideoStatus::Failed => "failed",
        }
    }

    /// Position in the forward pipeline. `Failed` sits outside it.
    pub fn rank(&self) -> Option<usize> {
        Self::FORWARD.iter().position(|status| status == self)
    }

    /// Statuses strictly before `self` in the forward pipeline.
    pub fn predecessors(&self) -> &'static [VideoStatus] {
        match self.rank() {
            Some(rank) => &Self::FORWARD[..rank],
            None => &[],
        }
    }

    pub fn terminal(&self) -> bool {
        matches!(self, VideoStatus::Uploaded | VideoStatus::Failed)
    }
}

impl fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VideoStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(VideoStatus::Pending),
            "downloaded" => Ok(VideoStatus::Downloaded),
            "captioned" => Ok(VideoStatus::Captioned),
            "translated" => Ok(VideoStatus::Translated),
            "uploaded" => Ok(VideoStatus::Uploaded),
            "failed" => Ok(VideoStatus::Failed),
            other => Err(format!("unknown video status: {other}")),
        }
    }
}

/// Subtitle line submitted with a video. Offsets are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleSegment {
    #[serde(alias = "start_time")]
    pub start: f64,
    #[serde(alias = "dur")]
    pub duration: f64,
    #[serde(alias = "content")]
    pub text: String,
}

impl SubtitleSegment {
    pub fn to_cue(&self) -> SrtCue {
        SrtCue::from_seconds(self.start, self.duration, self.text.trim())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoRecord {
    pub video_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub source_url: Option<String>,
    pub status: VideoStatus,
    pub subtitles: Vec<SubtitleSegment>,
    pub playlist_id: Option<String>,
    pub operation_type: Option<String>,
    pub translated_title: Option<String>,
    pub translated_description: Option<String>,
    pub remote_id: Option<String>,
    pub video_published_at: Option<DateTime<Utc>>,
    pub subtitle_attached: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl VideoRecord {
    pub fn new(video_id: impl Into<String>) -> Self {
        Self {
            video_id: video_id.into(),
            title: None,
            description: None,
            source_url: None,
            status: VideoStatus::Pending,
            subtitles: Vec::new(),
            playlist_id: None,
            operation_type: None,
            translated_title: None,
            translated_description: None,
            remote_id: None,
            video_published_at: None,
            subtitle_attached: false,
            attempts: 0,
            last_error: None,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at: Option<NaiveDateTime> = row.get("created_at")?;
        let updated_at: Option<NaiveDateTime> = row.get("updated_at")?;
        let published_at: Option<NaiveDateTime> = row.get("video_published_at")?;
        let subtitles: Option<String> = row.get("subtitles")?;
        Ok(Self {
            video_id: row.get("video_id")?,
            title: row.get("title")?,
            description: row.get("description")?,
            source_url: row.get("source_url")?,
            status: row
                .get::<_, String>("status")?
                .parse()
                .unwrap_or(VideoStatus::Pending),
            subtitles: subtitles
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or_default(),
            playlist_id: row.get("playlist_id")?,
            operation_type: row.get("operation_type")?,
            translated_title: row.get("translated_title")?,
            translated_description: row.get("translated_description")?,
            remote_id: row.get("remote_id")?,
            video_published_at: published_at.map(|dt| Utc.from_utc_datetime(&dt)),
            subtitle_attached: row.get::<_, Option<i64>>("subtitle_attached")?.unwrap_or(0) != 0,
            attempts: row.get::<_, Option<i64>>("attempts")?.unwrap_or(0).max(0) as u32,
            last_error: row.get("last_error")?,
            created_at: created_at.map(|dt| Utc.from_utc_datetime(&dt)),
            updated_at: updated_at.map(|dt| Utc.from_utc_datetime(&dt)),
        })
    }

    pub fn serialize_subtitles(subtitles: &[SubtitleSegment]) -> serde_json::Result<Option<String>> {
        if subtitles.is_empty() {
            Ok(None)
        } else {
            serde_json::to_string(subtitles).map(Some)
        }
    }
}
