use serde::{Deserialize, Serialize};
use url::Url;

use super::models::SubtitleSegment;

/// A video handed to the pipeline, by URL or bare id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoSubmission {
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub operation_type: Option<String>,
    pub playlist_id: Option<String>,
    pub subtitles: Vec<SubtitleSegment>,
}

impl VideoSubmission {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

fn is_youtube_id(value: &str) -> bool {
    value.len() == 11
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn is_bilibili_id(value: &str) -> bool {
    value.len() == 12 && value.starts_with("BV") && value.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Extracts the platform id from a watch/shorts/embed/live URL, a
/// `youtu.be` link, a Bilibili video URL, or a bare id.
pub fn extract_video_id(input: &str) -> Option<String> {
    let input = input.trim();
    if is_youtube_id(input) || is_bilibili_id(input) {
        return Some(input.to_string());
    }

    let url = Url::parse(input).ok()?;
    let host = url.host_str()?.trim_start_matches("www.").trim_start_matches("m.");
    let segments: Vec<&str> = url
        .path_segments()
        .map(|parts| parts.filter(|part| !part.is_empty()).collect())
        .unwrap_or_default();

    let candidate = match host {
        "youtu.be" => segments.first().map(|id| id.to_string()),
        "youtube.com" | "music.youtube.com" => match segments.as_slice() {
            ["watch", ..] => url
                .query_pairs()
                .find(|(key, _)| key == "v")
                .map(|(_, value)| value.into_owned()),
            ["shorts" | "embed" | "live" | "v", id, ..] => Some(id.to_string()),
            _ => None,
        },
        "bilibili.com" => match segments.as_slice() {
            ["video", id, ..] => Some(id.to_string()),
            _ => None,
        },
        _ => None,
    }?;

    if is_youtube_id(&candidate) || is_bilibili_id(&candidate) {
        Some(candidate)
    } else {
        None
    }
}

/// Download URL for a record: the stored source URL when it is one, else
/// derived from the id.
pub fn source_url_for(video_id: &str, source_url: Option<&str>) -> String {
    if let Some(url) = source_url.map(str::trim).filter(|url| url.starts_with("http")) {
        return url.to_string();
    }
    if video_id.starts_with("http") {
        video_id.to_string()
    } else if video_id.len() == 11 {
        format!("https://www.youtube.com/watch?v={video_id}")
    } else if video_id.starts_with("BV") {
        format!("https://www.bilibili.com/video/{video_id}")
    } else {
        format!("https://www.youtube.com/watch?v={video_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_youtube_variants() {
        for input in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=42",
            "https://youtu.be/dQw4w9WgXcQ?si=abc",
            "https://youtube.com/shorts/dQw4w9WgXcQ",
            "https://www.youtube.com/embed/dQw4w9WgXcQ",
            "https://m.youtube.com/watch?v=dQw4w9WgXcQ",
            "dQw4w9WgXcQ",
        ] {
            assert_eq!(extract_video_id(input).as_deref(), Some("dQw4w9WgXcQ"), "{input}");
        }
    }

    #[test]
    fn extracts_bilibili() {
        assert_eq!(
            extract_video_id("https://www.bilibili.com/video/BV1xx411c7mD/?p=1").as_deref(),
            Some("BV1xx411c7mD")
        );
    }

    #[test]
    fn rejects_unknown() {
        assert_eq!(extract_video_id("https://example.com/watch?v=dQw4w9WgXcQ"), None);
        assert_eq!(extract_video_id("not a url"), None);
        assert_eq!(extract_video_id("https://www.youtube.com/watch?v=short"), None);
    }

    #[test]
    fn source_url_rules() {
        assert_eq!(
            source_url_for("dQw4w9WgXcQ", None),
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
        );
        assert_eq!(
            source_url_for("BV1xx411c7mD", None),
            "https://www.bilibili.com/video/BV1xx411c7mD"
        );
        assert_eq!(source_url_for("x", Some("https://host/v")), "https://host/v");
        assert_eq!(source_url_for("abc", Some("")), "https://www.youtube.com/watch?v=abc");
    }
}
