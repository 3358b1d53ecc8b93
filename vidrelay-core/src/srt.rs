//! SubRip rendering and parsing shared by the subtitle, transcription and
//! translation stages.

use std::fmt::Write as _;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// One subtitle block with millisecond bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtCue {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

impl SrtCue {
    pub fn new(start_ms: u64, end_ms: u64, text: impl Into<String>) -> Self {
        Self {
            start_ms,
            end_ms,
            text: text.into(),
        }
    }

    /// Builds a cue from a start offset and duration expressed in seconds.
    pub fn from_seconds(start: f64, duration: f64, text: impl Into<String>) -> Self {
        let start_ms = seconds_to_ms(start);
        let end_ms = start_ms + seconds_to_ms(duration);
        Self::new(start_ms, end_ms, text)
    }
}

/// Transcript entry as written to `original.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub start_time: f64,
    pub duration: f64,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptDocument {
    pub transcript: Vec<TranscriptEntry>,
}

impl TranscriptDocument {
    pub fn to_cues(&self) -> Vec<SrtCue> {
        self.transcript
            .iter()
            .map(|entry| SrtCue::from_seconds(entry.start_time, entry.duration, &entry.content))
            .collect()
    }
}

fn seconds_to_ms(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        (value * 1000.0).round() as u64
    } else {
        0
    }
}

pub fn format_timestamp(ms: u64) -> String {
    let hours = ms / 3_600_000;
    let minutes = (ms % 3_600_000) / 60_000;
    let seconds = (ms % 60_000) / 1000;
    let millis = ms % 1000;
    format!("{hours:02}:{minutes:02}:{seconds:02},{millis:03}")
}

fn parse_timestamp(value: &str) -> Option<u64> {
    let (clock, millis) = value.trim().split_once([',', '.'])?;
    let mut parts = clock.split(':');
    let hours: u64 = parts.next()?.trim().parse().ok()?;
    let minutes: u64 = parts.next()?.trim().parse().ok()?;
    let seconds: u64 = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    let millis: u64 = millis.trim().parse().ok()?;
    Some(hours * 3_600_000 + minutes * 60_000 + seconds * 1000 + millis)
}

/// Renders cues as numbered blocks, each terminated by a blank line.
pub fn render(cues: &[SrtCue]) -> String {
    let mut out = String::new();
    for (index, cue) in cues.iter().enumerate() {
        let _ = write!(
            out,
            "{}\n{} --> {}\n{}\n\n",
            index + 1,
            format_timestamp(cue.start_ms),
            format_timestamp(cue.end_ms),
            cue.text
        );
    }
    out
}

/// Parses SubRip text. Malformed blocks are skipped.
pub fn parse(content: &str) -> Vec<SrtCue> {
    let normalized = content.replace("\r\n", "\n");
    let mut cues = Vec::new();
    for block in normalized.split("\n\n") {
        let mut lines = block.lines().filter(|line| !line.trim().is_empty());
        let Some(first) = lines.next() else {
            continue;
        };
        let timing = if first.contains("-->") {
            first
        } else {
            match lines.next() {
                Some(line) => line,
                None => continue,
            }
        };
        let Some((start, end)) = timing.split_once("-->") else {
            continue;
        };
        let (Some(start_ms), Some(end_ms)) = (parse_timestamp(start), parse_timestamp(end)) else {
            continue;
        };
        let text = lines.collect::<Vec<_>>().join("\n");
        cues.push(SrtCue::new(start_ms, end_ms, text));
    }
    cues
}

pub async fn write_file(path: &Path, cues: &[SrtCue]) -> io::Result<()> {
    tokio::fs::write(path, render(cues)).await
}

pub async fn read_file(path: &Path) -> io::Result<Vec<SrtCue>> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(parse(&content))
}
