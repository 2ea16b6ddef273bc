//! Shaping of the external tool's metadata into the compact response sent to clients.

use std::{cmp::Reverse, collections::HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ToolError;

const UNKNOWN_QUALITY: &str = "Unknown";

/// One entry of the tool's `formats` array. Unlisted fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFormat {
    pub format_id: String,
    pub ext: String,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub height: Option<f64>,
    #[serde(default)]
    pub format_note: Option<String>,
}

impl RawFormat {
    fn is_audio_only(&self) -> bool {
        self.vcodec.as_deref() == Some("none")
    }

    fn quality_label(&self) -> String {
        self.height
            .map(|height| format!("{}p", height as i64))
            .or_else(|| self.format_note.clone())
            .unwrap_or_else(|| UNKNOWN_QUALITY.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatOption {
    pub format_id: String,
    pub quality: String,
    pub ext: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaInfo {
    pub title: String,
    pub duration: String,
    pub formats: Vec<FormatOption>,
}

impl MediaInfo {
    /// `title` is required. A missing `duration` renders as `0:00` and format
    /// records that do not match [`RawFormat`] are skipped.
    pub fn from_metadata(metadata: &Value) -> Result<Self, ToolError> {
        let title = metadata_title(metadata)
            .ok_or_else(|| ToolError::Metadata("title is missing or not a string".to_string()))?;

        let duration = metadata
            .get("duration")
            .and_then(Value::as_f64)
            .map(|seconds| seconds as u64)
            .unwrap_or_default();

        let raw_formats = match metadata.get("formats") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| match RawFormat::deserialize(item) {
                    Ok(format) => Some(format),
                    Err(error) => {
                        debug!("skipping unusable format record: {error}");
                        None
                    }
                })
                .collect(),
            Some(_) => {
                return Err(ToolError::Metadata("formats is not an array".to_string()));
            }
        };

        Ok(Self {
            title: title.to_string(),
            duration: format_duration(duration),
            formats: normalize_formats(&raw_formats),
        })
    }
}

pub fn metadata_title(metadata: &Value) -> Option<&str> {
    metadata.get("title").and_then(Value::as_str)
}

/// Drops audio-only tracks, keeps the first record per quality label and
/// orders the result by descending resolution.
pub fn normalize_formats(formats: &[RawFormat]) -> Vec<FormatOption> {
    let mut seen_qualities = HashSet::new();

    let mut options: Vec<FormatOption> = formats
        .iter()
        .filter(|format| !format.is_audio_only())
        .filter_map(|format| {
            let quality = format.quality_label();
            if !seen_qualities.insert(quality.clone()) {
                return None;
            }

            Some(FormatOption {
                format_id: format.format_id.clone(),
                quality,
                ext: format.ext.clone(),
            })
        })
        .collect();

    options.sort_by_key(|option| Reverse(quality_rank(&option.quality)));
    options
}

/// Numeric value of a `"{N}p"` label, or 0 for anything else.
pub fn quality_rank(quality: &str) -> u64 {
    let digits_end = quality
        .find(|character: char| !character.is_ascii_digit())
        .unwrap_or(quality.len());
    let (digits, rest) = quality.split_at(digits_end);

    if digits.is_empty() || !rest.starts_with('p') {
        return 0;
    }

    digits.parse().unwrap_or(0)
}

pub fn format_duration(seconds: u64) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}
