//! Subprocess adapter around the `yt-dlp` command-line tool.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::{Output, Stdio},
    time::Duration,
};

use serde_json::Value;
use tokio::{process::Command, time::timeout};
use tracing::debug;

use crate::error::ToolError;

const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";
const AUDIO_FORMAT: &str = "mp3";

/// What the download invocation should produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSelection {
    /// Audio-only extraction, transcoded to mp3.
    Audio,
    /// A specific format merged with the best audio track.
    Format(String),
    /// Whatever the tool picks by default.
    Default,
}

impl MediaSelection {
    fn push_args(&self, args: &mut Vec<String>) {
        match self {
            Self::Audio => {
                args.push("-x".to_string());
                args.push("--audio-format".to_string());
                args.push(AUDIO_FORMAT.to_string());
            }
            Self::Format(format_id) => {
                args.push("-f".to_string());
                args.push(format!("{format_id}+bestaudio"));
            }
            Self::Default => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: PathBuf,
    timeout: Option<Duration>,
}

impl YtDlp {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, limit: Option<Duration>) -> Self {
        self.timeout = limit;
        self
    }

    pub async fn fetch_metadata(&self, url: &str) -> Result<Value, ToolError> {
        let output = self.run(metadata_args(url), Stdio::piped()).await?;
        let document: Value = serde_json::from_slice(&output.stdout)?;

        if !document.is_object() {
            return Err(ToolError::Metadata(
                "expected a JSON object on stdout".to_string(),
            ));
        }

        Ok(document)
    }

    pub async fn download_media(
        &self,
        url: &str,
        selection: &MediaSelection,
        destination: &Path,
    ) -> Result<PathBuf, ToolError> {
        self.run(download_args(url, selection, destination), Stdio::null()).await?;
        locate_output_file(destination).await
    }

    async fn run(&self, args: Vec<String>, stdout: Stdio) -> Result<Output, ToolError> {
        let binary = self.binary.to_string_lossy().into_owned();
        debug!("running {binary} {}", args.join(" "));

        let spawn_failed = |error: std::io::Error| {
            if error.kind() == ErrorKind::NotFound {
                ToolError::NotFound(binary.clone())
            } else {
                ToolError::Spawn {
                    binary: binary.clone(),
                    source: error,
                }
            }
        };

        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_failed)?;

        let result = match self.timeout {
            Some(limit) => timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| ToolError::TimedOut {
                    binary: binary.clone(),
                    limit,
                })?,
            None => child.wait_with_output().await,
        };
        let output = result.map_err(spawn_failed)?;

        if !output.status.success() {
            return Err(ToolError::Exited {
                binary,
                status: output.status,
                diagnostic: stderr_diagnostic(&output.stderr),
            });
        }

        Ok(output)
    }
}

pub fn metadata_args(url: &str) -> Vec<String> {
    vec![
        "-J".to_string(),
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--".to_string(),
        url.to_string(),
    ]
}

pub fn download_args(url: &str, selection: &MediaSelection, destination: &Path) -> Vec<String> {
    let template = destination.join(OUTPUT_TEMPLATE);
    let mut args = vec![
        "--no-playlist".to_string(),
        "-o".to_string(),
        template.to_string_lossy().into_owned(),
    ];

    selection.push_args(&mut args);

    args.push("--".to_string());
    args.push(url.to_string());
    args
}

fn stderr_diagnostic(stderr: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub async fn locate_output_file(dir: &Path) -> Result<PathBuf, ToolError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }

    files.sort();
    files.into_iter().next().ok_or(ToolError::NoOutputFile)
}
