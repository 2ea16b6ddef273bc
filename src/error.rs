use std::{io, process::ExitStatus, time::Duration};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Failures of the external media tool adapter.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0} was not found on PATH")]
    NotFound(String),

    #[error("failed to start {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },

    #[error("{binary} exited with {status}")]
    Exited {
        binary: String,
        status: ExitStatus,
        diagnostic: Option<String>,
    },

    #[error("{binary} did not finish within {}s", .limit.as_secs())]
    TimedOut { binary: String, limit: Duration },

    #[error("invalid metadata JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid metadata: {0}")]
    Metadata(String),

    #[error("download produced no output file")]
    NoOutputFile,

    #[error("filesystem error: {0}")]
    Filesystem(#[from] io::Error),
}

impl ToolError {
    /// Text the tool wrote to stderr before failing, if any.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Self::Exited { diagnostic, .. } => diagnostic.as_deref(),
            _ => None,
        }
    }

    pub fn is_parse_failure(&self) -> bool {
        matches!(self, Self::Json(_) | Self::Metadata(_))
    }
}

/// An HTTP error answered with a plain-text body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn method_not_allowed() -> Self {
        Self {
            status: StatusCode::METHOD_NOT_ALLOWED,
            message: "Method not allowed".to_string(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}
