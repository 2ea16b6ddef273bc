use std::{net::SocketAddr, path::PathBuf};

use axum::{
    Json,
    body::{Body, Bytes},
    extract::{ConnectInfo, State},
    http::{
        HeaderMap, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::{Deserialize, de::IntoDeserializer};
use tempfile::TempDir;
use tokio_util::io::ReaderStream;
use tracing::{Instrument, info, info_span, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    config::{Config, non_empty},
    error::{ApiError, ToolError},
    formats::{MediaInfo, metadata_title},
    ytdlp::{MediaSelection, YtDlp},
};

const TEMP_DIR_PREFIX: &str = "vidfetch-";

#[derive(Debug, Clone)]
pub struct AppState {
    pub ytdlp: YtDlp,
    pub download_dir: Option<PathBuf>,
    pub trust_proxy_headers: bool,
    pub log_download_titles: bool,
}

impl AppState {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ytdlp: YtDlp::new(&config.ytdlp_bin).with_timeout(config.ytdlp_timeout),
            download_dir: config.download_dir.clone(),
            trust_proxy_headers: config.trust_proxy_headers,
            log_download_titles: config.log_download_titles,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    #[default]
    Video,
    Audio,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default, rename = "type", deserialize_with = "media_type_or_default")]
    pub media_type: MediaType,
    #[serde(default)]
    pub format_id: Option<String>,
}

impl DownloadRequest {
    pub fn selection(&self) -> MediaSelection {
        match self.media_type {
            MediaType::Audio => MediaSelection::Audio,
            MediaType::Video => self
                .format_id
                .as_deref()
                .and_then(non_empty)
                .map(|format_id| MediaSelection::Format(format_id.to_string()))
                .unwrap_or(MediaSelection::Default),
        }
    }
}

// The web page sends `"type": ""` alongside real values, so empty means the default.
fn media_type_or_default<'de, D>(deserializer: D) -> Result<MediaType, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(MediaType::Video),
        Some(other) => MediaType::deserialize(other.into_deserializer()),
    }
}

fn parse_request(body: &[u8]) -> Result<DownloadRequest, ApiError> {
    let mut request: DownloadRequest =
        serde_json::from_slice(body).map_err(|error| ApiError::bad_request(error.to_string()))?;

    let url = request.url.trim().to_string();
    if url.is_empty() {
        return Err(ApiError::bad_request("url is required"));
    }
    if !is_http_url(&url) {
        return Err(ApiError::bad_request("invalid URL"));
    }

    request.url = url;
    Ok(request)
}

fn is_http_url(input: &str) -> bool {
    Url::parse(input)
        .map(|parsed| matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some())
        .unwrap_or(false)
}

pub async fn video_info(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<MediaInfo>, ApiError> {
    let request = parse_request(&body)?;
    let client_ip = client_ip_for_request(&state, &headers, addr);

    let metadata = state
        .ytdlp
        .fetch_metadata(&request.url)
        .await
        .map_err(|error| {
            warn!(url = %request.url, "metadata lookup failed: {error}");
            metadata_error(&error)
        })?;

    let info = MediaInfo::from_metadata(&metadata).map_err(|error| {
        warn!(url = %request.url, "unusable metadata: {error}");
        metadata_error(&error)
    })?;

    info!(
        client_ip = %client_ip,
        url = %request.url,
        title = %info.title,
        "info request"
    );

    Ok(Json(info))
}

fn metadata_error(error: &ToolError) -> ApiError {
    if error.is_parse_failure() {
        ApiError::internal("Failed to parse video info")
    } else {
        ApiError::internal("Failed to get video info")
    }
}

pub async fn download(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request = parse_request(&body)?;
    let client_ip = client_ip_for_request(&state, &headers, addr);
    let span = info_span!("download", id = %Uuid::new_v4());

    async move {
        log_download_request(&state, &request, &client_ip).await;

        let job_dir = create_job_dir(&state)?;
        let selection = request.selection();

        let path = state
            .ytdlp
            .download_media(&request.url, &selection, job_dir.path())
            .await
            .map_err(download_error)?;

        stream_artifact(job_dir, path).await
    }
    .instrument(span)
    .await
}

async fn log_download_request(state: &AppState, request: &DownloadRequest, client_ip: &str) {
    let format_id = request.format_id.as_deref().unwrap_or_default();
    let media_type = request.media_type;

    let title = if state.log_download_titles {
        match state.ytdlp.fetch_metadata(&request.url).await {
            Ok(metadata) => metadata_title(&metadata).map(ToString::to_string),
            Err(_) => None,
        }
    } else {
        None
    };

    match title {
        Some(title) => info!(
            client_ip = %client_ip,
            url = %request.url,
            title = %title,
            media_type = ?media_type,
            format_id = %format_id,
            "download request"
        ),
        None => info!(
            client_ip = %client_ip,
            url = %request.url,
            media_type = ?media_type,
            format_id = %format_id,
            "download request"
        ),
    }
}

fn create_job_dir(state: &AppState) -> Result<TempDir, ApiError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(TEMP_DIR_PREFIX);

    let created = match &state.download_dir {
        Some(parent) => builder.tempdir_in(parent),
        None => builder.tempdir(),
    };

    created.map_err(|error| {
        warn!("could not create temporary directory: {error}");
        ApiError::internal("Failed to create temporary directory")
    })
}

fn download_error(error: ToolError) -> ApiError {
    warn!("download failed: {error}");
    match &error {
        ToolError::NoOutputFile | ToolError::Filesystem(_) => {
            ApiError::internal("Failed to locate downloaded file")
        }
        _ => ApiError::internal(
            error
                .diagnostic()
                .unwrap_or("Failed to download media")
                .to_string(),
        ),
    }
}

/// Streams `path` as an attachment. `job_dir` moves into the body so the
/// directory is removed once the body is finished or dropped.
async fn stream_artifact(job_dir: TempDir, path: PathBuf) -> Result<Response, ApiError> {
    let open_failed = |error: std::io::Error| {
        warn!("could not open downloaded file {:?}: {error}", path);
        ApiError::internal("Failed to open downloaded file")
    };

    let file = tokio::fs::File::open(&path).await.map_err(open_failed)?;
    let length = file.metadata().await.map_err(open_failed)?.len();

    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .map(ToString::to_string)
        .unwrap_or_else(|| "download.bin".to_string());

    let stream = ReaderStream::new(file).map(move |chunk| {
        let _guard = &job_dir;
        chunk
    });

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("Failed to build download headers"))?,
    );

    info!("streaming {filename} ({length} bytes)");
    Ok((headers, Body::from_stream(stream)).into_response())
}

pub fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric()
                || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
            {
                character
            } else {
                '_'
            }
        })
        .collect();

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let check_header = |key: &str| {
        headers
            .get(key)
            .and_then(|value| value.to_str().ok())
            .and_then(non_empty)
            .map(ToString::to_string)
    };

    let first_forwarded = || {
        check_header("x-forwarded-for").and_then(|forwarded| {
            forwarded
                .split(',')
                .next()
                .and_then(non_empty)
                .map(ToString::to_string)
        })
    };

    check_header("fly-client-ip")
        .or_else(first_forwarded)
        .or_else(|| check_header("x-real-ip"))
}

fn client_ip_for_request(state: &AppState, headers: &HeaderMap, addr: SocketAddr) -> String {
    if state.trust_proxy_headers {
        extract_client_ip(headers).unwrap_or_else(|| addr.to_string())
    } else {
        addr.to_string()
    }
}

pub async fn method_not_allowed() -> ApiError {
    ApiError::method_not_allowed()
}
