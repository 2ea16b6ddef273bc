#![cfg(unix)]

use std::{
    net::SocketAddr,
    os::unix::fs::PermissionsExt,
    path::PathBuf,
    sync::OnceLock,
    time::Duration,
};

use axum::{
    Router,
    body::{Body, to_bytes},
    extract::connect_info::MockConnectInfo,
    http::{Request, StatusCode, header},
    response::Response,
};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;
use vidfetch::{Config, build_router};

const METADATA: &str = r#"{
  "title": "Sample Clip",
  "duration": 125,
  "formats": [
    {"format_id": "160", "ext": "mp4", "vcodec": "avc1.4d400c", "acodec": "none", "height": 144},
    {"format_id": "278", "ext": "webm", "vcodec": "vp9", "acodec": "none", "height": 144},
    {"format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a.40.2", "format_note": "medium"},
    {"format_id": "136", "ext": "mp4", "vcodec": "avc1.4d401f", "acodec": "none", "height": 720},
    {"format_id": "sb0", "ext": "mhtml", "vcodec": "images"}
  ]
}"#;

// Behaviour is keyed on the URL so a single script serves every test.
const FAKE_TOOL: &str = r#"#!/bin/sh
for arg; do url="$arg"; done
key=$(printf '%s' "$url" | tr -c 'A-Za-z0-9' '_')
printf '%s\n' "$*" >> "__CALLS__/$key.log"

if [ "$1" = "-J" ]; then
  case "$url" in
    *no-metadata*) exit 1 ;;
    *bad-json*) echo "this is not json"; exit 0 ;;
  esac
  cat <<'JSON'
__METADATA__
JSON
  exit 0
fi

case "$url" in
  *slow-download*) sleep 2; touch "__CALLS__/$key.alive"; exit 0 ;;
  *fail-download*) echo "ERROR: [generic] Unsupported URL: $url" >&2; exit 1 ;;
  *no-output*) exit 0 ;;
esac

out=""
ext=mp4
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift ;;
    -x) ext=mp3 ;;
    --) break ;;
  esac
  shift
done
file=$(printf '%s' "$out" | sed -e 's/%(title)s/Sample Clip/' -e "s/%(ext)s/$ext/")
printf 'fake media bytes' > "$file"
"#;

struct FakeTool {
    _root: TempDir,
    binary: PathBuf,
    calls: PathBuf,
    static_dir: PathBuf,
}

fn fake_tool() -> &'static FakeTool {
    static TOOL: OnceLock<FakeTool> = OnceLock::new();
    TOOL.get_or_init(|| {
        let root = tempfile::tempdir().unwrap();
        let calls = root.path().join("calls");
        std::fs::create_dir(&calls).unwrap();

        let script = FAKE_TOOL
            .replace("__CALLS__", calls.to_str().unwrap())
            .replace("__METADATA__", METADATA);
        let binary = root.path().join("yt-dlp");
        std::fs::write(&binary, script).unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let static_dir = root.path().join("static");
        std::fs::create_dir(&static_dir).unwrap();
        std::fs::write(static_dir.join("index.html"), "<h1>vidfetch</h1>").unwrap();
        std::fs::write(static_dir.join("script.js"), "console.log('ok');").unwrap();

        FakeTool {
            _root: root,
            binary,
            calls,
            static_dir,
        }
    })
}

struct TestContext {
    app: Router,
    work_dir: TempDir,
}

impl TestContext {
    fn new() -> Self {
        Self::with_timeout(None)
    }

    fn with_timeout(ytdlp_timeout: Option<Duration>) -> Self {
        let tool = fake_tool();
        let work_dir = tempfile::tempdir().unwrap();
        let config = Config {
            ytdlp_bin: tool.binary.clone(),
            ytdlp_timeout,
            static_dir: tool.static_dir.clone(),
            download_dir: Some(work_dir.path().to_path_buf()),
            ..Config::default()
        };

        let app = build_router(&config)
            .unwrap()
            .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));

        Self { app, work_dir }
    }

    async fn post(&self, uri: &str, body: impl Into<Body>) -> Response {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .unwrap();
        self.app.clone().oneshot(request).await.unwrap()
    }

    async fn get(&self, uri: &str) -> Response {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        self.app.clone().oneshot(request).await.unwrap()
    }

    fn leftover_entries(&self) -> usize {
        std::fs::read_dir(self.work_dir.path()).unwrap().count()
    }
}

async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn call_file(url: &str, suffix: &str) -> PathBuf {
    let key: String = url
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    fake_tool().calls.join(format!("{key}.{suffix}"))
}

/// Argument lines the fake tool recorded for `url`, one per invocation.
fn recorded_calls(url: &str) -> Vec<String> {
    let path = call_file(url, "log");
    std::fs::read_to_string(path)
        .map(|text| text.lines().map(ToString::to_string).collect())
        .unwrap_or_default()
}

fn download_call(url: &str) -> String {
    recorded_calls(url)
        .into_iter()
        .find(|line| !line.starts_with("-J"))
        .expect("download invocation recorded")
}

#[tokio::test]
async fn video_info_returns_deduplicated_sorted_formats() {
    let ctx = TestContext::new();
    let url = "https://media.example/watch?v=info-ok";

    let response = ctx.post("/api/video-info", json!({ "url": url }).to_string()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(
        body,
        json!({
            "title": "Sample Clip",
            "duration": "2:05",
            "formats": [
                {"formatId": "136", "quality": "720p", "ext": "mp4"},
                {"formatId": "160", "quality": "144p", "ext": "mp4"},
                {"formatId": "sb0", "quality": "Unknown", "ext": "mhtml"}
            ]
        })
    );

    let calls = recorded_calls(url);
    assert_eq!(calls.len(), 1);
    assert!(calls[0].starts_with("-J"));
    assert!(calls[0].ends_with(&format!("-- {url}")));
}

#[tokio::test]
async fn video_info_tool_failure_is_generic_server_error() {
    let ctx = TestContext::new();

    let response = ctx
        .post(
            "/api/video-info",
            json!({ "url": "https://media.example/no-metadata/1" }).to_string(),
        )
        .await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_text(response).await, "Failed to get video info");
}

#[tokio::test]
async fn video_info_unparsable_output_is_parse_failure() {
    let ctx = TestContext::new();

    let response = ctx
        .post(
            "/api/video-info",
            json!({ "url": "https://media.example/bad-json/1" }).to_string(),
        )
        .await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_text(response).await, "Failed to parse video info");
}

#[tokio::test]
async fn malformed_json_is_bad_request_on_both_endpoints() {
    let ctx = TestContext::new();

    for uri in ["/api/video-info", "/api/download"] {
        let response = ctx.post(uri, r#"{"url": "#).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        let text = body_text(response).await;
        assert!(text.contains("EOF while parsing"), "{uri}: {text}");
    }

    assert_eq!(ctx.leftover_entries(), 0);
}

#[tokio::test]
async fn missing_url_is_bad_request() {
    let ctx = TestContext::new();

    let response = ctx.post("/api/download", r#"{"type": "audio"}"#).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(response).await, "url is required");
}

#[tokio::test]
async fn audio_download_streams_mp3_attachment() {
    let ctx = TestContext::new();
    let url = "https://media.example/watch?v=audio-ok";

    let response = ctx
        .post(
            "/api/download",
            json!({ "url": url, "type": "audio", "formatId": "" }).to_string(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let headers = response.headers();
    assert_eq!(headers[header::CONTENT_TYPE], "application/octet-stream");
    assert_eq!(headers[header::CONTENT_LENGTH], "16");
    let disposition = headers[header::CONTENT_DISPOSITION].to_str().unwrap();
    assert!(
        disposition.starts_with("attachment; filename=\"Sample Clip.mp3\""),
        "{disposition}"
    );

    assert_eq!(body_text(response).await, "fake media bytes");

    let call = download_call(url);
    assert!(call.contains("-x --audio-format mp3"), "{call}");
    assert!(!call.contains(" -f "), "{call}");

    assert_eq!(ctx.leftover_entries(), 0);
}

#[tokio::test]
async fn video_download_merges_selected_format_with_best_audio() {
    let ctx = TestContext::new();
    let url = "https://media.example/watch?v=video-ok";

    let response = ctx
        .post(
            "/api/download",
            json!({ "url": url, "type": "video", "formatId": "136" }).to_string(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let disposition = response.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.contains("filename=\"Sample Clip.mp4\""), "{disposition}");
    assert_eq!(body_text(response).await, "fake media bytes");

    let call = download_call(url);
    assert!(call.contains("-f 136+bestaudio"), "{call}");
    assert!(!call.contains(" -x "), "{call}");

    let calls = recorded_calls(url);
    assert!(calls.iter().any(|line| line.starts_with("-J")));

    assert_eq!(ctx.leftover_entries(), 0);
}

#[tokio::test]
async fn download_failure_surfaces_tool_diagnostic() {
    let ctx = TestContext::new();
    let url = "https://media.example/fail-download/1";

    let response = ctx.post("/api/download", json!({ "url": url }).to_string()).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        body_text(response).await,
        format!("ERROR: [generic] Unsupported URL: {url}")
    );
    assert_eq!(ctx.leftover_entries(), 0);
}

#[tokio::test]
async fn slow_download_is_killed_and_cleaned_up() {
    let ctx = TestContext::with_timeout(Some(Duration::from_secs(1)));
    let url = "https://media.example/slow-download/1";

    let response = ctx.post("/api/download", json!({ "url": url }).to_string()).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_text(response).await, "Failed to download media");
    assert_eq!(ctx.leftover_entries(), 0);

    // The tool would have touched the marker after its sleep had it survived.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!call_file(url, "alive").exists());
}

#[tokio::test]
async fn download_without_output_file_is_server_error() {
    let ctx = TestContext::new();

    let response = ctx
        .post(
            "/api/download",
            json!({ "url": "https://media.example/no-output/1" }).to_string(),
        )
        .await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_text(response).await, "Failed to locate downloaded file");
    assert_eq!(ctx.leftover_entries(), 0);
}

#[tokio::test]
async fn title_lookup_failure_does_not_block_download() {
    let ctx = TestContext::new();

    let response = ctx
        .post(
            "/api/download",
            json!({ "url": "https://media.example/no-metadata/2" }).to_string(),
        )
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "fake media bytes");
    assert_eq!(ctx.leftover_entries(), 0);
}

#[tokio::test]
async fn abandoned_response_body_still_removes_job_dir() {
    let ctx = TestContext::new();

    let response = ctx
        .post(
            "/api/download",
            json!({ "url": "https://media.example/watch?v=abandoned" }).to_string(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(ctx.leftover_entries(), 1);

    drop(response);
    assert_eq!(ctx.leftover_entries(), 0);
}

#[tokio::test]
async fn api_routes_reject_other_methods() {
    let ctx = TestContext::new();

    for uri in ["/api/video-info", "/api/download"] {
        let response = ctx.get(uri).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED, "{uri}");
        assert_eq!(body_text(response).await, "Method not allowed");
    }
}

#[tokio::test]
async fn static_site_is_served() {
    let ctx = TestContext::new();

    let response = ctx.get("/").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "<h1>vidfetch</h1>");

    let response = ctx.get("/static/script.js").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "console.log('ok');");

    let response = ctx.get("/nowhere").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
