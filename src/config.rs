use std::{path::PathBuf, time::Duration};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_YT_DLP_BIN: &str = "yt-dlp";
const DEFAULT_STATIC_DIR: &str = "static";

/// Process configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub ytdlp_bin: PathBuf,
    pub ytdlp_timeout: Option<Duration>,
    pub static_dir: PathBuf,
    /// Parent directory for per-request temp dirs. `None` uses the OS temp dir.
    pub download_dir: Option<PathBuf>,
    pub trust_proxy_headers: bool,
    pub log_download_titles: bool,
    pub allowed_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            ytdlp_bin: PathBuf::from(DEFAULT_YT_DLP_BIN),
            ytdlp_timeout: None,
            static_dir: PathBuf::from(DEFAULT_STATIC_DIR),
            download_dir: None,
            trust_proxy_headers: true,
            log_download_titles: true,
            allowed_origins: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |name: &str| {
            lookup(name).and_then(|value| non_empty(&value).map(ToString::to_string))
        };

        Self {
            bind_addr: resolve_bind_addr(&lookup),
            ytdlp_bin: text("YT_DLP_BIN")
                .map(PathBuf::from)
                .unwrap_or(defaults.ytdlp_bin),
            ytdlp_timeout: lookup("YT_DLP_TIMEOUT_SECONDS")
                .as_deref()
                .and_then(parse_u64)
                .filter(|seconds| *seconds > 0)
                .map(Duration::from_secs),
            static_dir: text("STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.static_dir),
            download_dir: text("DOWNLOAD_DIR").map(PathBuf::from),
            trust_proxy_headers: lookup("TRUST_PROXY_HEADERS")
                .as_deref()
                .and_then(parse_bool)
                .unwrap_or(defaults.trust_proxy_headers),
            log_download_titles: lookup("LOG_DOWNLOAD_TITLES")
                .as_deref()
                .and_then(parse_bool)
                .unwrap_or(defaults.log_download_titles),
            allowed_origins: lookup("ALLOWED_ORIGINS")
                .map(|value| {
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|origin| !origin.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

fn resolve_bind_addr<F>(lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(configured) = lookup("APP_ADDR")
        .as_deref()
        .and_then(non_empty)
        .map(ToString::to_string)
    {
        return configured;
    }

    let port = lookup("PORT")
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);

    format!("0.0.0.0:{port}")
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_u64(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok()
}

pub(crate) fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
