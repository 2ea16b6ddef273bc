use std::{collections::HashSet, net::SocketAddr, sync::Arc};

use anyhow::{Context, bail};
use axum::{
    Router,
    http::{HeaderValue, Method, header::CONTENT_DISPOSITION},
    routing::post,
};
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};
use tracing::{debug, info};
use url::Url;

use crate::{
    api::{self, AppState},
    config::Config,
};

pub fn build_router(config: &Config) -> anyhow::Result<Router> {
    let state = AppState::from_config(config);

    let api = Router::new()
        .route(
            "/api/video-info",
            post(api::video_info).fallback(api::method_not_allowed),
        )
        .route(
            "/api/download",
            post(api::download).fallback(api::method_not_allowed),
        )
        .with_state(state);

    let mut app = api
        .route_service("/", ServeFile::new(config.static_dir.join("index.html")))
        .nest_service("/static", ServeDir::new(&config.static_dir))
        .layer(TraceLayer::new_for_http());

    if let Some(cors) = build_cors_layer(&config.allowed_origins)? {
        app = app.layer(cors);
    }

    Ok(app)
}

pub async fn serve(config: &Config) -> anyhow::Result<()> {
    let app = build_router(config)?;

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("could not bind {}", config.bind_addr))?;

    info!("Server starting on {}", config.bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("HTTP server error")
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

/// Builds a CORS layer for the configured origins, or `None` when the list is
/// empty and only same-origin requests are expected.
fn build_cors_layer(origins: &[String]) -> anyhow::Result<Option<CorsLayer>> {
    if origins.is_empty() {
        return Ok(None);
    }

    let mut normalized_origins = HashSet::new();
    for origin in origins {
        let Some(normalized) = normalize_origin(origin) else {
            bail!("invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com");
        };
        normalized_origins.insert(normalized);
    }

    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        normalized_origins.len(),
        normalized_origins
    );

    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let normalized = origin.to_str().ok().and_then(normalize_origin);
        let allowed = normalized
            .as_ref()
            .is_some_and(|value| allowed_origins.contains(value));
        debug!("CORS origin check raw={origin:?} allowed={allowed}");
        allowed
    });

    Ok(Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any)
            .expose_headers([CONTENT_DISPOSITION]),
    ))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    if !matches!(scheme, "http" | "https") {
        return None;
    }

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    // `Url` already drops the port when it is the scheme default.
    match parsed.port() {
        Some(port) => Some(format!("{scheme}://{host}:{port}")),
        None => Some(format!("{scheme}://{host}")),
    }
}
