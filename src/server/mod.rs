use crate::config::{MediaCacheSettings, ServerSettings};
use crate::proxy::MediaProxyService;
use anyhow::{Context, Result};
use axum::{
    http::{header, Method},
    routing::get,
    Router,
};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};

mod routes;

// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub proxy: Arc<MediaProxyService>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(proxy: Arc<MediaProxyService>) -> Self {
        AppState {
            proxy,
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(routes::health::root))
        .route("/health", get(routes::health::health))
        .route("/api/proxy/media", get(routes::media::proxy_media))
        .layer(cors())
        .with_state(state)
}

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::RANGE, header::IF_NONE_MATCH, header::CONTENT_TYPE])
        .expose_headers([
            header::CONTENT_LENGTH,
            header::CONTENT_RANGE,
            header::ACCEPT_RANGES,
            header::ETAG,
            header::LAST_MODIFIED,
        ])
}

// The entry point for the proxy's HTTP task.
pub async fn start(media: MediaCacheSettings, server: ServerSettings) -> Result<()> {
    let proxy = Arc::new(MediaProxyService::new(media).await?);
    let app = router(AppState::new(proxy));

    let listener = tokio::net::TcpListener::bind(server.address)
        .await
        .with_context(|| format!("unable to bind {}", server.address))?;

    log::info!("Axum server listening on {}", server.address);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    log::info!("Axum server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}
