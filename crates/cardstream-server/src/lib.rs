//! HTTP surface for the streaming service.
//!
//! Builds the axum router over a shared [`StreamingService`] and runs it with
//! graceful shutdown: on SIGINT/SIGTERM every live session is aborted before
//! the listener drains.

pub mod error;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use cardstream_engine::{StaticCatalog, StreamingConfig, StreamingService};
use cardstream_images::{ImageGenerationService, ImageServiceConfig, ImageStatusTracker};

pub use error::ApiError;

/// Listener settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `HOST` and `PORT`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(host) = lookup("HOST").filter(|h| !h.trim().is_empty()) {
            config.host = host.trim().to_string();
        }
        if let Some(raw) = lookup("PORT") {
            match raw.trim().parse() {
                Ok(port) => config.port = port,
                Err(_) => tracing::warn!(value = %raw, "Ignoring invalid PORT"),
            }
        }
        config
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<StreamingService>,
    pub started: Instant,
}

impl AppState {
    pub fn new(service: Arc<StreamingService>) -> Self {
        Self {
            service,
            started: Instant::now(),
        }
    }
}

/// A service over the built-in catalog and the registered image providers.
pub fn build_service(config: StreamingConfig, images: ImageServiceConfig) -> StreamingService {
    let images = ImageGenerationService::new(images, Arc::new(ImageStatusTracker::new()));
    StreamingService::new(config, Arc::new(StaticCatalog::new()), Arc::new(images))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/topics", get(handlers::topics))
        .route(
            "/api/presentations/stream",
            post(handlers::stream_presentation),
        )
        .route("/api/cards/stream", post(handlers::stream_card))
        .route("/api/stream/demo", get(handlers::stream_demo))
        .route("/api/stream/stats", get(handlers::stream_stats))
        .route("/api/stream/connections", get(handlers::list_connections))
        .route("/api/stream/:connection_id", delete(handlers::cancel_stream))
        .route("/api/images/providers", get(handlers::image_providers))
        .route("/api/images/stats", get(handlers::image_stats))
        .route("/api/images/:card_id/status", get(handlers::image_status))
        .route("/status/:card_id", get(handlers::image_status))
        .route(
            "/api/images/:card_id/regenerate",
            post(handlers::regenerate_image),
        )
        .route("/api/images/:card_id", delete(handlers::cancel_image))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until a shutdown signal arrives.
pub async fn serve(config: ServerConfig, service: Arc<StreamingService>) -> Result<()> {
    let addr: SocketAddr = config
        .addr()
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.addr()))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    service.spawn_janitor();
    let app = router(AppState::new(service.clone()));

    tracing::info!(%addr, "Cardstream server listening");
    tracing::info!("   Stream: POST http://{addr}/api/presentations/stream");
    tracing::info!("   Health: GET http://{addr}/health");

    // Sessions are aborted first so open SSE bodies end and the listener can drain.
    let shutdown_service = service.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_service.shutdown().await;
        })
        .await
        .context("Server error")?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT, shutting down...");
        }
        _ = terminate() => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
