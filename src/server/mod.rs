pub mod error;
pub mod handlers;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::resolver::MetadataResolver;
use crate::streamer::DownloadStreamer;

/// Shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<MetadataResolver>,
    pub streamer: Arc<DownloadStreamer>,
}

impl AppState {
    pub fn new(resolver: MetadataResolver, streamer: DownloadStreamer) -> Self {
        Self {
            resolver: Arc::new(resolver),
            streamer: Arc::new(streamer),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/info", get(handlers::media_info))
        .route("/api/download", get(handlers::download))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves until `shutdown` resolves, then waits for open requests to finish.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")
}
