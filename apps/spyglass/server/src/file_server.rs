//! Side-channel HTTP server: static downloads for peers plus health and
//! metrics endpoints. It runs beside the rendezvous listener and never takes
//! it down.

use std::path::Path;

use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::FileServerConfig;
use crate::metrics;

pub fn router(root: &Path) -> Router {
    if !root.exists() {
        warn!(root = %root.display(), "file share directory does not exist");
    }
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback_service(ServeDir::new(root))
        .layer(TraceLayer::new_for_http())
}

/// Serves until shutdown. Bind and serve failures are logged, not returned.
pub async fn serve(config: FileServerConfig, shutdown: CancellationToken) {
    let listener = match tokio::net::TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(
                listen_addr = %config.listen_addr,
                error = %err,
                "file server failed to bind; continuing without it"
            );
            return;
        }
    };
    info!(
        listen_addr = %config.listen_addr,
        root = %config.root.display(),
        "file server listening"
    );

    let app = router(&config.root);
    let graceful =
        axum::serve(listener, app).with_graceful_shutdown(async move { shutdown.cancelled().await });
    if let Err(err) = graceful.await {
        error!(error = %err, "file server stopped with error");
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler() -> String {
    metrics::export_prometheus()
}
