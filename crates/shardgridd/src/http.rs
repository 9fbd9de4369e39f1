//! HTTP status surface.
//!
//! Handlers only read the coordinator's published status or raise the
//! shutdown latch, so they never wait on the control loop.

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::watch;
use tracing::info;

use shardgrid_cluster::{render_prometheus, ClusterHandle};

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub cluster: ClusterHandle,
}

/// Build the status router.
pub fn build_router(cluster: ClusterHandle) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/metrics", get(prometheus_metrics))
        .route("/shutdown", post(shutdown))
        .with_state(HttpState { cluster })
}

/// Serve the router on `listen` until `shutdown` flips.
pub async fn serve(
    listen: SocketAddr,
    cluster: ClusterHandle,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(addr = %listener.local_addr()?, "HTTP server starting");

    axum::serve(listener, build_router(cluster))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

/// GET /status
pub async fn status(State(state): State<HttpState>) -> impl IntoResponse {
    Json(state.cluster.status())
}

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<HttpState>) -> impl IntoResponse {
    let body = render_prometheus(&state.cluster.status());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// POST /shutdown
pub async fn shutdown(State(state): State<HttpState>) -> impl IntoResponse {
    state.cluster.request_shutdown();
    (StatusCode::ACCEPTED, Json(state.cluster.status()))
}
