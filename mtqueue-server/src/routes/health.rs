//! Health check and metrics endpoints.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;
use std::sync::Arc;

use crate::state::AppState;

/// Health check endpoint
///
/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let check = state.check_backend().await;
    let snapshot = state.dispatcher.snapshot();

    let status = if check.is_ok() { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    let mut body = json!({
        "status": if check.is_ok() { "healthy" } else { "unhealthy" },
        "model_loaded": check.is_ok(),
        "backend": state.dispatcher.engine().name(),
        "queue_size": state.dispatcher.queue_len(),
        "workers": snapshot.workers,
        "active_workers": snapshot.active_workers,
        "accepting": state.dispatcher.is_accepting(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION")
    });
    if let Err(e) = check {
        body["error"] = json!(e.to_string());
    }

    (status, Json(body))
}

/// Prometheus metrics for the dispatcher and the HTTP boundary
///
/// GET /metrics
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.dispatcher.metrics().encode(),
    )
}

/// Per-priority counters and latency distributions as JSON
///
/// GET /stats
pub async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.dispatcher.snapshot())
}

/// Ready check (for Kubernetes)
///
/// GET /ready
pub async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.check_backend().await {
        Ok(_) if state.dispatcher.is_accepting() => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Live check (for Kubernetes)
///
/// GET /live
pub async fn live() -> impl IntoResponse {
    StatusCode::OK
}
