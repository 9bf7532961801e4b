//! Helpers for driving the router in tests

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, HeaderMap, Request, StatusCode},
    Router,
};
use serde_json::Value;
use tower::ServiceExt;

use mtqueue_core::DispatchConfig;

use crate::{build_router, build_state, AppState, ServerConfig};

pub async fn test_app(dispatch: DispatchConfig) -> (Router, Arc<AppState>) {
    test_app_with(ServerConfig { dispatch, ..Default::default() }).await
}

pub async fn test_app_with(config: ServerConfig) -> (Router, Arc<AppState>) {
    let config = ServerConfig { print_banner: false, ..config };
    let state = build_state(config).unwrap();
    (build_router(state.clone()), state)
}

pub async fn post_json(app: Router, uri: &'static str, body: Value) -> (StatusCode, HeaderMap, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

pub async fn get(app: Router, uri: &'static str) -> (StatusCode, String) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}
