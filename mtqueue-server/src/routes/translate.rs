//! Prioritised translation endpoint.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use mtqueue_core::{Payload, PriorityTier, RequestId};

use crate::error::ApiError;
use crate::state::AppState;

/// Body of `POST /translate`
#[derive(Debug, Deserialize)]
pub struct TranslateRequest {
    pub text: String,

    /// 0 (most urgent) to 3; defaults to 2
    #[serde(default = "default_priority")]
    pub priority: i64,

    /// Give up if no result within this many milliseconds
    #[serde(default)]
    pub deadline_ms: Option<u64>,

    #[serde(default)]
    pub source_lang: Option<String>,

    #[serde(default)]
    pub target_lang: Option<String>,
}

fn default_priority() -> i64 {
    PriorityTier::default().level() as i64
}

/// Successful `POST /translate` response; durations are in seconds
#[derive(Debug, Serialize, Deserialize)]
pub struct TranslateResponse {
    pub request_id: RequestId,
    pub original_text: String,
    pub translated_text: String,
    pub priority: u8,
    pub processing_time: f64,
    pub queued_time: f64,
    pub model_loaded: bool,
}

/// Translate text at the requested priority
///
/// POST /translate
pub async fn translate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TranslateRequest>,
) -> Result<Json<TranslateResponse>, ApiError> {
    let started = Instant::now();
    let tier = PriorityTier::from_level(request.priority)?;

    let result = dispatch(&state, tier, request).await;

    let status = match &result {
        Ok(_) => 200,
        Err(err) => err.status().as_u16(),
    };
    state.http_metrics.observe_response(tier, status, started.elapsed());
    result.map(Json)
}

async fn dispatch(
    state: &AppState,
    tier: PriorityTier,
    request: TranslateRequest,
) -> Result<TranslateResponse, ApiError> {
    if request.text.trim().is_empty() {
        return Err(ApiError::InvalidRequest("text must not be empty".to_string()));
    }
    if !state.ensure_backend().await {
        return Err(ApiError::ModelNotLoaded);
    }

    let mut payload = Payload::new(request.text.clone());
    payload.source_lang = request.source_lang;
    payload.target_lang = request.target_lang;

    let deadline = request.deadline_ms.map(Duration::from_millis);
    let handle = state.dispatcher.submit(payload, tier, deadline).await?;
    debug!(
        request_id = %handle.id(),
        priority = %tier,
        queue_depth = state.dispatcher.queue_len(),
        "Translation queued"
    );

    let translation = handle.wait().await?;
    info!(
        request_id = %translation.id,
        priority = %tier,
        wait_ms = translation.queued_for.as_millis() as u64,
        processing_ms = translation.processing_time.as_millis() as u64,
        "Translation complete"
    );

    Ok(TranslateResponse {
        request_id: translation.id,
        original_text: request.text,
        translated_text: translation.text,
        priority: tier.level(),
        processing_time: translation.processing_time.as_secs_f64(),
        queued_time: translation.queued_for.as_secs_f64(),
        model_loaded: state.model_loaded(),
    })
}
