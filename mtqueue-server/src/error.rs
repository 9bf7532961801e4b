//! Error types for the mtqueue HTTP service.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use mtqueue_core::{CancelReason, Rejection, RejectionReason, RequestError, TierError};

/// Seconds a rejected client is asked to wait before retrying
const RETRY_AFTER_SECS: u64 = 1;

/// API error types
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Priority outside 0..3
    #[error("{0}")]
    InvalidPriority(#[from] TierError),

    /// Request body is unusable
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The translation backend is not ready
    #[error("Model not loaded")]
    ModelNotLoaded,

    /// Admission refused the request
    #[error(transparent)]
    Rejected(#[from] Rejection),

    /// The request was admitted but did not complete
    #[error(transparent)]
    Request(#[from] RequestError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidPriority(_) | ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::ModelNotLoaded => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Rejected(rejection) => match rejection.reason {
                RejectionReason::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::TOO_MANY_REQUESTS,
            },
            ApiError::Request(err) => match err {
                RequestError::Inference { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                RequestError::InferenceTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                RequestError::Cancelled { reason: CancelReason::Shutdown } => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                RequestError::Cancelled { .. } => StatusCode::REQUEST_TIMEOUT,
            },
        }
    }

    /// Value of the `type` field in the error body
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::InvalidPriority(_) => "invalid_priority",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::ModelNotLoaded => "model_not_loaded",
            ApiError::Rejected(rejection) => rejection.reason.label(),
            ApiError::Request(err) => match err {
                RequestError::Inference { kind, .. } => kind.label(),
                RequestError::InferenceTimeout { .. } => "timeout",
                RequestError::Cancelled { .. } => "cancelled",
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
            }
        }));

        match self {
            ApiError::Rejected(_) if status == StatusCode::TOO_MANY_REQUESTS => (
                status,
                [(header::RETRY_AFTER, RETRY_AFTER_SECS.to_string())],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtqueue_core::PriorityTier;
    use std::time::Duration;

    #[test]
    fn test_status_mapping() {
        let err = ApiError::from(PriorityTier::from_level(9).unwrap_err());
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().starts_with("priority must be between 0 and 3"));

        assert_eq!(ApiError::ModelNotLoaded.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let timeout = ApiError::from(RequestError::InferenceTimeout { after: Duration::from_secs(1) });
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);

        let deadline = ApiError::from(RequestError::cancelled(CancelReason::DeadlineExceeded));
        assert_eq!(deadline.status(), StatusCode::REQUEST_TIMEOUT);

        let shutdown = ApiError::from(RequestError::cancelled(CancelReason::Shutdown));
        assert_eq!(shutdown.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_rejection_carries_retry_after() {
        let err = ApiError::from(Rejection {
            tier: PriorityTier::P3,
            reason: RejectionReason::GlobalCapacityExceeded { capacity: 4 },
        });
        assert_eq!(err.kind(), "global_capacity");

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    }

    #[test]
    fn test_shutdown_rejection_is_unavailable() {
        let err = ApiError::from(Rejection { tier: PriorityTier::P0, reason: RejectionReason::ShuttingDown });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }
}
