//! Error types for the dispatch engine
//!
//! ```text
//! Rejection        - admission refused (returned by submit, never queued)
//! RequestError     - terminal failure delivered through a ResultHandle
//! ├── Inference        - backend error or internal fault
//! ├── InferenceTimeout - worker-enforced timeout elapsed
//! └── Cancelled        - deadline, explicit cancel, caller gone, shutdown
//! ConfigError      - invalid DispatchConfig
//! ```

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Classification of an inference failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The backend reported an error
    Engine,
    /// The worker hit an unexpected fault while handling the request
    Internal,
}

impl FailureKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Engine => "inference_error",
            Self::Internal => "internal",
        }
    }
}

/// Why a request was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The request deadline passed before a result was available
    DeadlineExceeded,
    /// Cancelled through the handle or the dispatcher
    Explicit,
    /// The handle was dropped without being awaited
    CallerGone,
    /// The dispatcher shut down before the request ran
    Shutdown,
}

impl CancelReason {
    pub fn label(self) -> &'static str {
        match self {
            Self::DeadlineExceeded => "deadline",
            Self::Explicit => "explicit",
            Self::CallerGone => "caller_gone",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Terminal failure of an admitted request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("inference failed: {message}")]
    Inference { message: String, kind: FailureKind },

    #[error("inference timed out after {after:?}")]
    InferenceTimeout { after: Duration },

    #[error("request cancelled ({})", .reason.label())]
    Cancelled { reason: CancelReason },
}

impl RequestError {
    pub fn engine(message: impl Into<String>) -> Self {
        Self::Inference { message: message.into(), kind: FailureKind::Engine }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Inference { message: message.into(), kind: FailureKind::Internal }
    }

    pub fn cancelled(reason: CancelReason) -> Self {
        Self::Cancelled { reason }
    }

    /// Label used for the failure metrics
    pub fn failure_label(&self) -> &'static str {
        match self {
            Self::Inference { kind, .. } => kind.label(),
            Self::InferenceTimeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Invalid dispatcher configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("invalid value '{value}' for {var}")]
    InvalidEnv { var: String, value: String },
}
