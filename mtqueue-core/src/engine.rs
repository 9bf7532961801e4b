//! The inference collaborator invoked by workers.
//!
//! Implementations know nothing about priorities or queueing; they turn a
//! payload into translated text or an error. Blocking implementations
//! should move their work onto `tokio::task::spawn_blocking`.

use async_trait::async_trait;
use thiserror::Error;

use crate::request::Payload;

/// Errors reported by an inference backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The model or upstream service is not ready
    #[error("Model not loaded: {0}")]
    Unavailable(String),

    /// The backend failed while translating
    #[error("Backend error: {0}")]
    Backend(String),

    /// The payload cannot be translated
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl EngineError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

/// A translation backend
#[async_trait]
pub trait InferenceEngine: Send + Sync + 'static {
    /// Short name for logs and health output
    fn name(&self) -> &str;

    /// Translate one payload
    async fn translate(&self, payload: &Payload) -> Result<String, EngineError>;

    /// Whether the backend can take work right now
    async fn health_check(&self) -> Result<(), EngineError> {
        Ok(())
    }
}
