//! Translation backends.
//!
//! - `http`: forwards to an upstream model server
//! - `echo`: development backend that needs no model

pub mod echo;
pub mod http;

use std::sync::Arc;

use mtqueue_core::{EngineError, InferenceEngine};

pub use echo::EchoTranslator;
pub use http::HttpTranslator;

use crate::BackendKind;

/// Backend error types
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The upstream server could not be reached
    #[error("Failed to connect to backend: {0}")]
    Connection(String),

    /// The upstream server answered with an error status
    #[error("Backend returned status {status}: {body}")]
    Upstream { status: u16, body: String },

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<BackendError> for EngineError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Connection(_) => EngineError::unavailable(err.to_string()),
            BackendError::Upstream { status, .. } if status == 503 => {
                EngineError::unavailable(err.to_string())
            }
            BackendError::Upstream { status, .. } if (400..500).contains(&status) => {
                EngineError::invalid_input(err.to_string())
            }
            _ => EngineError::backend(err.to_string()),
        }
    }
}

/// Build the backend selected by the server configuration
pub fn build_backend(config: &crate::ServerConfig) -> Result<Arc<dyn InferenceEngine>, BackendError> {
    let engine: Arc<dyn InferenceEngine> = match config.backend {
        BackendKind::Echo => Arc::new(
            EchoTranslator::new(&config.target_lang).with_delay(config.echo_delay),
        ),
        BackendKind::Http => Arc::new(HttpTranslator::new(
            &config.backend_url,
            &config.source_lang,
            &config.target_lang,
            config.upstream_timeout,
        )?),
    };
    Ok(engine)
}
