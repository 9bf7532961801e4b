//! Backend that forwards translations to an upstream model server.
//!
//! The upstream is expected to accept `POST {base}/translate` with
//! `{"text", "source", "target"}` and answer with `translated_text`
//! (or `translatedText`), and to expose `GET {base}/health`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};

use mtqueue_core::{EngineError, InferenceEngine, Payload};

use super::BackendError;

#[derive(Debug, Serialize)]
struct UpstreamRequest<'a> {
    text: &'a str,
    source: &'a str,
    target: &'a str,
}

#[derive(Debug, Deserialize)]
struct UpstreamResponse {
    #[serde(alias = "translatedText")]
    translated_text: String,
}

/// HTTP translation client
#[derive(Clone)]
pub struct HttpTranslator {
    client: Client,
    base_url: String,
    source: String,
    target: String,
}

impl HttpTranslator {
    pub fn new(
        base_url: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!(url = %base_url, "Creating HTTP translation backend");

        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url,
            source: source.into(),
            target: target.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send one translation request upstream
    #[instrument(skip(self, payload), fields(chars = payload.text.len()))]
    async fn post_translate(&self, payload: &Payload) -> Result<String, BackendError> {
        let url = format!("{}/translate", self.base_url);
        let body = UpstreamRequest {
            text: &payload.text,
            source: payload.source_lang.as_deref().unwrap_or(&self.source),
            target: payload.target_lang.as_deref().unwrap_or(&self.target),
        };
        debug!(url = %url, source = body.source, target = body.target, "Sending translate request");

        let response = self.client.post(&url).json(&body).send().await.map_err(connect_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Backend returned error");
            return Err(BackendError::Upstream { status: status.as_u16(), body });
        }

        let result: UpstreamResponse = response.json().await?;
        Ok(result.translated_text)
    }

    /// Check whether the upstream is serving
    #[instrument(skip(self))]
    async fn probe(&self) -> Result<(), BackendError> {
        let url = format!("{}/health", self.base_url);
        debug!(url = %url, "Checking backend health");

        let response = self.client.get(&url).send().await.map_err(connect_error)?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(BackendError::Upstream { status: status.as_u16(), body })
        }
    }
}

fn connect_error(err: reqwest::Error) -> BackendError {
    if err.is_connect() || err.is_timeout() {
        BackendError::Connection(err.to_string())
    } else {
        BackendError::Http(err)
    }
}

#[async_trait]
impl InferenceEngine for HttpTranslator {
    fn name(&self) -> &str {
        "http"
    }

    async fn translate(&self, payload: &Payload) -> Result<String, EngineError> {
        Ok(self.post_translate(payload).await?)
    }

    async fn health_check(&self) -> Result<(), EngineError> {
        Ok(self.probe().await?)
    }
}
