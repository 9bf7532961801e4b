//! Development backend that tags the input with the target language.

use std::time::Duration;

use async_trait::async_trait;

use mtqueue_core::{EngineError, InferenceEngine, Payload};

/// Returns `[<target>] <text>` after an optional simulated delay
#[derive(Debug, Clone)]
pub struct EchoTranslator {
    target: String,
    delay: Duration,
}

impl EchoTranslator {
    pub fn new(target: impl Into<String>) -> Self {
        Self { target: target.into(), delay: Duration::ZERO }
    }

    /// Simulate a slow model
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl InferenceEngine for EchoTranslator {
    fn name(&self) -> &str {
        "echo"
    }

    async fn translate(&self, payload: &Payload) -> Result<String, EngineError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let target = payload.target_lang.as_deref().unwrap_or(&self.target);
        Ok(format!("[{}] {}", target, payload.text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_uses_payload_target() {
        let engine = EchoTranslator::new("fr");
        assert_eq!(engine.translate(&Payload::new("Hello")).await.unwrap(), "[fr] Hello");

        let payload = Payload::new("Hello").with_languages("en", "de");
        assert_eq!(engine.translate(&payload).await.unwrap(), "[de] Hello");
    }
}
