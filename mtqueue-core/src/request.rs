//! Request identity and payload.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tier::PriorityTier;

/// Unique identifier of a submitted request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RequestId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Text to translate, plus optional language hints for the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub text: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_lang: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_lang: Option<String>,
}

impl Payload {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), source_lang: None, target_lang: None }
    }

    pub fn with_languages(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.source_lang = Some(source.into());
        self.target_lang = Some(target.into());
        self
    }

    /// Short prefix of the text for log lines
    pub fn preview(&self) -> &str {
        match self.text.char_indices().nth(40) {
            Some((idx, _)) => &self.text[..idx],
            None => &self.text,
        }
    }
}

/// An admitted unit of work. Never mutated after admission.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub tier: PriorityTier,
    pub payload: Payload,
    /// Set again when the queue accepts the request, so time spent waiting
    /// for admission is not counted as queue wait
    pub enqueued_at: Instant,
    /// Budget for the whole submission, measured from creation
    pub deadline: Option<Instant>,
}

impl Request {
    pub fn new(tier: PriorityTier, payload: Payload, deadline: Option<Duration>) -> Self {
        let enqueued_at = Instant::now();
        Self {
            id: RequestId::new(),
            tier,
            payload,
            enqueued_at,
            deadline: deadline.map(|d| enqueued_at + d),
        }
    }

    /// Use a caller-assigned identifier instead of a generated one
    pub fn with_id(mut self, id: RequestId) -> Self {
        self.id = id;
        self
    }

    /// Whether the deadline (if any) has passed
    pub fn is_expired(&self) -> bool {
        self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    /// Time spent in the queue so far
    pub fn waited(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}
