//! Result handles and the registry that tracks them.
//!
//! Each admitted request gets one slot holding an explicit state machine:
//!
//! ```text
//!            resolve            ┌───────────┐
//!         ┌────────────────────▶│ Completed │
//!         │                     └───────────┘
//! ┌───────┴─┐  fail             ┌───────────┐
//! │ Pending ├──────────────────▶│  Failed   │
//! └───────┬─┘                   └───────────┘
//!         │  cancel / deadline  ┌───────────┐
//!         └────────────────────▶│ Cancelled │
//!                               └───────────┘
//! ```
//!
//! The first transition wins and delivers the outcome over a oneshot
//! channel; later transitions are refused with `AlreadyTerminal`. Slots
//! are removed when the handle is consumed or dropped, or by
//! `reap_terminal` after a grace period.
//!
//! A slot is registered before its request is pushed and only counts as
//! admitted once `mark_admitted` is called. Releasing or bulk-cancelling a
//! slot that was never admitted removes it without a transition, so
//! cancellation counters only ever cover admitted requests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{CancelReason, RequestError};
use crate::metrics::MetricsRegistry;
use crate::request::RequestId;
use crate::tier::PriorityTier;

/// Successful translation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Translation {
    pub id: RequestId,
    pub priority: PriorityTier,
    pub text: String,
    /// Admission to dispatch
    pub queued_for: Duration,
    /// Dispatch to completion
    pub processing_time: Duration,
}

/// What a handle eventually yields
pub type Outcome = Result<Translation, RequestError>;

/// Lifecycle state of a result handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl HandleState {
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("request {0} is already registered")]
    Duplicate(RequestId),

    #[error("request {0} is not registered")]
    Unknown(RequestId),

    #[error("request {id} already finished as {state:?}")]
    AlreadyTerminal { id: RequestId, state: HandleState },
}

struct Slot {
    tier: PriorityTier,
    state: HandleState,
    admitted: bool,
    dispatched: bool,
    sender: Option<oneshot::Sender<Outcome>>,
    finished_at: Option<Instant>,
}

/// Maps in-flight request ids to their result slots
pub struct ResultRegistry {
    slots: Mutex<HashMap<RequestId, Slot>>,
    metrics: Arc<MetricsRegistry>,
}

impl ResultRegistry {
    pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
        Self { slots: Mutex::new(HashMap::new()), metrics }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<RequestId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a pending slot and the handle the caller will await
    pub fn register(
        self: &Arc<Self>,
        id: RequestId,
        tier: PriorityTier,
        deadline: Option<Instant>,
    ) -> Result<ResultHandle, RegistryError> {
        let (sender, receiver) = oneshot::channel();

        let mut slots = self.slots();
        if slots.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        slots.insert(
            id,
            Slot {
                tier,
                state: HandleState::Pending,
                admitted: false,
                dispatched: false,
                sender: Some(sender),
                finished_at: None,
            },
        );

        Ok(ResultHandle {
            id,
            tier,
            deadline,
            receiver: Some(receiver),
            registry: Arc::clone(self),
            retrieved: false,
        })
    }

    /// Pending → Completed
    pub fn resolve(&self, id: RequestId, translation: Translation) -> Result<(), RegistryError> {
        self.finish(id, Ok(translation))
    }

    /// Pending → Failed (or Cancelled, for a cancellation error)
    pub fn fail(&self, id: RequestId, error: RequestError) -> Result<(), RegistryError> {
        self.finish(id, Err(error))
    }

    /// Pending → Cancelled
    pub fn cancel(&self, id: RequestId, reason: CancelReason) -> Result<(), RegistryError> {
        self.finish(id, Err(RequestError::cancelled(reason)))
    }

    fn finish(&self, id: RequestId, outcome: Outcome) -> Result<(), RegistryError> {
        let (tier, sender) = {
            let mut slots = self.slots();
            let slot = slots.get_mut(&id).ok_or(RegistryError::Unknown(id))?;
            if slot.state.is_terminal() {
                return Err(RegistryError::AlreadyTerminal { id, state: slot.state });
            }

            slot.state = match &outcome {
                Ok(_) => HandleState::Completed,
                Err(RequestError::Cancelled { .. }) => HandleState::Cancelled,
                Err(_) => HandleState::Failed,
            };
            slot.finished_at = Some(Instant::now());
            (slot.tier, slot.sender.take())
        };

        // Counters move before the caller can observe the outcome
        match &outcome {
            Ok(_) => self.metrics.record_completed(tier),
            Err(RequestError::Cancelled { reason }) => {
                debug!(request_id = %id, priority = %tier, reason = reason.label(), "Request cancelled");
                self.metrics.record_cancelled(tier, reason.label());
            }
            Err(err) => self.metrics.record_failed(tier, err.failure_label()),
        }

        if let Some(sender) = sender {
            // The receiver is gone if the handle was dropped; nothing to deliver
            let _ = sender.send(outcome);
        }
        Ok(())
    }

    /// Claim a pending request for execution.
    ///
    /// Returns false if the request was cancelled (or is unknown), in which
    /// case the worker must not call the backend.
    pub fn mark_dispatched(&self, id: RequestId) -> bool {
        match self.slots().get_mut(&id) {
            Some(slot) if slot.state == HandleState::Pending && !slot.dispatched => {
                slot.dispatched = true;
                true
            }
            _ => false,
        }
    }

    /// Record that the request behind `id` entered the queue
    pub fn mark_admitted(&self, id: RequestId) {
        if let Some(slot) = self.slots().get_mut(&id) {
            slot.admitted = true;
        }
    }

    pub fn state(&self, id: RequestId) -> Option<HandleState> {
        self.slots().get(&id).map(|slot| slot.state)
    }

    /// Forget a slot without touching metrics (used when admission fails)
    pub fn discard(&self, id: RequestId) {
        self.slots().remove(&id);
    }

    fn remove(&self, id: RequestId) {
        self.slots().remove(&id);
    }

    /// Cancel a still-pending admitted request whose handle went away, then
    /// drop the slot
    fn release(&self, id: RequestId) {
        let admitted_pending = self
            .slots()
            .get(&id)
            .map_or(false, |slot| slot.admitted && slot.state == HandleState::Pending);
        if admitted_pending {
            let _ = self.cancel(id, CancelReason::CallerGone);
        }
        self.remove(id);
    }

    /// Drop terminal slots that nobody collected within `grace`
    pub fn reap_terminal(&self, grace: Duration) -> usize {
        let mut slots = self.slots();
        let before = slots.len();
        slots.retain(|_, slot| slot.finished_at.map_or(true, |at| at.elapsed() < grace));
        before - slots.len()
    }

    /// Cancel every pending admitted request; returns how many were cancelled
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let pending: Vec<RequestId> = self
            .slots()
            .iter()
            .filter(|(_, slot)| slot.admitted && slot.state == HandleState::Pending)
            .map(|(id, _)| *id)
            .collect();

        pending
            .into_iter()
            .filter(|id| self.cancel(*id, reason).is_ok())
            .count()
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Caller-side placeholder for a result that is not available yet
pub struct ResultHandle {
    id: RequestId,
    tier: PriorityTier,
    deadline: Option<Instant>,
    receiver: Option<oneshot::Receiver<Outcome>>,
    registry: Arc<ResultRegistry>,
    retrieved: bool,
}

impl std::fmt::Debug for ResultHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultHandle")
            .field("id", &self.id)
            .field("tier", &self.tier)
            .field("deadline", &self.deadline)
            .field("retrieved", &self.retrieved)
            .finish()
    }
}

impl ResultHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn tier(&self) -> PriorityTier {
        self.tier
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn state(&self) -> Option<HandleState> {
        self.registry.state(self.id)
    }

    /// Cancel explicitly. Work already running is not interrupted.
    pub fn cancel(&self) -> bool {
        self.registry.cancel(self.id, CancelReason::Explicit).is_ok()
    }

    /// Wait for the terminal state, or until the deadline.
    ///
    /// On deadline expiry the request is cancelled, so a worker that has not
    /// picked it up yet skips it. If the worker finished first its result is
    /// returned instead.
    pub async fn wait(mut self) -> Outcome {
        let Some(mut receiver) = self.receiver.take() else {
            return Err(RequestError::internal("result already retrieved"));
        };

        let received = match self.deadline {
            Some(deadline) => {
                let deadline = tokio::time::Instant::from_std(deadline);
                match tokio::time::timeout_at(deadline, &mut receiver).await {
                    Ok(received) => received,
                    Err(_) => {
                        let _ = self.registry.cancel(self.id, CancelReason::DeadlineExceeded);
                        receiver.await
                    }
                }
            }
            None => receiver.await,
        };

        self.retrieved = true;
        self.registry.remove(self.id);

        received.unwrap_or_else(|_| Err(RequestError::internal("result channel closed")))
    }
}

impl Drop for ResultHandle {
    fn drop(&mut self) {
        if !self.retrieved {
            self.registry.release(self.id);
        }
    }
}
