//! Admission control with per-tier reserved capacity.
//!
//! The queue is split into a shared pool and one reserve per tier. A tier's
//! entries fill its own reserve first and only the excess spills into the
//! shared pool, so a P3 flood can exhaust the shared pool but never the P0
//! and P1 reserves:
//!
//! ```text
//!   reserve P0 [##..]   reserve P1 [#...]   shared pool [##########]
//!        ^ only P0           ^ only P1           ^ everyone's overflow
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::config::DispatchConfig;
use crate::metrics::MetricsRegistry;
use crate::queue::{PriorityQueue, PushError, QueueError, TierDepths};
use crate::request::Request;
use crate::tier::PriorityTier;

/// Why a submission was refused
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    #[error("global queue capacity exceeded (shared capacity: {capacity})")]
    GlobalCapacityExceeded { capacity: usize },

    #[error("capacity for {tier} exceeded (reserved: {reserved})")]
    TierCapacityExceeded { tier: PriorityTier, reserved: usize },

    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

impl RejectionReason {
    /// Label used for `requests_rejected_total{reason}`
    pub fn label(&self) -> &'static str {
        match self {
            Self::GlobalCapacityExceeded { .. } => "global_capacity",
            Self::TierCapacityExceeded { .. } => "tier_capacity",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

impl From<QueueError> for RejectionReason {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Full { capacity } => Self::GlobalCapacityExceeded { capacity },
            QueueError::Closed => Self::ShuttingDown,
        }
    }
}

/// A refused submission. No queue or registry state exists for it.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[error("{tier} request rejected: {reason}")]
pub struct Rejection {
    pub tier: PriorityTier,
    pub reason: RejectionReason,
}

/// Capacity rules applied at admission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionPolicy {
    /// Size of the pool shared by all tiers
    pub shared_capacity: usize,
    /// Slots usable only by the given tier
    pub reserved: [usize; PriorityTier::COUNT],
    /// Optional hard cap on a tier's queued entries
    pub tier_limits: [Option<usize>; PriorityTier::COUNT],
    /// Wait this long for space before rejecting; `None` fails fast
    pub wait: Option<Duration>,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        DispatchConfig::default().admission_policy()
    }
}

impl AdmissionPolicy {
    pub fn reserved(&self, tier: PriorityTier) -> usize {
        self.reserved[tier.index()]
    }

    /// Physical queue capacity: the shared pool plus every reserve
    pub fn total_capacity(&self) -> usize {
        self.shared_capacity + self.reserved.iter().sum::<usize>()
    }

    /// Shared-pool slots currently taken
    pub fn shared_in_use(&self, depths: &TierDepths) -> usize {
        depths
            .iter()
            .map(|(tier, depth)| depth.saturating_sub(self.reserved(tier)))
            .sum()
    }

    /// Decide whether one more `tier` entry fits
    pub fn check(&self, tier: PriorityTier, depths: &TierDepths) -> Result<(), RejectionReason> {
        let depth = depths.get(tier);
        let reserved = self.reserved(tier);

        if let Some(limit) = self.tier_limits[tier.index()] {
            if depth >= limit {
                return Err(RejectionReason::TierCapacityExceeded { tier, reserved });
            }
        }

        if depth < reserved {
            return Ok(());
        }

        if self.shared_in_use(depths) < self.shared_capacity {
            return Ok(());
        }

        if reserved > 0 {
            Err(RejectionReason::TierCapacityExceeded { tier, reserved })
        } else {
            Err(RejectionReason::GlobalCapacityExceeded { capacity: self.shared_capacity })
        }
    }
}

/// Gatekeeper in front of the queue
pub struct AdmissionController {
    policy: AdmissionPolicy,
    queue: Arc<PriorityQueue>,
    metrics: Arc<MetricsRegistry>,
}

impl AdmissionController {
    pub fn new(
        policy: AdmissionPolicy,
        queue: Arc<PriorityQueue>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self { policy, queue, metrics }
    }

    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    /// Admit `request` into the queue or say why not.
    ///
    /// With `policy.wait` set, a full queue is retried every time an entry
    /// leaves it until the wait runs out.
    pub async fn admit(&self, request: Request) -> Result<u64, Rejection> {
        let tier = request.tier;

        let reason = match self.policy.wait {
            None => match self.try_push(request) {
                Ok(sequence) => return Ok(sequence),
                Err(err) => err.error,
            },
            Some(wait) => match self.push_waiting(request, Instant::now() + wait).await {
                Ok(sequence) => return Ok(sequence),
                Err(reason) => reason,
            },
        };

        self.metrics.record_rejected(tier, reason.label());
        debug!(
            priority = %tier,
            reason = reason.label(),
            queue_depth = self.queue.len(),
            "Request rejected"
        );
        Err(Rejection { tier, reason })
    }

    fn try_push(&self, request: Request) -> Result<u64, PushError<RejectionReason>> {
        let tier = request.tier;
        self.queue
            .push_checked(request, |depths| self.policy.check(tier, depths))
    }

    async fn push_waiting(&self, request: Request, until: Instant) -> Result<u64, RejectionReason> {
        let mut request = request;
        loop {
            let freed = self.queue.space_freed();
            tokio::pin!(freed);
            freed.as_mut().enable();

            match self.try_push(request) {
                Ok(sequence) => return Ok(sequence),
                Err(PushError { error: RejectionReason::ShuttingDown, .. }) => {
                    return Err(RejectionReason::ShuttingDown);
                }
                Err(PushError { error, request: returned }) => {
                    if tokio::time::timeout_at(until, freed).await.is_err() {
                        return Err(error);
                    }
                    request = returned;
                }
            }
        }
    }
}
