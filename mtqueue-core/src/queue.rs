//! Bounded priority queue shared by the admission path and the workers.
//!
//! Entries are ordered by `(tier, sequence)`. The sequence number is taken
//! from a single counter under the queue lock at insertion time, so it is
//! unique and strictly increasing, and same-tier entries leave in arrival
//! order. One mutex guards the heap; `Notify` plays the role of the wait
//! condition for `pop` and for admission waiting on free space.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::metrics::MetricsRegistry;
use crate::request::Request;
use crate::tier::PriorityTier;

/// Error types for queue operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is full (max: {capacity})")]
    Full { capacity: usize },

    #[error("Queue is closed")]
    Closed,
}

/// A push that did not go through. The request is handed back so the
/// caller can retry or drop it.
#[derive(Debug)]
pub struct PushError<E> {
    pub error: E,
    pub request: Request,
}

/// A request waiting for a worker
#[derive(Debug)]
pub struct QueueEntry {
    pub tier: PriorityTier,
    pub sequence: u64,
    pub request: Request,
}

impl QueueEntry {
    fn key(&self) -> (PriorityTier, u64) {
        (self.tier, self.sequence)
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Number of queued entries per tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierDepths([usize; PriorityTier::COUNT]);

impl TierDepths {
    pub fn get(&self, tier: PriorityTier) -> usize {
        self.0[tier.index()]
    }

    pub fn total(&self) -> usize {
        self.0.iter().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PriorityTier, usize)> + '_ {
        PriorityTier::ALL.iter().map(move |&t| (t, self.get(t)))
    }

    fn incr(&mut self, tier: PriorityTier) {
        self.0[tier.index()] += 1;
    }

    fn decr(&mut self, tier: PriorityTier) {
        self.0[tier.index()] = self.0[tier.index()].saturating_sub(1);
    }
}

impl From<[usize; PriorityTier::COUNT]> for TierDepths {
    fn from(depths: [usize; PriorityTier::COUNT]) -> Self {
        Self(depths)
    }
}

struct QueueState {
    heap: BinaryHeap<Reverse<QueueEntry>>,
    depths: TierDepths,
    next_sequence: u64,
    closed: bool,
}

impl QueueState {
    fn take_next(&mut self) -> Option<QueueEntry> {
        let Reverse(entry) = self.heap.pop()?;
        self.depths.decr(entry.tier);
        Some(entry)
    }
}

/// Bounded, strictly ordered queue of pending requests
pub struct PriorityQueue {
    state: Mutex<QueueState>,
    /// Signalled once per insert and on close
    available: Notify,
    /// Signalled whenever an entry leaves the queue
    space: Notify,
    capacity: usize,
    metrics: Arc<MetricsRegistry>,
}

impl PriorityQueue {
    pub fn new(capacity: usize, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::with_capacity(capacity.min(4096)),
                depths: TierDepths::default(),
                next_sequence: 0,
                closed: false,
            }),
            available: Notify::new(),
            space: Notify::new(),
            capacity,
            metrics,
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        // Nothing panics while holding the lock, so a poisoned state is still consistent
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a request, failing with `QueueError::Full` at capacity.
    ///
    /// Returns the sequence number assigned to the entry.
    pub fn push(&self, request: Request) -> Result<u64, PushError<QueueError>> {
        self.push_checked(request, |_| Ok::<(), QueueError>(()))
    }

    /// Insert a request if `check` accepts the current per-tier depths.
    ///
    /// The check and the insertion happen under the same lock, so no other
    /// push can slip in between the decision and the insert.
    pub fn push_checked<E, F>(&self, mut request: Request, check: F) -> Result<u64, PushError<E>>
    where
        E: From<QueueError>,
        F: FnOnce(&TierDepths) -> Result<(), E>,
    {
        let tier = request.tier;
        let sequence = {
            let mut state = self.state();

            if state.closed {
                return Err(PushError { error: QueueError::Closed.into(), request });
            }
            if let Err(error) = check(&state.depths) {
                return Err(PushError { error, request });
            }
            if state.heap.len() >= self.capacity {
                return Err(PushError {
                    error: QueueError::Full { capacity: self.capacity }.into(),
                    request,
                });
            }

            let sequence = state.next_sequence;
            state.next_sequence += 1;
            request.enqueued_at = Instant::now();
            state.depths.incr(tier);
            state.heap.push(Reverse(QueueEntry { tier, sequence, request }));
            self.metrics.record_admitted(tier);
            sequence
        };

        self.available.notify_one();
        Ok(sequence)
    }

    /// Remove the entry with the smallest `(tier, sequence)`, waiting while
    /// the queue is empty.
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub async fn pop(&self) -> Option<QueueEntry> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(entry) = state.take_next() {
                    drop(state);
                    self.on_dequeued(&entry);
                    return Some(entry);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Remove the next entry without waiting
    pub fn try_pop(&self) -> Option<QueueEntry> {
        let entry = self.state().take_next()?;
        self.on_dequeued(&entry);
        Some(entry)
    }

    fn on_dequeued(&self, entry: &QueueEntry) {
        self.metrics.record_dequeued(entry.tier, entry.request.waited());
        self.space.notify_waiters();
    }

    /// Remove every remaining entry in dispatch order
    pub fn drain(&self) -> Vec<QueueEntry> {
        let drained: Vec<QueueEntry> = {
            let mut state = self.state();
            let mut drained = Vec::with_capacity(state.heap.len());
            while let Some(entry) = state.take_next() {
                drained.push(entry);
            }
            drained
        };

        for entry in &drained {
            self.metrics.record_removed(entry.tier);
        }
        self.space.notify_waiters();
        drained
    }

    /// Stop accepting pushes. Waiting `pop`s drain what is left and then
    /// return `None`.
    pub fn close(&self) {
        self.state().closed = true;
        self.available.notify_waiters();
        self.space.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Future resolved the next time an entry leaves the queue
    pub fn space_freed(&self) -> Notified<'_> {
        self.space.notified()
    }

    pub fn depth(&self, tier: PriorityTier) -> usize {
        self.state().depths.get(tier)
    }

    pub fn depths(&self) -> TierDepths {
        self.state().depths
    }

    pub fn len(&self) -> usize {
        self.state().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Payload;
    use std::collections::HashSet;
    use std::time::Duration;

    fn queue(capacity: usize) -> PriorityQueue {
        PriorityQueue::new(capacity, Arc::new(MetricsRegistry::new()))
    }

    fn request(tier: PriorityTier, text: &str) -> Request {
        Request::new(tier, Payload::new(text), None)
    }

    #[test]
    fn test_pops_in_tier_order() {
        let queue = queue(10);
        for tier in [PriorityTier::P2, PriorityTier::P3, PriorityTier::P0, PriorityTier::P1] {
            queue.push(request(tier, "x")).unwrap();
        }

        let order: Vec<PriorityTier> =
            std::iter::from_fn(|| queue.try_pop()).map(|e| e.tier).collect();
        assert_eq!(order, PriorityTier::ALL.to_vec());
    }

    #[test]
    fn test_fifo_within_tier() {
        let queue = queue(10);
        queue.push(request(PriorityTier::P2, "a")).unwrap();
        queue.push(request(PriorityTier::P3, "low")).unwrap();
        queue.push(request(PriorityTier::P2, "b")).unwrap();

        let texts: Vec<String> = std::iter::from_fn(|| queue.try_pop())
            .map(|e| e.request.payload.text)
            .collect();
        assert_eq!(texts, vec!["a", "b", "low"]);
    }

    #[test]
    fn test_sequences_are_unique_and_increasing() {
        let queue = queue(10);
        let a = queue.push(request(PriorityTier::P1, "a")).unwrap();
        let b = queue.push(request(PriorityTier::P3, "b")).unwrap();
        let c = queue.push(request(PriorityTier::P1, "c")).unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_push_on_full_queue_fails() {
        let queue = queue(2);
        queue.push(request(PriorityTier::P3, "1")).unwrap();
        queue.push(request(PriorityTier::P3, "2")).unwrap();

        let err = queue.push(request(PriorityTier::P0, "3")).unwrap_err();
        assert_eq!(err.error, QueueError::Full { capacity: 2 });
        assert_eq!(err.request.payload.text, "3");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_depths_track_push_and_pop() {
        let queue = queue(10);
        queue.push(request(PriorityTier::P0, "a")).unwrap();
        queue.push(request(PriorityTier::P3, "b")).unwrap();
        queue.push(request(PriorityTier::P3, "c")).unwrap();

        assert_eq!(queue.depth(PriorityTier::P3), 2);
        assert_eq!(queue.depths().total(), 3);

        queue.try_pop();
        assert_eq!(queue.depth(PriorityTier::P0), 0);
        assert_eq!(queue.depth(PriorityTier::P3), 2);
    }

    #[test]
    fn test_rejecting_check_leaves_queue_untouched() {
        let queue = queue(10);
        let result = queue.push_checked(request(PriorityTier::P1, "a"), |depths| {
            if depths.total() == 0 {
                Err(QueueError::Closed)
            } else {
                Ok(())
            }
        });

        assert!(result.is_err());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_closed_queue_rejects_push() {
        let queue = queue(10);
        queue.close();
        let err = queue.push(request(PriorityTier::P0, "a")).unwrap_err();
        assert_eq!(err.error, QueueError::Closed);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(queue(10));

        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!popper.is_finished());

        queue.push(request(PriorityTier::P1, "late")).unwrap();
        let entry = popper.await.unwrap().unwrap();
        assert_eq!(entry.request.payload.text, "late");
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = queue(10);
        queue.push(request(PriorityTier::P2, "left")).unwrap();
        queue.close();

        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_close_wakes_idle_pop() {
        let queue = Arc::new(queue(10));
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert!(popper.await.unwrap().is_none());
    }

    #[test]
    fn test_drain_returns_dispatch_order() {
        let queue = queue(10);
        queue.push(request(PriorityTier::P3, "c")).unwrap();
        queue.push(request(PriorityTier::P0, "a")).unwrap();
        queue.push(request(PriorityTier::P1, "b")).unwrap();

        let drained: Vec<String> =
            queue.drain().into_iter().map(|e| e.request.payload.text).collect();
        assert_eq!(drained, vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_push_pop_no_loss_or_duplication() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 250;

        let queue = Arc::new(queue(PRODUCERS * PER_PRODUCER));

        let mut consumers = Vec::new();
        for _ in 0..3 {
            let queue = queue.clone();
            consumers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(entry) = queue.pop().await {
                    seen.push(entry.request.id);
                }
                seen
            }));
        }

        let mut producers = Vec::new();
        for p in 0..PRODUCERS {
            let queue = queue.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..PER_PRODUCER {
                    let tier = PriorityTier::ALL[(p + i) % 4];
                    queue.push(request(tier, "x")).unwrap();
                    if i % 50 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }
        queue.close();

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }

        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), PRODUCERS * PER_PRODUCER);
        assert_eq!(unique.len(), all.len());
    }

    #[test]
    fn test_single_consumer_sees_non_decreasing_keys() {
        let queue = queue(100);
        for i in 0..40 {
            queue.push(request(PriorityTier::ALL[(i * 7) % 4], "x")).unwrap();
        }

        let keys: Vec<(PriorityTier, u64)> =
            std::iter::from_fn(|| queue.try_pop()).map(|e| (e.tier, e.sequence)).collect();
        assert_eq!(keys.len(), 40);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_queue_wait_starts_at_insertion() {
        let queue = queue(4);
        let created = request(PriorityTier::P1, "held back");
        let created_at = created.enqueued_at;
        std::thread::sleep(Duration::from_millis(20));

        let before_push = Instant::now();
        queue.push(created).unwrap();
        let entry = queue.try_pop().unwrap();

        assert!(entry.request.enqueued_at >= before_push);
        assert!(entry.request.enqueued_at > created_at);
    }
}
