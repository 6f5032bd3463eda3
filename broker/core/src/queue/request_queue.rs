//! Priority request queue.
//!
//! Requests wait in one of three FIFO tiers. `dequeue` always serves the
//! highest non-empty tier. Every queued request carries its own timeout
//! timer; the timer and `dequeue`/`remove_request` race under the same lock,
//! so a request is removed exactly once.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::Priority;
use crate::config::QueueConfig;
use crate::error::BrokerError;
use crate::events::{BrokerEvent, EventBus};

/// Identifier of a queued request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Fresh random id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A request waiting in (or just taken from) the queue
#[derive(Debug)]
pub struct QueuedRequest<T> {
    /// Request identifier
    pub id: RequestId,
    /// Caller payload
    pub payload: T,
    /// Tier the request was queued in
    pub priority: Priority,
    /// When the request was queued
    pub enqueued_at: Instant,
}

impl<T> QueuedRequest<T> {
    /// Time spent since enqueue
    #[must_use]
    pub fn waited(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

/// Oldest request still waiting
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OldestRequest {
    /// Request identifier
    pub id: RequestId,
    /// Tier it waits in
    pub priority: Priority,
    /// Time spent waiting
    pub age_ms: u64,
}

/// Queue depth and activity
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Waiting in the high tier
    pub high: usize,
    /// Waiting in the normal tier
    pub normal: usize,
    /// Waiting in the low tier
    pub low: usize,
    /// Waiting in all tiers
    pub total: usize,
    /// Dequeued but not yet completed
    pub active: usize,
    /// Oldest waiting request
    pub oldest: Option<OldestRequest>,
}

struct Entry<T> {
    request: QueuedRequest<T>,
    timer: Option<JoinHandle<()>>,
}

impl<T> Entry<T> {
    fn disarm(mut self) -> QueuedRequest<T> {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.request
    }
}

struct Tiers<T> {
    queues: [VecDeque<Entry<T>>; 3],
    active: HashSet<RequestId>,
}

impl<T> Tiers<T> {
    fn total(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    fn take(&mut self, id: RequestId) -> Option<Entry<T>> {
        self.queues.iter_mut().find_map(|queue| {
            let pos = queue.iter().position(|e| e.request.id == id)?;
            queue.remove(pos)
        })
    }
}

/// Strict-priority request queue with per-request timeouts
pub struct RequestQueue<T> {
    config: QueueConfig,
    events: EventBus,
    tiers: Arc<Mutex<Tiers<T>>>,
    available: Notify,
    expired: Option<mpsc::UnboundedSender<QueuedRequest<T>>>,
}

impl<T: Send + 'static> RequestQueue<T> {
    /// Create an empty queue
    #[must_use]
    pub fn new(config: QueueConfig, events: EventBus) -> Self {
        Self {
            config,
            events,
            tiers: Arc::new(Mutex::new(Tiers {
                queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                active: HashSet::new(),
            })),
            available: Notify::new(),
            expired: None,
        }
    }

    /// Hand expired requests to `sink` instead of dropping them
    #[must_use]
    pub fn with_expired_sink(mut self, sink: mpsc::UnboundedSender<QueuedRequest<T>>) -> Self {
        self.expired = Some(sink);
        self
    }

    /// Queue limits in use
    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Queue a request
    ///
    /// # Errors
    ///
    /// - `BrokerError::QueueFull` when all tiers together hold `max_queue_size`
    /// - `BrokerError::PriorityQueueFull` when the tier is full or disabled
    pub fn enqueue(&self, payload: T, priority: Priority) -> Result<RequestId, BrokerError> {
        let id = RequestId::new();
        let queue_length = {
            let mut tiers = self.tiers.lock();
            let total = tiers.total();
            if total >= self.config.max_queue_size {
                return Err(BrokerError::QueueFull {
                    max_size: self.config.max_queue_size,
                });
            }
            let capacity = self.config.tier_capacity(priority);
            if tiers.queues[priority.index()].len() >= capacity {
                return Err(BrokerError::PriorityQueueFull {
                    priority,
                    max_size: capacity,
                });
            }

            let timer = self.arm_timeout(id, priority);
            tiers.queues[priority.index()].push_back(Entry {
                request: QueuedRequest {
                    id,
                    payload,
                    priority,
                    enqueued_at: Instant::now(),
                },
                timer,
            });
            total + 1
        };

        tracing::debug!(request_id = %id, priority = %priority, queue_length, "Request queued");
        self.events.emit(BrokerEvent::QueueEnqueued {
            request_id: id,
            priority,
            queue_length,
        });
        self.available.notify_one();
        Ok(id)
    }

    /// Take the head of the highest non-empty tier
    pub fn dequeue(&self) -> Option<QueuedRequest<T>> {
        let mut tiers = self.tiers.lock();
        let entry = tiers.queues.iter_mut().find_map(VecDeque::pop_front)?;
        let request = entry.disarm();
        tiers.active.insert(request.id);
        Some(request)
    }

    /// Wait until a request can be dequeued
    pub async fn dequeue_wait(&self) -> QueuedRequest<T> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(request) = self.dequeue() {
                return request;
            }
            notified.await;
        }
    }

    /// Remove a waiting request. Returns whether it was found.
    pub fn remove_request(&self, id: RequestId) -> bool {
        let Some(entry) = self.tiers.lock().take(id) else {
            return false;
        };
        let request = entry.disarm();
        tracing::debug!(request_id = %id, "Request removed from queue");
        self.events.emit(BrokerEvent::QueueRemoved {
            request_id: id,
            priority: request.priority,
        });
        true
    }

    /// Mark a dequeued request as finished. Returns whether it was active.
    pub fn complete(&self, id: RequestId) -> bool {
        self.tiers.lock().active.remove(&id)
    }

    /// Number of waiting requests
    #[must_use]
    pub fn len(&self) -> usize {
        self.tiers.lock().total()
    }

    /// Whether nothing is waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Depth per tier, active count and the oldest waiting request
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let tiers = self.tiers.lock();
        let oldest = tiers
            .queues
            .iter()
            .filter_map(VecDeque::front)
            .min_by_key(|e| e.request.enqueued_at)
            .map(|e| OldestRequest {
                id: e.request.id,
                priority: e.request.priority,
                age_ms: e.request.waited().as_millis() as u64,
            });
        QueueStats {
            high: tiers.queues[Priority::High.index()].len(),
            normal: tiers.queues[Priority::Normal.index()].len(),
            low: tiers.queues[Priority::Low.index()].len(),
            total: tiers.total(),
            active: tiers.active.len(),
            oldest,
        }
    }

    /// Drop every waiting request and forget active ones
    pub fn clear(&self) -> usize {
        let mut tiers = self.tiers.lock();
        let mut dropped = 0;
        for queue in &mut tiers.queues {
            for entry in queue.drain(..) {
                drop(entry.disarm());
                dropped += 1;
            }
        }
        tiers.active.clear();
        dropped
    }

    fn arm_timeout(&self, id: RequestId, priority: Priority) -> Option<JoinHandle<()>> {
        let timeout = self.config.queue_timeout()?;
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let tiers: Weak<Mutex<Tiers<T>>> = Arc::downgrade(&self.tiers);
        let events = self.events.clone();
        let expired = self.expired.clone();

        Some(handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(tiers) = tiers.upgrade() else {
                return;
            };
            // Whoever takes the entry under the lock owns it
            let Some(mut entry) = tiers.lock().take(id) else {
                return;
            };
            entry.timer = None;
            let request = entry.request;
            let waited_ms = request.waited().as_millis() as u64;

            tracing::warn!(request_id = %id, priority = %priority, waited_ms, "Queued request timed out");
            events.emit(BrokerEvent::QueueTimeout {
                request_id: id,
                priority,
                waited_ms,
            });
            if let Some(expired) = expired {
                let _ = expired.send(request);
            }
        }))
    }
}

impl<T> Drop for RequestQueue<T> {
    fn drop(&mut self) {
        for queue in &mut self.tiers.lock().queues {
            for entry in queue.iter_mut() {
                if let Some(timer) = entry.timer.take() {
                    timer.abort();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn queue(config: QueueConfig) -> RequestQueue<&'static str> {
        RequestQueue::new(config, EventBus::new())
    }

    #[tokio::test]
    async fn test_strict_priority_order() {
        let q = queue(QueueConfig::default());
        q.enqueue("low", Priority::Low).unwrap();
        q.enqueue("high-1", Priority::High).unwrap();
        q.enqueue("normal", Priority::Normal).unwrap();
        q.enqueue("high-2", Priority::High).unwrap();

        let order: Vec<_> = std::iter::from_fn(|| q.dequeue().map(|r| r.payload)).collect();
        assert_eq!(order, vec!["high-1", "high-2", "normal", "low"]);
    }

    #[tokio::test]
    async fn test_high_flood_drains_before_low() {
        let q = queue(QueueConfig::default());
        q.enqueue("low", Priority::Low).unwrap();
        for _ in 0..5 {
            q.enqueue("high", Priority::High).unwrap();
        }

        let order: Vec<_> = (0..6).filter_map(|_| q.dequeue()).map(|r| r.payload).collect();
        assert_eq!(order, vec!["high", "high", "high", "high", "high", "low"]);
        assert!(q.dequeue().is_none());
    }

    #[tokio::test]
    async fn test_capacity_errors() {
        let config = QueueConfig {
            max_queue_size: 3,
            priority_levels: vec![Priority::High, Priority::Normal],
            max_requests_per_priority: crate::config::PriorityLimits {
                high: 1,
                normal: 5,
                low: 5,
            },
            ..Default::default()
        };
        let q = queue(config);

        q.enqueue("h", Priority::High).unwrap();
        let err = q.enqueue("h2", Priority::High).unwrap_err();
        assert_eq!(err.code(), "PRIORITY_QUEUE_FULL");

        let err = q.enqueue("l", Priority::Low).unwrap_err();
        assert!(matches!(
            err,
            BrokerError::PriorityQueueFull {
                priority: Priority::Low,
                max_size: 0
            }
        ));

        q.enqueue("n1", Priority::Normal).unwrap();
        q.enqueue("n2", Priority::Normal).unwrap();
        let err = q.enqueue("n3", Priority::Normal).unwrap_err();
        assert!(matches!(err, BrokerError::QueueFull { max_size: 3 }));
    }

    #[tokio::test]
    async fn test_remove_and_complete_bookkeeping() {
        let q = queue(QueueConfig::default());
        let a = q.enqueue("a", Priority::Normal).unwrap();
        let b = q.enqueue("b", Priority::Low).unwrap();

        assert!(q.remove_request(b));
        assert!(!q.remove_request(b));

        let taken = q.dequeue().unwrap();
        assert_eq!(taken.id, a);
        assert_eq!(q.stats().active, 1);
        assert!(q.complete(a));
        assert!(!q.complete(a));
        assert_eq!(q.stats(), QueueStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_report_oldest() {
        let q = queue(QueueConfig::default());
        let first = q.enqueue("first", Priority::Low).unwrap();
        tokio::time::advance(Duration::from_millis(250)).await;
        q.enqueue("second", Priority::High).unwrap();

        let stats = q.stats();
        assert_eq!((stats.high, stats.normal, stats.low, stats.total), (1, 0, 1, 2));
        let oldest = stats.oldest.unwrap();
        assert_eq!(oldest.id, first);
        assert_eq!(oldest.priority, Priority::Low);
        assert_eq!(oldest.age_ms, 250);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_and_reports() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let (tx, mut expired) = mpsc::unbounded_channel();
        let config = QueueConfig {
            queue_timeout_ms: 1_000,
            ..Default::default()
        };
        let q = RequestQueue::new(config, events).with_expired_sink(tx);

        let id = q.enqueue("slow", Priority::Normal).unwrap();
        let kept = q.enqueue("taken", Priority::High).unwrap();
        assert_eq!(q.dequeue().unwrap().id, kept);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(q.is_empty());
        let request = expired.recv().await.unwrap();
        assert_eq!(request.id, id);
        assert_eq!(request.payload, "slow");

        let names: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok().map(|e| e.name())).collect();
        assert_eq!(names, vec!["queueEnqueued", "queueEnqueued", "queueTimeout"]);
        // The dequeued request's timer was disarmed
        assert!(expired.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dequeue_wait_wakes_on_enqueue() {
        let q = queue(QueueConfig::default());
        let mut waiter = tokio_test::task::spawn(q.dequeue_wait());
        tokio_test::assert_pending!(waiter.poll());

        q.enqueue("wake", Priority::Low).unwrap();
        assert!(waiter.is_woken());
        let request = tokio_test::assert_ready!(waiter.poll());
        assert_eq!(request.payload, "wake");
    }
}
