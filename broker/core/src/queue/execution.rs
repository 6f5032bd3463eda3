//! Cancellable task runner.
//!
//! Tasks run with bounded concurrency. Each one gets a `CancellationToken`
//! and an optional timeout. Aborting a task drops its bookkeeping and
//! publishes `taskAborted` straight away; the in-flight future observes the
//! token and is dropped, nobody waits for it.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{oneshot, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::RequestId;
use crate::config::ExecutionConfig;
use crate::error::BrokerError;
use crate::events::{BrokerEvent, EventBus};

/// Identifier of an execution-queue task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Fresh random id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<RequestId> for TaskId {
    fn from(id: RequestId) -> Self {
        Self(*id.as_uuid())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Caller side of a submitted task
pub struct TaskHandle<T> {
    id: TaskId,
    token: CancellationToken,
    result: oneshot::Receiver<Result<T, BrokerError>>,
}

impl<T> TaskHandle<T> {
    /// Task identifier
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Whether the task was cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for the task's outcome
    ///
    /// # Errors
    ///
    /// Returns the task's error, or `BrokerError::Cancelled` if it was aborted.
    pub async fn join(self) -> Result<T, BrokerError> {
        self.result.await.unwrap_or_else(|_| {
            Err(BrokerError::Cancelled {
                request_id: self.id.to_string(),
                reason: "task dropped".to_string(),
            })
        })
    }
}

struct TaskEntry {
    token: CancellationToken,
    submitted_at: Instant,
}

struct Shared {
    config: ExecutionConfig,
    events: EventBus,
    permits: Arc<Semaphore>,
    tasks: DashMap<TaskId, TaskEntry>,
}

impl Shared {
    fn abort(&self, id: TaskId, reason: &str) -> bool {
        let Some((_, entry)) = self.tasks.remove(&id) else {
            return false;
        };
        entry.token.cancel();
        tracing::debug!(task_id = %id, reason, "Task aborted");
        self.events.emit(BrokerEvent::TaskAborted {
            task_id: id,
            reason: reason.to_string(),
        });
        true
    }
}

/// Bounded-concurrency runner for broker work
#[derive(Clone)]
pub struct ExecutionQueue {
    shared: Arc<Shared>,
}

impl ExecutionQueue {
    /// Create a runner
    #[must_use]
    pub fn new(config: ExecutionConfig, events: EventBus) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            shared: Arc::new(Shared {
                config,
                events,
                permits,
                tasks: DashMap::new(),
            }),
        }
    }

    /// Submit a task under a fresh id
    pub fn submit<F, Fut, T>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BrokerError>> + Send + 'static,
        T: Send + 'static,
    {
        self.submit_with_id(TaskId::new(), task)
    }

    /// Submit a task under a caller-chosen id
    pub fn submit_with_id<F, Fut, T>(&self, id: TaskId, task: F) -> TaskHandle<T>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BrokerError>> + Send + 'static,
        T: Send + 'static,
    {
        let token = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        self.shared.tasks.insert(
            id,
            TaskEntry {
                token: token.clone(),
                submitted_at: Instant::now(),
            },
        );

        let shared = Arc::clone(&self.shared);
        let task_token = token.clone();
        tokio::spawn(async move {
            let outcome = Self::run(&shared, id, task_token, task).await;
            let _ = tx.send(outcome);
        });

        TaskHandle {
            id,
            token,
            result: rx,
        }
    }

    async fn run<F, Fut, T>(
        shared: &Arc<Shared>,
        id: TaskId,
        token: CancellationToken,
        task: F,
    ) -> Result<T, BrokerError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let cancelled = |reason: &str| BrokerError::Cancelled {
            request_id: id.to_string(),
            reason: reason.to_string(),
        };

        let _permit = tokio::select! {
            () = token.cancelled() => return Err(cancelled("aborted before start")),
            permit = Arc::clone(&shared.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return Err(cancelled("execution queue closed")),
            },
        };

        let started = Instant::now();
        shared.events.emit(BrokerEvent::TaskStarted { task_id: id });

        let timeout = shared.config.task_timeout();
        let work = task(token.clone());
        let result = tokio::select! {
            () = token.cancelled() => return Err(cancelled("aborted")),
            result = Self::with_timeout(timeout, work) => result,
        };

        let Some(result) = result else {
            let reason = format!(
                "timed out after {}ms",
                timeout.map_or(0, |t| t.as_millis() as u64)
            );
            shared.abort(id, &reason);
            return Err(cancelled(&reason));
        };

        // An abort that raced with completion already published its event
        if shared.tasks.remove(&id).is_none() {
            return Err(cancelled("aborted"));
        }
        match &result {
            Ok(_) => shared.events.emit(BrokerEvent::TaskCompleted {
                task_id: id,
                duration_ms: started.elapsed().as_millis() as u64,
            }),
            Err(e) => shared.events.emit(BrokerEvent::TaskFailed {
                task_id: id,
                error: e.to_string(),
            }),
        }
        result
    }

    async fn with_timeout<Fut: Future>(timeout: Option<Duration>, work: Fut) -> Option<Fut::Output> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, work).await.ok(),
            None => Some(work.await),
        }
    }

    /// Abort a task. Returns whether it was still tracked.
    pub fn abort(&self, id: TaskId, reason: &str) -> bool {
        self.shared.abort(id, reason)
    }

    /// Abort every tracked task
    pub fn abort_all(&self, reason: &str) -> usize {
        let ids: Vec<TaskId> = self.shared.tasks.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter(|id| self.shared.abort(*id, reason))
            .count()
    }

    /// Tasks submitted and not yet finished
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.shared.tasks.len()
    }

    /// Tasks currently holding a concurrency slot
    #[must_use]
    pub fn running(&self) -> usize {
        self.shared.config.max_concurrent.max(1) - self.shared.permits.available_permits()
    }

    /// Age of the oldest tracked task
    #[must_use]
    pub fn oldest_age(&self) -> Option<Duration> {
        self.shared
            .tasks
            .iter()
            .map(|e| e.submitted_at.elapsed())
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runner(max_concurrent: usize, task_timeout_ms: u64) -> (ExecutionQueue, EventBus) {
        let events = EventBus::new();
        let config = ExecutionConfig {
            max_concurrent,
            task_timeout_ms,
        };
        (ExecutionQueue::new(config, events.clone()), events)
    }

    #[tokio::test]
    async fn test_completed_and_failed_events() {
        let (queue, events) = runner(2, 0);
        let mut rx = events.subscribe();

        let ok = queue.submit(|_| async { Ok::<_, BrokerError>(7) });
        assert_eq!(ok.join().await.unwrap(), 7);

        let failed = queue.submit(|_| async {
            Err::<(), _>(BrokerError::InvalidConfig("nope".to_string()))
        });
        assert!(failed.join().await.is_err());

        let names: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok().map(|e| e.name())).collect();
        assert_eq!(
            names,
            vec!["taskStarted", "taskCompleted", "taskStarted", "taskFailed"]
        );
        assert_eq!(queue.tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_does_not_wait_for_task() {
        let (queue, events) = runner(1, 0);
        let mut rx = events.subscribe();

        let handle = queue.submit(|_| async {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok::<_, BrokerError>(())
        });
        let id = handle.id();
        tokio::task::yield_now().await;

        assert!(queue.abort(id, "caller went away"));
        assert!(!queue.abort(id, "again"));
        assert_eq!(queue.tracked(), 0);

        let err = handle.join().await.unwrap_err();
        assert_eq!(err.code(), "CANCELLED");
        let names: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok().map(|e| e.name())).collect();
        assert_eq!(names, vec!["taskStarted", "taskAborted"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_aborts() {
        let (queue, events) = runner(1, 500);
        let mut rx = events.subscribe();

        let handle = queue.submit(|token| async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(Duration::from_secs(10)) => {}
            }
            Ok::<_, BrokerError>(())
        });
        let err = handle.join().await.unwrap_err();
        assert!(err.to_string().contains("timed out after 500ms"));

        let names: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok().map(|e| e.name())).collect();
        assert_eq!(names, vec!["taskStarted", "taskAborted"]);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let (queue, _) = runner(2, 0);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                queue.submit(move |_| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, BrokerError>(())
                })
            })
            .collect();

        for handle in handles {
            handle.join().await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(queue.running(), 0);
    }
}
