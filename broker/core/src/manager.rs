//! Provider Manager
//!
//! The root of the broker. It composes the pool registry, per-provider state
//! machines, the retry handler, the request queue and the task runner behind
//! one `acquire / execute / release` contract.
//!
//! # Request Flow
//!
//! ```text
//! execute(id, op)
//!   |
//!   +-> provider connected?          no -> ProviderNotActive
//!   +-> pool.acquire_connection()    capacity errors surface immediately
//!   +-> op(provider)
//!   +-> pool.release_connection()    re-checks health, evicts if unhealthy
//!   +-> metrics.record_request()
//!   +-> on failure: ErrorHandler     transient -> back off, loop
//!                                    otherwise -> surface
//! ```
//!
//! `schedule` routes a completion through the priority [`RequestQueue`]
//! first; a dispatcher dequeues only when an execution slot is free, so tier
//! order is preserved under load.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{BrokerConfig, PoolConfig};
use crate::error::{BrokerError, ErrorCode};
use crate::events::{BrokerEvent, EventBus};
use crate::health::{HealthProbe, HealthRecord, ProviderHealth, ProviderHealthMonitor};
use crate::metrics::MetricsSink;
use crate::pool::{ConnectionLease, ConnectionPool, PoolRegistry, PoolStats, ReleaseOutcome};
use crate::provider::{
    CompletionRequest, CompletionResponse, Provider, ProviderConfig, ProviderFactory,
    StreamingToken,
};
use crate::queue::{
    ExecutionQueue, Priority, QueueStats, QueuedRequest, RequestId, RequestQueue, TaskId,
};
use crate::retry::{normalize, ErrorHandler};
use crate::state::{ConnectionState, ConnectionStateMachine, StateError, StateSnapshot, TransitionMeta};

// ============================================================================
// Scheduled Requests
// ============================================================================

type Reply = oneshot::Sender<Result<CompletionResponse, BrokerError>>;

/// A completion waiting in the request queue
struct PendingCall {
    provider_id: String,
    request: CompletionRequest,
    reply: Reply,
}

/// Caller side of a request submitted through [`ProviderManager::schedule`]
#[derive(Debug)]
pub struct ScheduledRequest {
    id: RequestId,
    reply: oneshot::Receiver<Result<CompletionResponse, BrokerError>>,
}

impl ScheduledRequest {
    /// Request identifier, usable with [`ProviderManager::cancel`]
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait for the completion
    ///
    /// # Errors
    ///
    /// Returns the dispatch error, `BrokerError::QueueTimeout` when the
    /// request expired in the queue, or `BrokerError::Cancelled` when it was
    /// cancelled or the manager was disposed.
    pub async fn response(self) -> Result<CompletionResponse, BrokerError> {
        let id = self.id;
        self.reply.await.unwrap_or_else(|_| {
            Err(BrokerError::Cancelled {
                request_id: id.to_string(),
                reason: "request dropped before completion".to_string(),
            })
        })
    }
}

// ============================================================================
// Held Connections
// ============================================================================

/// Tokens buffered between a provider stream and its consumer
const STREAM_BUFFER: usize = 100;

/// A lease together with the pool it goes back to
struct HeldConnection {
    pool: Arc<ConnectionPool>,
    lease: ConnectionLease,
}

impl HeldConnection {
    async fn release(self) -> ReleaseOutcome {
        self.pool.release_connection(self.lease).await
    }
}

// ============================================================================
// Health Probe
// ============================================================================

/// Probes a provider through one of its pooled connections
struct PoolProbe {
    pools: Weak<PoolRegistry>,
}

#[async_trait]
impl HealthProbe for PoolProbe {
    async fn probe(&self, provider_id: &str) -> HealthRecord {
        match self.pools.upgrade().and_then(|pools| pools.get(provider_id)) {
            Some(pool) => pool.probe().await,
            None => HealthRecord::unhealthy(format!("provider '{provider_id}' has no pool")),
        }
    }
}

// ============================================================================
// Provider Manager
// ============================================================================

/// Root orchestrator of pools, state, retries and scheduling
pub struct ProviderManager {
    config: BrokerConfig,
    events: EventBus,
    pools: Arc<PoolRegistry>,
    retry: ErrorHandler,
    metrics: Arc<dyn MetricsSink>,
    states: DashMap<String, ConnectionStateMachine>,
    queue: Arc<RequestQueue<PendingCall>>,
    executor: ExecutionQueue,
    health: Mutex<Option<Arc<ProviderHealthMonitor>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    disposed: AtomicBool,
}

impl ProviderManager {
    /// Create a manager and start its background tasks (pool maintenance,
    /// request dispatch, queue expiry). Must be called within a Tokio runtime.
    #[must_use]
    pub fn new(
        config: BrokerConfig,
        factory: Arc<dyn ProviderFactory>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<Self> {
        let events = EventBus::new();
        let pools = PoolRegistry::new(factory, events.clone());
        pools.start_maintenance(config.maintenance_interval());

        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(
            RequestQueue::new(config.queue.clone(), events.clone()).with_expired_sink(expired_tx),
        );

        let manager = Arc::new(Self {
            retry: ErrorHandler::new(config.retry.clone()),
            executor: ExecutionQueue::new(config.execution.clone(), events.clone()),
            config,
            events,
            pools,
            metrics,
            states: DashMap::new(),
            queue,
            health: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        });

        let permits = Arc::new(Semaphore::new(manager.config.execution.max_concurrent.max(1)));
        let dispatcher = tokio::spawn(dispatch_loop(
            Arc::downgrade(&manager),
            Arc::clone(&manager.queue),
            permits,
            manager.shutdown.clone(),
        ));
        let expiry = tokio::spawn(expiry_loop(expired_rx, manager.shutdown.clone()));
        manager.tasks.lock().extend([dispatcher, expiry]);

        tracing::debug!("Provider manager started");
        manager
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Event bus shared by every component
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribe to broker events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    fn check_open(&self, provider_id: &str) -> Result<(), BrokerError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BrokerError::NotInitialized {
                provider_id: provider_id.to_string(),
            });
        }
        Ok(())
    }

    fn machine(&self, provider_id: &str) -> ConnectionStateMachine {
        self.states
            .entry(provider_id.to_string())
            .or_insert_with(|| {
                ConnectionStateMachine::new(
                    provider_id,
                    self.config.state.clone(),
                    self.events.clone(),
                )
            })
            .clone()
    }

    // ------------------------------------------------------------------------
    // Provider Lifecycle
    // ------------------------------------------------------------------------

    /// Create a provider's pool and bring it up to `min_size`.
    ///
    /// The state machine moves `connecting -> connected` on success and
    /// `connecting -> error` on failure; a provider left in `error` may be
    /// initialized again.
    ///
    /// # Errors
    ///
    /// - `BrokerError::AlreadyInitialized` when the provider is already up
    /// - `BrokerError::InvalidConfig` for an invalid `pool_config`
    /// - `BrokerError::ConnectionFailed` when a connection could not be opened
    pub async fn initialize_provider(
        &self,
        provider_id: &str,
        provider_type: &str,
        provider_config: ProviderConfig,
        pool_config: PoolConfig,
    ) -> Result<usize, BrokerError> {
        self.check_open(provider_id)?;
        let already = || BrokerError::AlreadyInitialized {
            provider_id: provider_id.to_string(),
        };
        if self.pools.get(provider_id).is_some() {
            return Err(already());
        }

        let machine = self.machine(provider_id);
        match machine.current() {
            ConnectionState::Disconnected => {}
            ConnectionState::Error => machine.reset(),
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Reconnecting => return Err(already()),
        }
        machine.transition_to(ConnectionState::Connecting);

        let model = provider_config.model.clone();
        let pool = match self
            .pools
            .create_pool(provider_id, provider_type, provider_config, pool_config)
            .await
        {
            Ok(pool) => pool,
            Err(e @ BrokerError::AlreadyInitialized { .. }) => return Err(e),
            Err(e) => {
                tracing::warn!(provider_id = %provider_id, error = %e, "Provider initialization failed");
                machine.transition_with(ConnectionState::Error, TransitionMeta::error(state_error(&e)));
                self.metrics.record_error(provider_id, &e);
                return Err(e);
            }
        };

        let meta = model.map(TransitionMeta::model).unwrap_or_default();
        if !machine.transition_with(ConnectionState::Connected, meta) {
            // The connecting timer won; the pool is not trusted
            self.pools.remove_pool(provider_id).await;
            return Err(BrokerError::ProviderNotActive {
                provider_id: provider_id.to_string(),
            });
        }

        let connections = pool.size();
        tracing::info!(
            provider_id = %provider_id,
            provider_type = %provider_type,
            connections,
            "Provider initialized"
        );
        self.events.emit(BrokerEvent::ProviderInitialized {
            provider_id: provider_id.to_string(),
            provider_type: provider_type.to_string(),
            connections,
        });
        Ok(connections)
    }

    /// Dispose a provider's pool and move it to `disconnected`.
    /// Returns whether the provider had a pool.
    pub async fn remove_provider(&self, provider_id: &str) -> bool {
        let removed = self.pools.remove_pool(provider_id).await;
        if let Some(machine) = self.states.get(provider_id).map(|m| m.clone()) {
            if !machine.transition_to(ConnectionState::Disconnected) {
                machine.reset();
            }
        }
        if removed {
            tracing::info!(provider_id = %provider_id, "Provider removed");
            self.events.emit(BrokerEvent::ProviderRemoved {
                provider_id: provider_id.to_string(),
            });
        }
        removed
    }

    /// Current state of a provider
    #[must_use]
    pub fn provider_state(&self, provider_id: &str) -> Option<ConnectionState> {
        self.states.get(provider_id).map(|m| m.current())
    }

    /// Full state view of a provider
    #[must_use]
    pub fn state_snapshot(&self, provider_id: &str) -> Option<StateSnapshot> {
        self.states.get(provider_id).map(|m| m.snapshot())
    }

    /// Pool statistics of a provider
    #[must_use]
    pub fn pool_stats(&self, provider_id: &str) -> Option<PoolStats> {
        self.pools.get(provider_id).map(|pool| pool.stats())
    }

    /// Providers with a live pool
    #[must_use]
    pub fn provider_ids(&self) -> Vec<String> {
        self.pools.provider_ids()
    }

    /// Pool registry, for maintenance and inspection
    #[must_use]
    pub fn pools(&self) -> &Arc<PoolRegistry> {
        &self.pools
    }

    // ------------------------------------------------------------------------
    // Acquire / Execute / Release
    // ------------------------------------------------------------------------

    fn active_pool(&self, provider_id: &str) -> Result<Arc<ConnectionPool>, BrokerError> {
        let not_active = || BrokerError::ProviderNotActive {
            provider_id: provider_id.to_string(),
        };
        if self.provider_state(provider_id) != Some(ConnectionState::Connected) {
            return Err(not_active());
        }
        self.pools.get(provider_id).ok_or_else(not_active)
    }

    /// Borrow a connection for the caller to drive directly
    ///
    /// # Errors
    ///
    /// `BrokerError::ProviderNotActive` unless the provider is connected,
    /// otherwise whatever `acquire_connection` reports.
    pub async fn acquire(&self, provider_id: &str) -> Result<ConnectionLease, BrokerError> {
        self.check_open(provider_id)?;
        let pool = self.active_pool(provider_id)?;
        pool.acquire_connection().await.inspect_err(|e| {
            self.metrics.record_error(provider_id, e);
        })
    }

    /// Hand back a connection obtained from [`acquire`](Self::acquire)
    pub async fn release(&self, lease: ConnectionLease) -> ReleaseOutcome {
        match self.pools.get(lease.provider_id()) {
            Some(pool) => pool.release_connection(lease).await,
            None => ReleaseOutcome::Unknown,
        }
    }

    /// Run `op` against a pooled connection, retrying transient failures.
    ///
    /// `op` may run several times; each attempt gets a freshly acquired
    /// connection.
    ///
    /// # Errors
    ///
    /// - `BrokerError::ProviderNotActive` unless the provider is connected
    /// - capacity errors from the pool, without retry
    /// - `BrokerError::Connection` for non-retryable provider failures
    /// - `BrokerError::RetriesExhausted` when transient failures persisted
    pub async fn execute<T, F, Fut>(&self, provider_id: &str, op: F) -> Result<T, BrokerError>
    where
        F: Fn(Arc<dyn Provider>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let (value, held) = self.execute_held(provider_id, op).await?;
        held.release().await;
        Ok(value)
    }

    /// Like [`execute`](Self::execute), but the successful attempt's
    /// connection stays held and is handed to the caller
    async fn execute_held<T, F, Fut>(
        &self,
        provider_id: &str,
        op: F,
    ) -> Result<(T, HeldConnection), BrokerError>
    where
        F: Fn(Arc<dyn Provider>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.check_open(provider_id)?;
        let request_id = Uuid::new_v4();
        let result = self.execute_attempts(provider_id, &request_id, op).await;
        self.retry.clear(&request_id);
        result
    }

    async fn execute_attempts<T, F, Fut>(
        &self,
        provider_id: &str,
        request_id: &Uuid,
        op: F,
    ) -> Result<(T, HeldConnection), BrokerError>
    where
        F: Fn(Arc<dyn Provider>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        loop {
            let pool = self.active_pool(provider_id)?;
            let lease = pool.acquire_connection().await.inspect_err(|e| {
                self.metrics.record_error(provider_id, e);
            })?;

            let started = Instant::now();
            let outcome = op(Arc::clone(lease.provider())).await;
            let latency_ms = started.elapsed().as_millis() as u64;
            self.metrics
                .record_request(provider_id, outcome.is_ok(), latency_ms);

            let error = match outcome {
                Ok(value) => return Ok((value, HeldConnection { pool, lease })),
                Err(e) => normalize(e, provider_id),
            };
            pool.release_connection(lease).await;
            tracing::debug!(
                provider_id = %provider_id,
                code = %error.code,
                latency_ms,
                "Provider call failed"
            );
            if let Err(e) = self.retry.handle_error(request_id, provider_id, error).await {
                self.metrics.record_error(provider_id, &e);
                return Err(e);
            }
        }
    }

    /// One completion, with retries
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn generate_completion(
        &self,
        provider_id: &str,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, BrokerError> {
        self.execute(provider_id, |provider| async move {
            provider.generate_completion(request).await
        })
        .await
    }

    /// Streaming completion. Retries cover opening the stream only.
    ///
    /// The connection stays held until the stream ends or the receiver is
    /// dropped, so live streams count against the pool's `max_size`.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn stream_completion(
        &self,
        provider_id: &str,
        request: &CompletionRequest,
    ) -> Result<mpsc::Receiver<StreamingToken>, BrokerError> {
        let (mut upstream, held) = self
            .execute_held(provider_id, |provider| async move {
                provider.stream_completion(request).await
            })
            .await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            loop {
                let token = tokio::select! {
                    () = tx.closed() => break,
                    token = upstream.recv() => token,
                };
                let Some(token) = token else {
                    break;
                };
                if tx.send(token).await.is_err() {
                    break;
                }
            }
            held.release().await;
        });
        Ok(rx)
    }

    // ------------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------------

    /// Queue a completion at `priority`.
    ///
    /// Tiers are served strictly: a flood of `high` requests starves `normal`
    /// and `low` until it drains.
    ///
    /// # Errors
    ///
    /// - `BrokerError::ProviderNotActive` unless the provider is connected
    /// - `BrokerError::QueueFull` / `BrokerError::PriorityQueueFull`
    pub fn schedule(
        &self,
        provider_id: &str,
        request: CompletionRequest,
        priority: Priority,
    ) -> Result<ScheduledRequest, BrokerError> {
        self.check_open(provider_id)?;
        self.active_pool(provider_id)?;

        let (reply, rx) = oneshot::channel();
        let call = PendingCall {
            provider_id: provider_id.to_string(),
            request,
            reply,
        };
        let id = self.queue.enqueue(call, priority).inspect_err(|e| {
            self.metrics.record_error(provider_id, e);
        })?;
        Ok(ScheduledRequest { id, reply: rx })
    }

    /// Cancel a scheduled request, queued or running.
    /// Returns whether it was found.
    pub fn cancel(&self, id: RequestId) -> bool {
        self.queue.remove_request(id) || self.executor.abort(TaskId::from(id), "cancelled by caller")
    }

    /// Queue depth and activity
    #[must_use]
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    fn dispatch(self: &Arc<Self>, call: QueuedRequest<PendingCall>, permit: OwnedSemaphorePermit) {
        let QueuedRequest { id, payload, .. } = call;
        let PendingCall {
            provider_id,
            request,
            reply,
        } = payload;

        let weak = Arc::downgrade(self);
        let handle = self
            .executor
            .submit_with_id(TaskId::from(id), move |_token| async move {
                let Some(manager) = weak.upgrade() else {
                    return Err(BrokerError::Cancelled {
                        request_id: id.to_string(),
                        reason: "broker disposed".to_string(),
                    });
                };
                manager.generate_completion(&provider_id, &request).await
            });

        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            let result = handle.join().await;
            queue.complete(id);
            drop(permit);
            // Caller may have stopped waiting
            let _ = reply.send(result);
        });
    }

    // ------------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------------

    /// Start periodic health probing of connected providers and, when
    /// `auto_reconnect` is set, rebuilding of providers whose health turns
    /// critical. Calling it again returns the running monitor.
    pub fn start_health_monitor(self: &Arc<Self>) -> Arc<ProviderHealthMonitor> {
        let mut slot = self.health.lock();
        if let Some(monitor) = slot.as_ref() {
            return Arc::clone(monitor);
        }

        let probe = Arc::new(PoolProbe {
            pools: Arc::downgrade(&self.pools),
        });
        let monitor = ProviderHealthMonitor::new(self.config.health.clone(), self.events.clone(), probe);
        let follower = monitor.start();
        for entry in &self.states {
            if entry.value().is_connected() {
                monitor.start_probing(entry.key());
            }
        }

        let mut tasks = self.tasks.lock();
        tasks.push(follower);
        if self.config.health.auto_reconnect {
            tasks.push(tokio::spawn(recovery_loop(
                Arc::downgrade(self),
                self.events.subscribe(),
                self.shutdown.clone(),
            )));
        }
        *slot = Some(Arc::clone(&monitor));
        tracing::debug!("Health monitor started");
        monitor
    }

    /// Last probe result of a provider, if the monitor runs
    #[must_use]
    pub fn provider_health(&self, provider_id: &str) -> Option<ProviderHealth> {
        self.health.lock().as_ref()?.health(provider_id)
    }

    /// Rebuild a provider's pool: `error -> reconnecting -> connected`, or
    /// back to `error` when the pool cannot be refilled.
    ///
    /// # Errors
    ///
    /// `BrokerError::ProviderNotActive` when the provider has no pool or is
    /// already reconnecting, otherwise the rebuild failure.
    pub async fn recover_provider(&self, provider_id: &str) -> Result<usize, BrokerError> {
        self.check_open(provider_id)?;
        let not_active = || BrokerError::ProviderNotActive {
            provider_id: provider_id.to_string(),
        };
        let pool = self.pools.get(provider_id).ok_or_else(not_active)?;
        let machine = self.states.get(provider_id).map(|m| m.clone()).ok_or_else(not_active)?;

        if machine.current() == ConnectionState::Connected {
            machine.transition_with(
                ConnectionState::Error,
                TransitionMeta::error(StateError::new(
                    ErrorCode::ServiceUnavailable,
                    "provider health is critical",
                )),
            );
        }
        if !machine.transition_to(ConnectionState::Reconnecting) {
            return Err(not_active());
        }

        tracing::info!(provider_id = %provider_id, "Reconnecting provider");
        match pool.rebuild().await {
            Ok(connections) => {
                if !machine.transition_to(ConnectionState::Connected) {
                    return Err(not_active());
                }
                tracing::info!(provider_id = %provider_id, connections, "Provider reconnected");
                Ok(connections)
            }
            Err(e) => {
                tracing::error!(provider_id = %provider_id, error = %e, "Provider reconnect failed");
                machine.transition_with(ConnectionState::Error, TransitionMeta::error(state_error(&e)));
                self.metrics.record_error(provider_id, &e);
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Stop every background task, fail queued requests, abort running
    /// ones, dispose every pool and reset every state machine.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(monitor) = self.health.lock().take() {
            monitor.shutdown();
        }

        let dropped = self.queue.clear();
        let aborted = self.executor.abort_all("broker disposed");
        self.pools.dispose().await;
        for entry in &self.states {
            entry.value().reset();
        }
        tracing::info!(dropped, aborted, "Provider manager disposed");
    }
}

impl Drop for ProviderManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn state_error(error: &BrokerError) -> StateError {
    let code = match error {
        BrokerError::ConnectionFailed { source, .. }
        | BrokerError::Connection { source, .. }
        | BrokerError::RetriesExhausted { source, .. } => source.code,
        BrokerError::AcquireTimeout { .. } => ErrorCode::Timeout,
        _ => ErrorCode::Unknown,
    };
    StateError::new(code, error.to_string())
}

// ============================================================================
// Background Tasks
// ============================================================================

async fn dispatch_loop(
    manager: Weak<ProviderManager>,
    queue: Arc<RequestQueue<PendingCall>>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
) {
    loop {
        let permit = tokio::select! {
            () = shutdown.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let call = tokio::select! {
            () = shutdown.cancelled() => break,
            call = queue.dequeue_wait() => call,
        };
        let Some(manager) = manager.upgrade() else {
            break;
        };
        tracing::debug!(request_id = %call.id, priority = %call.priority, "Dispatching request");
        manager.dispatch(call, permit);
    }
    tracing::debug!("Request dispatcher stopped");
}

async fn expiry_loop(
    mut expired: mpsc::UnboundedReceiver<QueuedRequest<PendingCall>>,
    shutdown: CancellationToken,
) {
    loop {
        let call = tokio::select! {
            () = shutdown.cancelled() => break,
            call = expired.recv() => match call {
                Some(call) => call,
                None => break,
            },
        };
        let waited_ms = call.waited().as_millis() as u64;
        let _ = call.payload.reply.send(Err(BrokerError::QueueTimeout {
            request_id: call.id.to_string(),
            waited_ms,
        }));
    }
}

async fn recovery_loop(
    manager: Weak<ProviderManager>,
    mut events: broadcast::Receiver<BrokerEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(BrokerEvent::HealthCritical { provider_id, .. }) => {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if manager.provider_state(&provider_id) != Some(ConnectionState::Connected) {
                    continue;
                }
                tokio::spawn(async move {
                    if let Err(e) = manager.recover_provider(&provider_id).await {
                        tracing::warn!(provider_id = %provider_id, error = %e, "Automatic recovery failed");
                    }
                });
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Recovery loop lagged behind the event bus");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
