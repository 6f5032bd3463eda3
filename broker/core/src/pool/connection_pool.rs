//! Connection Pool
//!
//! One pool per provider. The pool's connection map is the single authority
//! for a connection's `in_use` flag: every path that flips it (acquire,
//! release, eviction, health sweeps, disposal) does so under the map's lock,
//! and no lock is held across an `.await`.
//!
//! # Admission
//!
//! ```text
//! acquire ──> healthy idle connection? ──yes──> mark in_use, hand out lease
//!                   │ no
//!                   v
//!             size < max_size? ──yes──> create (counted as pending), hand out
//!                   │ no
//!                   v
//!             wait for a release / removal (100ms re-check) until
//!             acquire_timeout, then AcquireTimeout
//! ```
//!
//! Waiters are not served in arrival order: whichever waiter wakes first and
//! finds a healthy idle connection wins.
//!
//! # Capacity
//!
//! `size = connections in the map + creations in flight`. A connection
//! being disposed stays in the map (and counts) until disposal finishes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use super::connection::{ConnectionId, ConnectionInfo, ConnectionLease, PooledConnection};
use crate::config::PoolConfig;
use crate::error::{BrokerError, ConnectionError, ErrorCode};
use crate::events::{BrokerEvent, EventBus};
use crate::health::HealthRecord;
use crate::provider::{Provider, ProviderConfig, ProviderFactory};
use crate::retry::normalize;

/// Re-check interval while waiting for a connection
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Statistics
// ============================================================================

/// Point-in-time pool statistics
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Connections in the map plus creations in flight
    pub size: usize,
    /// Connections held by callers
    pub in_use: usize,
    /// Healthy connections free for acquisition
    pub idle: usize,
    /// Creations in flight
    pub pending: usize,
    /// Configured floor
    pub min_size: usize,
    /// Configured cap
    pub max_size: usize,
    /// Callers waiting in `acquire_connection`
    pub waiting_requests: usize,
    /// Connections created over the pool's lifetime
    pub connections_created: u64,
    /// Connections disposed over the pool's lifetime
    pub connections_closed: u64,
    /// Acquisitions served by an existing connection
    pub connections_reused: u64,
    /// Failed connection attempts
    pub connection_errors: u64,
    /// Health checks that reported unhealthy
    pub health_check_failures: u64,
    /// Acquisitions that hit `acquire_timeout`
    pub acquire_timeouts: u64,
    /// Total time callers spent waiting (ms)
    pub total_wait_time_ms: u64,
}

/// Atomic counters for lock-free updates
#[derive(Default)]
struct PoolStatsAtomic {
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    connections_reused: AtomicU64,
    connection_errors: AtomicU64,
    health_check_failures: AtomicU64,
    acquire_timeouts: AtomicU64,
    waiting_requests: AtomicUsize,
    total_wait_time_ms: AtomicU64,
}

impl PoolStatsAtomic {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn fill(&self, stats: &mut PoolStats) {
        stats.waiting_requests = self.waiting_requests.load(Ordering::Relaxed);
        stats.connections_created = self.connections_created.load(Ordering::Relaxed);
        stats.connections_closed = self.connections_closed.load(Ordering::Relaxed);
        stats.connections_reused = self.connections_reused.load(Ordering::Relaxed);
        stats.connection_errors = self.connection_errors.load(Ordering::Relaxed);
        stats.health_check_failures = self.health_check_failures.load(Ordering::Relaxed);
        stats.acquire_timeouts = self.acquire_timeouts.load(Ordering::Relaxed);
        stats.total_wait_time_ms = self.total_wait_time_ms.load(Ordering::Relaxed);
    }
}

/// What one maintenance pass did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Idle connections removed after failing a health check
    pub unhealthy_removed: usize,
    /// Idle connections removed for exceeding `idle_timeout`
    pub evicted: usize,
    /// Connections added to restore `min_size`
    pub added: usize,
}

/// Result of handing a lease back
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Healthy; back in the idle set
    Returned,
    /// Failed its health check and was removed
    Evicted,
    /// The pool no longer tracks the connection
    Unknown,
}

// ============================================================================
// Pool State
// ============================================================================

struct PoolState {
    connections: BTreeMap<ConnectionId, PooledConnection>,
    /// Creations in flight
    pending: usize,
    closed: bool,
}

impl PoolState {
    fn size(&self) -> usize {
        self.connections.len() + self.pending
    }
}

enum Reservation<'a> {
    Idle(ConnectionLease),
    Create(PendingSlot<'a>),
    Full,
}

/// Capacity held for a creation in flight; released on drop unless
/// committed together with the new map entry.
struct PendingSlot<'a> {
    pool: &'a ConnectionPool,
    armed: bool,
}

impl PendingSlot<'_> {
    fn commit(mut self, state: &mut PoolState) {
        state.pending -= 1;
        self.armed = false;
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.state.lock().pending -= 1;
            self.pool.available.notify_waiters();
        }
    }
}

/// Deletes a map entry when dropped, so disposal failures (or cancellation
/// mid-disposal) never leak the accounting
struct EntryRemoval<'a> {
    pool: &'a ConnectionPool,
    id: ConnectionId,
}

impl Drop for EntryRemoval<'_> {
    fn drop(&mut self) {
        let removed = self.pool.state.lock().connections.remove(&self.id).is_some();
        if removed {
            PoolStatsAtomic::bump(&self.pool.stats.connections_closed);
            self.pool.events.emit(BrokerEvent::ConnectionRemoved {
                provider_id: self.pool.provider_id.to_string(),
                connection_id: self.id.to_string(),
            });
        }
        self.pool.available.notify_waiters();
    }
}

/// Counts a caller in `waiting_requests` for as long as it waits, including
/// when the acquisition is dropped
struct Waiter<'a> {
    stats: &'a PoolStatsAtomic,
    started: Instant,
}

impl<'a> Waiter<'a> {
    fn new(stats: &'a PoolStatsAtomic) -> Self {
        stats.waiting_requests.fetch_add(1, Ordering::Relaxed);
        Self {
            stats,
            started: Instant::now(),
        }
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.stats.waiting_requests.fetch_sub(1, Ordering::Relaxed);
        self.stats
            .total_wait_time_ms
            .fetch_add(self.started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }
}

/// Puts a release back on the return channel when the releasing future is
/// dropped before the connection is settled, so a cancelled release never
/// strands the connection as held
struct PendingRelease<'a> {
    pool: &'a ConnectionPool,
    id: ConnectionId,
    armed: bool,
}

impl PendingRelease<'_> {
    fn settle(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingRelease<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(provider_id = %self.pool.provider_id, connection_id = %self.id, "Release interrupted, requeueing");
            // Pool gone: nothing to return to
            let _ = self.pool.return_tx.send(self.id);
        }
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A bounded pool of connections to one provider
pub struct ConnectionPool {
    provider_id: Arc<str>,
    provider_type: String,
    provider_config: ProviderConfig,
    config: PoolConfig,
    factory: Arc<dyn ProviderFactory>,
    events: EventBus,
    state: Mutex<PoolState>,
    /// Signalled whenever a connection may have become available
    available: Notify,
    stats: PoolStatsAtomic,
    /// Leases dropped without release come back through here
    return_tx: mpsc::UnboundedSender<ConnectionId>,
    return_rx: Mutex<mpsc::UnboundedReceiver<ConnectionId>>,
}

impl ConnectionPool {
    /// Create an empty pool; call [`initialize`](Self::initialize) to fill it
    #[must_use]
    pub fn new(
        provider_id: &str,
        provider_type: &str,
        provider_config: ProviderConfig,
        config: PoolConfig,
        factory: Arc<dyn ProviderFactory>,
        events: EventBus,
    ) -> Arc<Self> {
        let (return_tx, return_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            provider_id: Arc::from(provider_id),
            provider_type: provider_type.to_string(),
            provider_config,
            config,
            factory,
            events,
            state: Mutex::new(PoolState {
                connections: BTreeMap::new(),
                pending: 0,
                closed: false,
            }),
            available: Notify::new(),
            stats: PoolStatsAtomic::default(),
            return_tx,
            return_rx: Mutex::new(return_rx),
        })
    }

    /// Provider this pool serves
    #[must_use]
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// Provider type handed to the factory
    #[must_use]
    pub fn provider_type(&self) -> &str {
        &self.provider_type
    }

    /// Pool limits
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Whether the pool was disposed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn not_initialized(&self) -> BrokerError {
        BrokerError::NotInitialized {
            provider_id: self.provider_id.to_string(),
        }
    }

    // ------------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------------

    /// Bring the pool up to `min_size`
    ///
    /// # Errors
    ///
    /// Returns the first `add_connection` failure.
    pub async fn initialize(&self) -> Result<usize, BrokerError> {
        while self.size() < self.config.min_size {
            self.add_connection().await?;
        }
        let size = self.size();
        tracing::debug!(provider_id = %self.provider_id, size, "Pool initialized");
        Ok(size)
    }

    /// Create, connect and health-check a new idle connection
    ///
    /// # Errors
    ///
    /// - `BrokerError::PoolFull` when the pool is at `max_size`
    /// - `BrokerError::ConnectionFailed` when creation, connect or the
    ///   health check fails
    pub async fn add_connection(&self) -> Result<ConnectionId, BrokerError> {
        let slot = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(self.not_initialized());
            }
            if state.size() >= self.config.max_size {
                return Err(BrokerError::PoolFull {
                    provider_id: self.provider_id.to_string(),
                    max_size: self.config.max_size,
                });
            }
            state.pending += 1;
            PendingSlot {
                pool: self,
                armed: true,
            }
        };
        let (id, _) = self.create(slot, false).await?;
        Ok(id)
    }

    async fn create(
        &self,
        slot: PendingSlot<'_>,
        in_use: bool,
    ) -> Result<(ConnectionId, Arc<dyn Provider>), BrokerError> {
        let (provider, health) = self.open_provider().await.map_err(|source| {
            PoolStatsAtomic::bump(&self.stats.connection_errors);
            tracing::warn!(
                provider_id = %self.provider_id,
                error = %source,
                "Failed to open connection"
            );
            BrokerError::ConnectionFailed {
                provider_id: self.provider_id.to_string(),
                source,
            }
        })?;

        let connection = PooledConnection::new(Arc::clone(&provider), health, in_use);
        let id = connection.id;
        let inserted = {
            let mut state = self.state.lock();
            slot.commit(&mut state);
            if state.closed {
                false
            } else {
                state.connections.insert(id, connection);
                true
            }
        };
        if !inserted {
            if let Err(e) = provider.disconnect().await {
                tracing::debug!(provider_id = %self.provider_id, error = %e, "Disconnect failed");
            }
            return Err(self.not_initialized());
        }

        PoolStatsAtomic::bump(&self.stats.connections_created);
        tracing::debug!(provider_id = %self.provider_id, connection_id = %id, "Connection added");
        self.events.emit(BrokerEvent::ConnectionAdded {
            provider_id: self.provider_id.to_string(),
            connection_id: id.to_string(),
        });
        if !in_use {
            self.available.notify_waiters();
        }
        Ok((id, provider))
    }

    async fn open_provider(&self) -> Result<(Arc<dyn Provider>, HealthRecord), ConnectionError> {
        let provider = self
            .factory
            .create_provider(&self.provider_type, &self.provider_config)
            .map_err(|e| normalize(e, &self.provider_id))?;

        provider
            .connect()
            .await
            .map_err(|e| normalize(e, &self.provider_id))?;

        let failure = match provider.health_check().await {
            Ok(record) if record.is_healthy => return Ok((provider, record)),
            Ok(record) => ConnectionError::new(
                ErrorCode::ServiceUnavailable,
                format!(
                    "initial health check failed: {}",
                    record.last_error.as_deref().unwrap_or("unhealthy")
                ),
            )
            .with_provider(self.provider_id.to_string()),
            Err(e) => normalize(e, &self.provider_id),
        };
        PoolStatsAtomic::bump(&self.stats.health_check_failures);
        if let Err(e) = provider.disconnect().await {
            tracing::debug!(provider_id = %self.provider_id, error = %e, "Disconnect failed");
        }
        Err(failure)
    }

    // ------------------------------------------------------------------------
    // Acquire / Release
    // ------------------------------------------------------------------------

    /// Take exclusive hold of a healthy connection, creating one if there is
    /// room, otherwise waiting up to `acquire_timeout`
    ///
    /// # Errors
    ///
    /// - `BrokerError::AcquireTimeout` when nothing became available in time
    /// - `BrokerError::ConnectionFailed` when a needed new connection failed
    /// - `BrokerError::NotInitialized` when the pool is disposed
    pub async fn acquire_connection(&self) -> Result<ConnectionLease, BrokerError> {
        self.process_returns().await;

        let waiter = Waiter::new(&self.stats);
        self.acquire_until(waiter.started + self.config.acquire_timeout()).await
    }

    async fn acquire_until(&self, deadline: Instant) -> Result<ConnectionLease, BrokerError> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_reserve()? {
                Reservation::Idle(lease) => return Ok(lease),
                Reservation::Create(slot) => {
                    let (id, provider) = self.create(slot, true).await?;
                    return Ok(self.lease(id, provider));
                }
                Reservation::Full => {}
            }

            let now = Instant::now();
            if now >= deadline {
                PoolStatsAtomic::bump(&self.stats.acquire_timeouts);
                tracing::warn!(
                    provider_id = %self.provider_id,
                    timeout_ms = self.config.acquire_timeout_ms,
                    "Timed out waiting for a connection"
                );
                return Err(BrokerError::AcquireTimeout {
                    provider_id: self.provider_id.to_string(),
                    timeout_ms: self.config.acquire_timeout_ms,
                });
            }

            let wait = (deadline - now).min(ACQUIRE_POLL_INTERVAL);
            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep(wait) => {}
            }
            self.process_returns().await;
        }
    }

    fn try_reserve(&self) -> Result<Reservation<'_>, BrokerError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(self.not_initialized());
        }

        if let Some(connection) = state.connections.values_mut().find(|c| c.is_available()) {
            connection.in_use = true;
            connection.last_used_at = Instant::now();
            PoolStatsAtomic::bump(&self.stats.connections_reused);
            let lease = self.lease(connection.id, Arc::clone(&connection.provider));
            return Ok(Reservation::Idle(lease));
        }

        if state.size() < self.config.max_size {
            state.pending += 1;
            return Ok(Reservation::Create(PendingSlot {
                pool: self,
                armed: true,
            }));
        }
        Ok(Reservation::Full)
    }

    fn lease(&self, id: ConnectionId, provider: Arc<dyn Provider>) -> ConnectionLease {
        ConnectionLease::new(
            id,
            Arc::clone(&self.provider_id),
            provider,
            self.return_tx.clone(),
        )
    }

    /// Hand a lease back.
    ///
    /// The connection stays reserved while it is re-checked; a healthy
    /// connection returns to the idle set, an unhealthy one is removed.
    /// Dropping the returned future mid-check hands the connection to the
    /// return channel, like a dropped lease.
    pub async fn release_connection(&self, lease: ConnectionLease) -> ReleaseOutcome {
        self.release_id(lease.into_id()).await
    }

    async fn release_id(&self, id: ConnectionId) -> ReleaseOutcome {
        let provider = {
            let state = self.state.lock();
            match state.connections.get(&id) {
                Some(c) if c.in_use && !c.closing => Arc::clone(&c.provider),
                _ => return ReleaseOutcome::Unknown,
            }
        };

        let pending = PendingRelease {
            pool: self,
            id,
            armed: true,
        };
        let record = check_health(provider.as_ref()).await;
        pending.settle();
        let healthy = record.is_healthy;
        {
            let mut state = self.state.lock();
            let Some(connection) = state.connections.get_mut(&id) else {
                return ReleaseOutcome::Unknown;
            };
            connection.health = record;
            if healthy && !connection.closing {
                connection.in_use = false;
                connection.last_used_at = Instant::now();
                connection.requests_handled += 1;
            }
        }

        if healthy {
            self.available.notify_waiters();
            return ReleaseOutcome::Returned;
        }

        PoolStatsAtomic::bump(&self.stats.health_check_failures);
        tracing::warn!(
            provider_id = %self.provider_id,
            connection_id = %id,
            "Released connection failed its health check, evicting"
        );
        self.remove_connection(id).await;
        ReleaseOutcome::Evicted
    }

    /// Release leases that were dropped without an explicit release
    pub async fn process_returns(&self) {
        // One at a time: ids still in the channel survive a cancelled pass
        loop {
            let next = self.return_rx.lock().try_recv();
            let Ok(id) = next else {
                break;
            };
            tracing::debug!(provider_id = %self.provider_id, connection_id = %id, "Processing dropped lease");
            self.release_id(id).await;
        }
    }

    // ------------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------------

    /// Dispose a connection and delete it from the pool. The entry is deleted
    /// even when disposal fails. Returns whether the connection was found.
    pub async fn remove_connection(&self, id: ConnectionId) -> bool {
        let provider = {
            let mut state = self.state.lock();
            match state.connections.get_mut(&id) {
                Some(c) if !c.closing => {
                    c.closing = true;
                    Arc::clone(&c.provider)
                }
                _ => return false,
            }
        };
        self.dispose_connection(id, provider).await;
        true
    }

    async fn dispose_connection(&self, id: ConnectionId, provider: Arc<dyn Provider>) {
        let _removal = EntryRemoval { pool: self, id };
        if let Err(e) = provider.disconnect().await {
            tracing::warn!(
                provider_id = %self.provider_id,
                connection_id = %id,
                error = %e,
                "Failed to disconnect, dropping connection anyway"
            );
        }
    }

    /// Mark every live connection as closing and hand back their providers
    fn take_all(&self, close: bool) -> Vec<(ConnectionId, Arc<dyn Provider>)> {
        let mut state = self.state.lock();
        if close {
            state.closed = true;
        }
        state
            .connections
            .values_mut()
            .filter(|c| !c.closing)
            .map(|c| {
                c.closing = true;
                (c.id, Arc::clone(&c.provider))
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Remove idle connections unused for longer than `idle_timeout`.
    /// Connections in use are never touched.
    pub async fn evict_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout();
        let victims: Vec<(ConnectionId, Arc<dyn Provider>)> = {
            let mut state = self.state.lock();
            let now = Instant::now();
            state
                .connections
                .values_mut()
                .filter(|c| c.is_idle_expired(idle_timeout, now))
                .map(|c| {
                    c.closing = true;
                    (c.id, Arc::clone(&c.provider))
                })
                .collect()
        };

        let evicted = victims.len();
        for (id, provider) in victims {
            tracing::debug!(provider_id = %self.provider_id, connection_id = %id, "Evicting idle connection");
            self.dispose_connection(id, provider).await;
        }
        evicted
    }

    /// Add connections until the healthy idle count reaches `min_size`,
    /// bounded by `max_size`. Failures are logged, never returned.
    pub async fn replenish(&self) -> usize {
        let deficit = {
            let state = self.state.lock();
            if state.closed {
                return 0;
            }
            let idle = state.connections.values().filter(|c| c.is_available()).count();
            let room = self.config.max_size.saturating_sub(state.size());
            self.config.min_size.saturating_sub(idle).min(room)
        };

        let mut added = 0;
        for _ in 0..deficit {
            match self.add_connection().await {
                Ok(_) => added += 1,
                Err(e) => {
                    tracing::warn!(
                        provider_id = %self.provider_id,
                        error = %e,
                        "Failed to replenish pool"
                    );
                    break;
                }
            }
        }
        added
    }

    /// Health-check idle connections and remove the ones that fail.
    ///
    /// Connections are reserved while checked so nobody acquires them
    /// mid-check; their idle clock is left untouched.
    pub async fn check_idle_connections(&self) -> usize {
        let checked: Vec<(ConnectionId, Arc<dyn Provider>)> = {
            let mut state = self.state.lock();
            state
                .connections
                .values_mut()
                .filter(|c| c.is_available())
                .map(|c| {
                    c.in_use = true;
                    (c.id, Arc::clone(&c.provider))
                })
                .collect()
        };

        let results = join_all(checked.into_iter().map(|(id, provider)| async move {
            (id, check_health(provider.as_ref()).await)
        }))
        .await;

        let mut failed = Vec::new();
        {
            let mut state = self.state.lock();
            for (id, record) in results {
                let Some(connection) = state.connections.get_mut(&id) else {
                    continue;
                };
                let healthy = record.is_healthy;
                connection.health = record;
                if healthy {
                    connection.in_use = false;
                } else {
                    failed.push(id);
                }
            }
        }
        self.available.notify_waiters();

        for id in &failed {
            PoolStatsAtomic::bump(&self.stats.health_check_failures);
            tracing::warn!(provider_id = %self.provider_id, connection_id = %id, "Idle connection unhealthy, removing");
            self.remove_connection(*id).await;
        }
        failed.len()
    }

    /// One maintenance pass: returns, health sweep, idle eviction, then
    /// replenishment
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        self.process_returns().await;
        if self.is_closed() {
            return MaintenanceReport::default();
        }
        let unhealthy_removed = self.check_idle_connections().await;
        let evicted = self.evict_idle().await;
        let added = self.replenish().await;
        if unhealthy_removed + evicted + added > 0 {
            tracing::debug!(
                provider_id = %self.provider_id,
                unhealthy_removed,
                evicted,
                added,
                "Pool maintenance"
            );
        }
        MaintenanceReport {
            unhealthy_removed,
            evicted,
            added,
        }
    }

    /// Health of the provider behind this pool, probed through one of its
    /// connections (an idle one when possible)
    pub async fn probe(&self) -> HealthRecord {
        let provider = {
            let state = self.state.lock();
            state
                .connections
                .values()
                .filter(|c| !c.closing)
                .min_by_key(|c| c.in_use)
                .map(|c| Arc::clone(&c.provider))
        };
        match provider {
            Some(provider) => check_health(provider.as_ref()).await,
            None => HealthRecord::unhealthy("pool has no connections"),
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Drop every connection and bring the pool back up to `min_size`
    ///
    /// # Errors
    ///
    /// Returns the first failure while refilling.
    pub async fn rebuild(&self) -> Result<usize, BrokerError> {
        if self.is_closed() {
            return Err(self.not_initialized());
        }
        let victims = self.take_all(false);
        join_all(
            victims
                .into_iter()
                .map(|(id, provider)| self.dispose_connection(id, provider)),
        )
        .await;
        tracing::info!(provider_id = %self.provider_id, "Rebuilding pool");
        self.initialize().await
    }

    /// Close the pool and dispose every connection, held ones included.
    /// Individual disposal failures are logged and swallowed.
    pub async fn dispose(&self) {
        let victims = self.take_all(true);
        let count = victims.len();
        join_all(
            victims
                .into_iter()
                .map(|(id, provider)| self.dispose_connection(id, provider)),
        )
        .await;
        self.state.lock().connections.clear();
        self.available.notify_waiters();
        tracing::debug!(provider_id = %self.provider_id, count, "Pool disposed");
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    /// Connections in the map plus creations in flight
    #[must_use]
    pub fn size(&self) -> usize {
        self.state.lock().size()
    }

    /// View of every connection
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.state
            .lock()
            .connections
            .values()
            .map(PooledConnection::info)
            .collect()
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let mut stats = {
            let state = self.state.lock();
            PoolStats {
                size: state.size(),
                in_use: state.connections.values().filter(|c| c.in_use).count(),
                idle: state.connections.values().filter(|c| c.is_available()).count(),
                pending: state.pending,
                min_size: self.config.min_size,
                max_size: self.config.max_size,
                ..Default::default()
            }
        };
        self.stats.fill(&mut stats);
        stats
    }
}

async fn check_health(provider: &dyn Provider) -> HealthRecord {
    match provider.health_check().await {
        Ok(record) => record,
        Err(e) => HealthRecord::unhealthy(format!("{e:#}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockFactory;

    fn pool_with(factory: &MockFactory, config: PoolConfig) -> Arc<ConnectionPool> {
        ConnectionPool::new(
            "p1",
            "mock",
            ProviderConfig::default(),
            config,
            Arc::new(factory.clone()),
            EventBus::new(),
        )
    }

    fn config(min_size: usize, max_size: usize) -> PoolConfig {
        PoolConfig {
            min_size,
            max_size,
            idle_timeout_ms: 5_000,
            acquire_timeout_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn test_initialize_fills_to_min_size() {
        let factory = MockFactory::new();
        let pool = pool_with(&factory, config(2, 3));
        assert_eq!(pool.initialize().await.unwrap(), 2);

        let stats = pool.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.connections_created, 2);
        assert_eq!(factory.control().connects(), 2);
    }

    #[tokio::test]
    async fn test_add_connection_respects_max_size() {
        let factory = MockFactory::new();
        let pool = pool_with(&factory, config(0, 1));
        pool.add_connection().await.unwrap();

        let err = pool.add_connection().await.unwrap_err();
        assert_eq!(err.code(), "POOL_FULL");
        assert_eq!(err.provider_id(), Some("p1"));
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn test_add_connection_wraps_connect_failure() {
        let factory = MockFactory::new();
        factory.control().set_connect_failure(true);
        let pool = pool_with(&factory, config(0, 2));

        let err = pool.add_connection().await.unwrap_err();
        assert!(matches!(err, BrokerError::ConnectionFailed { .. }));
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.stats().connection_errors, 1);
    }

    #[tokio::test]
    async fn test_unhealthy_initial_check_rejected() {
        let factory = MockFactory::new();
        factory.control().set_healthy(false);
        let pool = pool_with(&factory, config(0, 2));

        let err = pool.add_connection().await.unwrap_err();
        assert_eq!(err.code(), "CONNECTION_FAILED");
        assert_eq!(factory.control().disconnects(), 1);
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test]
    async fn test_acquire_marks_in_use_and_release_returns() {
        let factory = MockFactory::new();
        let pool = pool_with(&factory, config(1, 1));
        pool.initialize().await.unwrap();

        let lease = pool.acquire_connection().await.unwrap();
        assert_eq!(pool.stats().in_use, 1);
        assert_eq!(pool.stats().idle, 0);

        assert_eq!(pool.release_connection(lease).await, ReleaseOutcome::Returned);
        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.connections_reused, 1);
        assert_eq!(pool.connections()[0].requests_handled, 1);
    }

    #[tokio::test]
    async fn test_release_evicts_unhealthy_connection() {
        let factory = MockFactory::new();
        let pool = pool_with(&factory, config(1, 2));
        pool.initialize().await.unwrap();

        let lease = pool.acquire_connection().await.unwrap();
        factory.control().set_healthy(false);
        assert_eq!(pool.release_connection(lease).await, ReleaseOutcome::Evicted);
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test]
    async fn test_remove_tolerates_disconnect_failure() {
        let factory = MockFactory::new();
        let pool = pool_with(&factory, config(1, 1));
        pool.initialize().await.unwrap();
        factory.control().set_disconnect_failure(true);

        let id = pool.connections()[0].id;
        assert!(pool.remove_connection(id).await);
        assert_eq!(pool.size(), 0);
        assert!(!pool.remove_connection(id).await);
        assert_eq!(pool.stats().connections_closed, 1);
    }

    #[tokio::test]
    async fn test_dropped_lease_is_processed() {
        let factory = MockFactory::new();
        let pool = pool_with(&factory, config(1, 1));
        pool.initialize().await.unwrap();

        drop(pool.acquire_connection().await.unwrap());
        // The next acquisition picks the returned connection up
        let lease = pool.acquire_connection().await.unwrap();
        assert_eq!(pool.size(), 1);
        pool.release_connection(lease).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_release_is_recovered() {
        let factory = MockFactory::new();
        let pool = pool_with(&factory, config(1, 1));
        pool.initialize().await.unwrap();

        let lease = pool.acquire_connection().await.unwrap();
        factory.control().set_health_latency(Duration::from_secs(1));
        let interrupted =
            tokio::time::timeout(Duration::from_millis(10), pool.release_connection(lease)).await;
        assert!(interrupted.is_err());
        assert_eq!(pool.stats().in_use, 1);

        factory.control().set_health_latency(Duration::ZERO);
        assert_eq!(pool.run_maintenance().await, MaintenanceReport::default());
        let stats = pool.stats();
        assert_eq!((stats.size, stats.in_use, stats.idle), (1, 0, 1));

        let lease = pool.acquire_connection().await.unwrap();
        assert_eq!(pool.release_connection(lease).await, ReleaseOutcome::Returned);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_acquire_keeps_later_returns() {
        let factory = MockFactory::new();
        let pool = pool_with(&factory, config(2, 2));
        pool.initialize().await.unwrap();

        let first = pool.acquire_connection().await.unwrap();
        let second = pool.acquire_connection().await.unwrap();
        drop(first);
        drop(second);

        // The acquisition is dropped while re-checking the first return
        factory.control().set_health_latency(Duration::from_secs(1));
        let interrupted =
            tokio::time::timeout(Duration::from_millis(10), pool.acquire_connection()).await;
        assert!(interrupted.is_err());

        factory.control().set_health_latency(Duration::ZERO);
        pool.process_returns().await;
        let stats = pool.stats();
        assert_eq!((stats.in_use, stats.idle), (0, 2));
        assert_eq!(stats.waiting_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_when_exhausted() {
        let factory = MockFactory::new();
        let pool = pool_with(&factory, config(1, 1));
        pool.initialize().await.unwrap();
        let _held = pool.acquire_connection().await.unwrap();

        let started = Instant::now();
        let err = pool.acquire_connection().await.unwrap_err();
        assert!(matches!(err, BrokerError::AcquireTimeout { timeout_ms: 1_000, .. }));
        assert!(started.elapsed() >= Duration::from_millis(1_000));
        assert!(started.elapsed() < Duration::from_millis(1_200));
        assert_eq!(pool.stats().acquire_timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_skips_in_use() {
        let factory = MockFactory::new();
        let pool = pool_with(&factory, config(0, 2));
        pool.add_connection().await.unwrap();
        pool.add_connection().await.unwrap();
        let held = pool.acquire_connection().await.unwrap();

        tokio::time::advance(Duration::from_millis(6_000)).await;
        assert_eq!(pool.evict_idle().await, 1);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.connections()[0].id, held.id());
    }

    #[tokio::test]
    async fn test_dispose_closes_pool() {
        let factory = MockFactory::new();
        let pool = pool_with(&factory, config(2, 2));
        pool.initialize().await.unwrap();
        let _held = pool.acquire_connection().await.unwrap();

        pool.dispose().await;
        assert_eq!(pool.size(), 0);
        assert!(pool.is_closed());
        assert_eq!(factory.control().disconnects(), 2);
        let err = pool.acquire_connection().await.unwrap_err();
        assert_eq!(err.code(), "NOT_INITIALIZED");
    }
}
