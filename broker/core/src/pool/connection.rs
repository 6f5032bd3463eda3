//! Pooled connections and leases.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::health::HealthRecord;
use crate::provider::Provider;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a pooled connection, unique within the process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One live provider handle owned by a pool
pub(crate) struct PooledConnection {
    pub(crate) id: ConnectionId,
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) created_at: Instant,
    pub(crate) last_used_at: Instant,
    pub(crate) in_use: bool,
    /// Being disposed; invisible to acquisition
    pub(crate) closing: bool,
    pub(crate) health: HealthRecord,
    pub(crate) requests_handled: u64,
}

impl PooledConnection {
    pub(crate) fn new(provider: Arc<dyn Provider>, health: HealthRecord, in_use: bool) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::next(),
            provider,
            created_at: now,
            last_used_at: now,
            in_use,
            closing: false,
            health,
            requests_handled: 0,
        }
    }

    /// Free for a new holder
    pub(crate) fn is_available(&self) -> bool {
        !self.in_use && !self.closing && self.health.is_healthy
    }

    /// Idle past `idle_timeout` and not held
    pub(crate) fn is_idle_expired(&self, idle_timeout: Duration, now: Instant) -> bool {
        !self.in_use && !self.closing && now.duration_since(self.last_used_at) > idle_timeout
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            in_use: self.in_use,
            closing: self.closing,
            healthy: self.health.is_healthy,
            idle_for: self.last_used_at.elapsed(),
            age: self.created_at.elapsed(),
            requests_handled: self.requests_handled,
        }
    }
}

/// Read-only view of a pooled connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Connection identifier
    pub id: ConnectionId,
    /// Held by a caller
    pub in_use: bool,
    /// Being disposed
    pub closing: bool,
    /// Last recorded health
    pub healthy: bool,
    /// Time since last release
    pub idle_for: Duration,
    /// Time since creation
    pub age: Duration,
    /// Completed holds
    pub requests_handled: u64,
}

/// Exclusive hold on a pooled connection.
///
/// Give it back with `release_connection`. A lease dropped without release
/// is returned through the pool's return channel and released on the
/// pool's next acquisition or maintenance pass.
pub struct ConnectionLease {
    id: ConnectionId,
    provider_id: Arc<str>,
    provider: Arc<dyn Provider>,
    return_tx: Option<mpsc::UnboundedSender<ConnectionId>>,
}

impl ConnectionLease {
    pub(crate) fn new(
        id: ConnectionId,
        provider_id: Arc<str>,
        provider: Arc<dyn Provider>,
        return_tx: mpsc::UnboundedSender<ConnectionId>,
    ) -> Self {
        Self {
            id,
            provider_id,
            provider,
            return_tx: Some(return_tx),
        }
    }

    /// Connection identifier
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Provider the connection belongs to
    #[must_use]
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// The live provider handle
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Disarm the drop-return; the caller releases explicitly
    pub(crate) fn into_id(mut self) -> ConnectionId {
        self.return_tx = None;
        self.id
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("id", &self.id)
            .field("provider_id", &self.provider_id)
            .finish_non_exhaustive()
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if let Some(tx) = self.return_tx.take() {
            // Pool gone: nothing to return to
            let _ = tx.send(self.id);
        }
    }
}
