//! Connection Pooling
//!
//! Bounded per-provider pools of live provider handles.
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |   PoolRegistry   |  <-- one pool per provider id, maintenance task
//! +--------+---------+
//!          |
//!    +-----+-----+
//!    |           |
//!    v           v
//! +--------+ +--------+
//! |  Pool  | |  Pool  |  <-- admission, release, eviction, replenishment
//! +---+----+ +---+----+
//!     |          |
//!     v          v
//!  PooledConnection ...  <-- exclusive owner of one `Arc<dyn Provider>`
//! ```
//!
//! Callers hold a [`ConnectionLease`] for the duration of one call and hand
//! it back with [`ConnectionPool::release_connection`].

mod connection;
mod connection_pool;
mod registry;

pub use connection::{ConnectionId, ConnectionInfo, ConnectionLease};
pub use connection_pool::{ConnectionPool, MaintenanceReport, PoolStats, ReleaseOutcome};
pub use registry::PoolRegistry;
