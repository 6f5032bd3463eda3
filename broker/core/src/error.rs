//! Broker Error Taxonomy
//!
//! Every failure the core surfaces to callers is a [`BrokerError`]. Each
//! variant maps to a stable string code (see [`BrokerError::code`]) so that
//! operators can tell "backend down" from "pool exhausted" from "caller
//! misconfigured a timeout" without parsing messages.
//!
//! Transport-level failures coming out of a provider are first normalised
//! into a [`ConnectionError`] carrying an [`ErrorCode`]; only the codes in
//! the retry allow-list are retried by the error handler.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::Priority;

// ============================================================================
// Error Codes
// ============================================================================

/// Stable classification of a connection-level failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Connection refused, reset, DNS failure and similar
    NetworkError,
    /// The backend did not answer in time
    Timeout,
    /// The backend asked us to slow down (HTTP 429)
    RateLimited,
    /// The backend is temporarily unavailable (HTTP 502/503/504)
    ServiceUnavailable,
    /// Credentials were rejected (HTTP 401/403)
    AuthenticationFailed,
    /// The request itself was rejected (other HTTP 4xx)
    InvalidRequest,
    /// The requested model does not exist on the backend
    ModelNotFound,
    /// Anything we could not classify
    Unknown,
}

impl ErrorCode {
    /// Codes the error handler is allowed to retry
    pub const RETRYABLE: [ErrorCode; 4] = [
        ErrorCode::NetworkError,
        ErrorCode::Timeout,
        ErrorCode::RateLimited,
        ErrorCode::ServiceUnavailable,
    ];

    /// Stable string form of the code
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkError => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::RateLimited => "RATE_LIMITED",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::ModelNotFound => "MODEL_NOT_FOUND",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Whether a failure with this code may be retried
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        Self::RETRYABLE.contains(self)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Connection Error
// ============================================================================

/// A normalised provider failure with a stable code
#[derive(Debug, Error)]
#[error("[{code}] {message}")]
pub struct ConnectionError {
    /// Classification used for retry decisions
    pub code: ErrorCode,
    /// Human-readable description
    pub message: String,
    /// Provider the failure originated from (if known)
    pub provider_id: Option<String>,
    /// Underlying cause
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl ConnectionError {
    /// Create a new connection error without an underlying cause
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            provider_id: None,
            source: None,
        }
    }

    /// Attach the originating provider
    #[must_use]
    pub fn with_provider(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }

    /// Attach the underlying cause
    #[must_use]
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Whether the error handler may retry this failure
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

// ============================================================================
// Broker Error
// ============================================================================

/// Errors surfaced by the pool, queue and provider manager
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The provider has no pool (never initialised or already disposed)
    #[error("provider '{provider_id}' is not initialized")]
    NotInitialized {
        /// Provider identifier
        provider_id: String,
    },

    /// `initialize_provider` was called twice without removal in between
    #[error("provider '{provider_id}' is already initialized")]
    AlreadyInitialized {
        /// Provider identifier
        provider_id: String,
    },

    /// The pool is at `max_size` and cannot admit another connection
    #[error("connection pool for '{provider_id}' is full ({max_size} connections)")]
    PoolFull {
        /// Provider identifier
        provider_id: String,
        /// Configured pool capacity
        max_size: usize,
    },

    /// Creating, connecting or health-checking a new connection failed
    #[error("failed to establish connection to '{provider_id}': {source}")]
    ConnectionFailed {
        /// Provider identifier
        provider_id: String,
        /// Underlying failure
        #[source]
        source: ConnectionError,
    },

    /// No healthy idle connection became available within `acquire_timeout`
    #[error("timed out after {timeout_ms}ms waiting for a connection to '{provider_id}'")]
    AcquireTimeout {
        /// Provider identifier
        provider_id: String,
        /// Configured acquire timeout
        timeout_ms: u64,
    },

    /// The provider is not in a state that accepts requests
    #[error("provider '{provider_id}' is not active")]
    ProviderNotActive {
        /// Provider identifier
        provider_id: String,
    },

    /// The request queue reached its global capacity
    #[error("request queue is full ({max_size} requests)")]
    QueueFull {
        /// Global queue capacity
        max_size: usize,
    },

    /// A single priority tier reached its capacity
    #[error("{priority} priority queue is full ({max_size} requests)")]
    PriorityQueueFull {
        /// Tier that rejected the request
        priority: Priority,
        /// Tier capacity
        max_size: usize,
    },

    /// A queued request waited longer than the queue timeout
    #[error("request {request_id} timed out after {waited_ms}ms in the queue")]
    QueueTimeout {
        /// Request identifier
        request_id: String,
        /// Time spent queued
        waited_ms: u64,
    },

    /// A transient failure kept recurring until the retry budget ran out
    #[error("request to '{provider_id}' failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Provider identifier
        provider_id: String,
        /// Number of attempts made
        attempts: u32,
        /// Last failure observed
        #[source]
        source: ConnectionError,
    },

    /// A non-retryable provider failure
    #[error("request to '{provider_id}' failed: {source}")]
    Connection {
        /// Provider identifier
        provider_id: String,
        /// Classified failure
        #[source]
        source: ConnectionError,
    },

    /// The request was cancelled before it completed
    #[error("request {request_id} was cancelled: {reason}")]
    Cancelled {
        /// Request identifier
        request_id: String,
        /// Why it was cancelled
        reason: String,
    },

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Catch-all wrapping the original cause
    #[error(transparent)]
    Unknown(#[from] anyhow::Error),
}

impl BrokerError {
    /// Stable error code for operators and telemetry
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotInitialized { .. } => "NOT_INITIALIZED",
            Self::AlreadyInitialized { .. } => "ALREADY_INITIALIZED",
            Self::PoolFull { .. } => "POOL_FULL",
            Self::ConnectionFailed { .. } => "CONNECTION_FAILED",
            Self::AcquireTimeout { .. } => "ACQUIRE_TIMEOUT",
            Self::ProviderNotActive { .. } => "PROVIDER_NOT_ACTIVE",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::PriorityQueueFull { .. } => "PRIORITY_QUEUE_FULL",
            Self::QueueTimeout { .. } => "QUEUE_TIMEOUT",
            Self::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            Self::Connection { source, .. } => source.code.as_str(),
            Self::Cancelled { .. } => "CANCELLED",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::Unknown(_) => "UNKNOWN",
        }
    }

    /// Provider the error concerns, if any
    #[must_use]
    pub fn provider_id(&self) -> Option<&str> {
        match self {
            Self::NotInitialized { provider_id }
            | Self::AlreadyInitialized { provider_id }
            | Self::PoolFull { provider_id, .. }
            | Self::ConnectionFailed { provider_id, .. }
            | Self::AcquireTimeout { provider_id, .. }
            | Self::ProviderNotActive { provider_id }
            | Self::RetriesExhausted { provider_id, .. }
            | Self::Connection { provider_id, .. } => Some(provider_id),
            _ => None,
        }
    }

    /// Capacity errors are caller-visible backpressure and never retried
    #[must_use]
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            Self::PoolFull { .. }
                | Self::AcquireTimeout { .. }
                | Self::QueueFull { .. }
                | Self::PriorityQueueFull { .. }
        )
    }
}
