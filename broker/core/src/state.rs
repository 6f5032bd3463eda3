//! Provider Connection State Machine
//!
//! Tracks the provider-level connection state, distinct from the health of
//! individual pooled connections. Transitions are validated against a fixed
//! adjacency table:
//!
//! ```text
//! disconnected -> connecting | error
//! connecting   -> connected | error | reconnecting
//! connected    -> disconnected | error
//! error        -> reconnecting | disconnected
//! reconnecting -> connected | error | disconnected
//! ```
//!
//! The transitional states (`connecting`, `reconnecting`) are guarded by a
//! timer. If the machine is still in the same state when the timer fires it
//! is forced into `error` with a `TIMEOUT` error.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::config::StateTimeouts;
use crate::error::ErrorCode;
use crate::events::{BrokerEvent, EventBus};

// ============================================================================
// States
// ============================================================================

/// Provider-level connection state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Initial state, nothing is open
    #[default]
    Disconnected,
    /// Pool is being brought up
    Connecting,
    /// Pool is up and serving requests
    Connected,
    /// Something went wrong; requests are refused
    Error,
    /// Pool is being rebuilt after an error
    Reconnecting,
}

impl ConnectionState {
    /// Lowercase wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Reconnecting => "reconnecting",
        }
    }

    /// States reachable from this one
    #[must_use]
    pub fn allowed_transitions(&self) -> &'static [ConnectionState] {
        use ConnectionState::{Connected, Connecting, Disconnected, Error, Reconnecting};
        match self {
            Disconnected => &[Connecting, Error],
            Connecting => &[Connected, Error, Reconnecting],
            Connected => &[Disconnected, Error],
            Error => &[Reconnecting, Disconnected],
            Reconnecting => &[Connected, Error, Disconnected],
        }
    }

    /// Whether `self -> next` is a legal transition
    #[must_use]
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        self.allowed_transitions().contains(&next)
    }

    /// Whether the state carries a timeout
    #[must_use]
    pub fn is_transitional(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error recorded alongside a transition
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateError {
    /// Classification of the failure
    pub code: ErrorCode,
    /// Human-readable description
    pub message: String,
}

impl StateError {
    /// Create a state error
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Optional metadata attached to a transition
#[derive(Clone, Debug, Default)]
pub struct TransitionMeta {
    /// Error that triggered the transition
    pub error: Option<StateError>,
    /// Model the provider is serving
    pub model: Option<String>,
}

impl TransitionMeta {
    /// Metadata carrying an error
    #[must_use]
    pub fn error(error: StateError) -> Self {
        Self {
            error: Some(error),
            model: None,
        }
    }

    /// Metadata carrying a model name
    #[must_use]
    pub fn model(model: impl Into<String>) -> Self {
        Self {
            error: None,
            model: Some(model.into()),
        }
    }
}

/// Point-in-time view of a state machine
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StateSnapshot {
    /// Current state
    pub state: ConnectionState,
    /// State before the last transition
    pub previous: Option<ConnectionState>,
    /// When the last transition happened
    pub changed_at: DateTime<Utc>,
    /// Error recorded by the last transition that carried one
    pub last_error: Option<StateError>,
    /// Model recorded by the last transition that carried one
    pub model: Option<String>,
}

// ============================================================================
// State Machine
// ============================================================================

struct StateInner {
    current: ConnectionState,
    previous: Option<ConnectionState>,
    changed_at: DateTime<Utc>,
    last_error: Option<StateError>,
    model: Option<String>,
    /// Bumped on every transition so stale timers can tell they lost
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct Shared {
    provider_id: String,
    timeouts: StateTimeouts,
    events: EventBus,
    inner: Mutex<StateInner>,
}

/// Validates, timestamps and publishes provider state transitions
#[derive(Clone)]
pub struct ConnectionStateMachine {
    shared: Arc<Shared>,
}

impl ConnectionStateMachine {
    /// Create a machine in `disconnected`
    #[must_use]
    pub fn new(provider_id: impl Into<String>, timeouts: StateTimeouts, events: EventBus) -> Self {
        Self {
            shared: Arc::new(Shared {
                provider_id: provider_id.into(),
                timeouts,
                events,
                inner: Mutex::new(StateInner {
                    current: ConnectionState::Disconnected,
                    previous: None,
                    changed_at: Utc::now(),
                    last_error: None,
                    model: None,
                    generation: 0,
                    timer: None,
                }),
            }),
        }
    }

    /// Provider this machine belongs to
    #[must_use]
    pub fn provider_id(&self) -> &str {
        &self.shared.provider_id
    }

    /// Current state
    #[must_use]
    pub fn current(&self) -> ConnectionState {
        self.shared.inner.lock().current
    }

    /// Whether the provider accepts requests
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.current() == ConnectionState::Connected
    }

    /// Full view of the machine
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.shared.inner.lock();
        StateSnapshot {
            state: inner.current,
            previous: inner.previous,
            changed_at: inner.changed_at,
            last_error: inner.last_error.clone(),
            model: inner.model.clone(),
        }
    }

    /// Transition without metadata
    pub fn transition_to(&self, next: ConnectionState) -> bool {
        self.transition_with(next, TransitionMeta::default())
    }

    /// Attempt a transition.
    ///
    /// Returns `false` (and leaves the state untouched) when the transition is
    /// not in the adjacency table.
    pub fn transition_with(&self, next: ConnectionState, meta: TransitionMeta) -> bool {
        Shared::apply(&self.shared, next, meta, None)
    }

    /// Force the machine back to `disconnected` regardless of the table
    pub fn reset(&self) {
        let changed = {
            let mut inner = self.shared.inner.lock();
            if let Some(timer) = inner.timer.take() {
                timer.abort();
            }
            inner.generation += 1;
            let previous = inner.current;
            inner.last_error = None;
            if previous == ConnectionState::Disconnected {
                None
            } else {
                inner.previous = Some(previous);
                inner.current = ConnectionState::Disconnected;
                inner.changed_at = Utc::now();
                Some((previous, inner.changed_at))
            }
        };

        if let Some((previous, timestamp)) = changed {
            tracing::info!(
                provider_id = %self.shared.provider_id,
                from = %previous,
                "Connection state reset"
            );
            self.shared
                .publish(previous, ConnectionState::Disconnected, timestamp, &TransitionMeta::default());
        }
    }
}

impl Shared {
    /// Apply a transition. `expected` makes the call conditional on the
    /// generation a timer was armed for.
    fn apply(
        this: &Arc<Self>,
        next: ConnectionState,
        meta: TransitionMeta,
        expected: Option<u64>,
    ) -> bool {
        let (previous, timestamp) = {
            let mut inner = this.inner.lock();
            if let Some(generation) = expected {
                if inner.generation != generation {
                    return false;
                }
            }

            let current = inner.current;
            if !current.can_transition_to(next) {
                drop(inner);
                tracing::warn!(
                    provider_id = %this.provider_id,
                    from = %current,
                    to = %next,
                    "Rejected illegal state transition"
                );
                return false;
            }

            if let Some(timer) = inner.timer.take() {
                timer.abort();
            }
            inner.generation += 1;
            inner.previous = Some(current);
            inner.current = next;
            inner.changed_at = Utc::now();
            if meta.error.is_some() {
                inner.last_error.clone_from(&meta.error);
            }
            if meta.model.is_some() {
                inner.model.clone_from(&meta.model);
            }

            if let Some(timeout) = this.timeout_for(next) {
                inner.timer = Self::arm_timer(this, next, inner.generation, timeout);
            }
            (current, inner.changed_at)
        };

        tracing::info!(
            provider_id = %this.provider_id,
            from = %previous,
            to = %next,
            "Connection state changed"
        );
        this.publish(previous, next, timestamp, &meta);
        true
    }

    fn publish(
        &self,
        previous: ConnectionState,
        current: ConnectionState,
        timestamp: DateTime<Utc>,
        meta: &TransitionMeta,
    ) {
        self.events.emit(BrokerEvent::StateChanged {
            provider_id: self.provider_id.clone(),
            previous,
            current,
            timestamp,
            error: meta.error.as_ref().map(ToString::to_string),
            model: meta.model.clone(),
        });
        self.events.emit(BrokerEvent::StateEntered {
            provider_id: self.provider_id.clone(),
            state: current,
            timestamp,
        });
    }

    fn timeout_for(&self, state: ConnectionState) -> Option<Duration> {
        let ms = match state {
            ConnectionState::Connecting => self.timeouts.connecting_ms,
            ConnectionState::Reconnecting => self.timeouts.reconnecting_ms,
            _ => return None,
        };
        (ms > 0).then(|| Duration::from_millis(ms))
    }

    fn arm_timer(
        this: &Arc<Self>,
        state: ConnectionState,
        generation: u64,
        timeout: Duration,
    ) -> Option<JoinHandle<()>> {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(
                provider_id = %this.provider_id,
                state = %state,
                "No runtime available, state timeout not armed"
            );
            return None;
        };

        let weak: Weak<Self> = Arc::downgrade(this);
        Some(handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let error = StateError::new(
                ErrorCode::Timeout,
                format!(
                    "state '{state}' timed out after {}ms",
                    timeout.as_millis()
                ),
            );
            if Self::apply(
                &shared,
                ConnectionState::Error,
                TransitionMeta::error(error),
                Some(generation),
            ) {
                tracing::warn!(
                    provider_id = %shared.provider_id,
                    state = %state,
                    "Transitional state timed out"
                );
            }
        }))
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(timer) = self.inner.get_mut().timer.take() {
            timer.abort();
        }
    }
}
