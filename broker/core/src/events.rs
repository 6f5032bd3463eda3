//! Broker Events
//!
//! Lifecycle, health and scheduling events published to UI and telemetry
//! consumers. The wire name of each event (see [`BrokerEvent::name`]) and its
//! JSON payload shape are a stable contract.
//!
//! Events are fanned out over a `tokio::sync::broadcast` channel. Publishing
//! never blocks and never fails; a subscriber that falls behind sees
//! `RecvError::Lagged` and skips ahead.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::health::{HealthRecord, ResourceUsage};
use crate::queue::{Priority, RequestId, TaskId};
use crate::state::ConnectionState;

// ============================================================================
// Event Types
// ============================================================================

/// An event emitted by the broker core
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum BrokerEvent {
    /// A provider pool was created and brought up to `min_size`
    #[serde(rename_all = "camelCase")]
    ProviderInitialized {
        /// Provider identifier
        provider_id: String,
        /// Provider type handed to the factory
        provider_type: String,
        /// Connections opened during initialization
        connections: usize,
    },

    /// A provider pool was disposed and forgotten
    #[serde(rename_all = "camelCase")]
    ProviderRemoved {
        /// Provider identifier
        provider_id: String,
    },

    /// The provider-level connection state changed
    #[serde(rename_all = "camelCase")]
    StateChanged {
        /// Provider identifier
        provider_id: String,
        /// State before the transition
        previous: ConnectionState,
        /// State after the transition
        current: ConnectionState,
        /// When the transition happened
        timestamp: DateTime<Utc>,
        /// Failure that caused the transition
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Model the provider serves
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },

    /// Companion of `StateChanged`, named after the state that was entered
    #[serde(rename_all = "camelCase")]
    StateEntered {
        /// Provider identifier
        provider_id: String,
        /// State that was entered
        state: ConnectionState,
        /// When the transition happened
        timestamp: DateTime<Utc>,
    },

    /// A connection joined a pool
    #[serde(rename_all = "camelCase")]
    ConnectionAdded {
        /// Provider identifier
        provider_id: String,
        /// Connection identifier
        connection_id: String,
    },

    /// A connection left a pool
    #[serde(rename_all = "camelCase")]
    ConnectionRemoved {
        /// Provider identifier
        provider_id: String,
        /// Connection identifier
        connection_id: String,
    },

    /// A periodic health probe completed
    #[serde(rename_all = "camelCase")]
    HealthCheck {
        /// Provider identifier
        provider_id: String,
        /// Probe result
        record: HealthRecord,
    },

    /// A probe reported the provider unhealthy
    #[serde(rename_all = "camelCase")]
    HealthWarning {
        /// Provider identifier
        provider_id: String,
        /// Probe result
        record: HealthRecord,
        /// Consecutive unhealthy probes
        warning_count: u32,
    },

    /// Consecutive unhealthy probes crossed the warning threshold
    #[serde(rename_all = "camelCase")]
    HealthCritical {
        /// Provider identifier
        provider_id: String,
        /// Probe result
        record: HealthRecord,
        /// Consecutive unhealthy probes
        warning_count: u32,
    },

    /// A healthy probe followed one or more unhealthy ones
    #[serde(rename_all = "camelCase")]
    HealthRecovered {
        /// Provider identifier
        provider_id: String,
        /// Probe result
        record: HealthRecord,
    },

    /// A monitored host process exceeded a resource threshold
    #[serde(rename_all = "camelCase")]
    HostWarning {
        /// Monitored process
        target: String,
        /// Sampled resource usage
        usage: ResourceUsage,
    },

    /// A monitored host process stayed over threshold for the sustained period
    #[serde(rename_all = "camelCase")]
    HostCritical {
        /// Monitored process
        target: String,
        /// Sampled resource usage
        usage: ResourceUsage,
        /// Time spent over threshold (ms)
        sustained_ms: u64,
    },

    /// A request entered the queue
    #[serde(rename_all = "camelCase")]
    QueueEnqueued {
        /// Request identifier
        request_id: RequestId,
        /// Priority tier of the request
        priority: Priority,
        /// Requests queued after the insert
        queue_length: usize,
    },

    /// A queued request was removed before it was dequeued
    #[serde(rename_all = "camelCase")]
    QueueRemoved {
        /// Request identifier
        request_id: RequestId,
        /// Priority tier of the request
        priority: Priority,
    },

    /// A queued request expired
    #[serde(rename_all = "camelCase")]
    QueueTimeout {
        /// Request identifier
        request_id: RequestId,
        /// Priority tier of the request
        priority: Priority,
        /// Time spent queued (ms)
        waited_ms: u64,
    },

    /// An execution-queue task began running
    #[serde(rename_all = "camelCase")]
    TaskStarted {
        /// Task identifier
        task_id: TaskId,
    },

    /// An execution-queue task finished successfully
    #[serde(rename_all = "camelCase")]
    TaskCompleted {
        /// Task identifier
        task_id: TaskId,
        /// Run time (ms)
        duration_ms: u64,
    },

    /// An execution-queue task returned an error
    #[serde(rename_all = "camelCase")]
    TaskFailed {
        /// Task identifier
        task_id: TaskId,
        /// Error the task returned
        error: String,
    },

    /// An execution-queue task was cancelled or timed out
    #[serde(rename_all = "camelCase")]
    TaskAborted {
        /// Task identifier
        task_id: TaskId,
        /// Why the task was stopped
        reason: String,
    },
}

impl BrokerEvent {
    /// Wire name of the event
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProviderInitialized { .. } => "providerInitialized",
            Self::ProviderRemoved { .. } => "providerRemoved",
            Self::StateChanged { .. } => "stateChanged",
            Self::StateEntered { state, .. } => state.as_str(),
            Self::ConnectionAdded { .. } => "connectionAdded",
            Self::ConnectionRemoved { .. } => "connectionRemoved",
            Self::HealthCheck { .. } => "healthCheck",
            Self::HealthWarning { .. } => "healthWarning",
            Self::HealthCritical { .. } => "healthCritical",
            Self::HealthRecovered { .. } => "healthRecovered",
            Self::HostWarning { .. } => "hostWarning",
            Self::HostCritical { .. } => "hostCritical",
            Self::QueueEnqueued { .. } => "queueEnqueued",
            Self::QueueRemoved { .. } => "queueRemoved",
            Self::QueueTimeout { .. } => "queueTimeout",
            Self::TaskStarted { .. } => "taskStarted",
            Self::TaskCompleted { .. } => "taskCompleted",
            Self::TaskFailed { .. } => "taskFailed",
            Self::TaskAborted { .. } => "taskAborted",
        }
    }

    /// Provider the event concerns, if any
    #[must_use]
    pub fn provider_id(&self) -> Option<&str> {
        match self {
            Self::ProviderInitialized { provider_id, .. }
            | Self::ProviderRemoved { provider_id }
            | Self::StateChanged { provider_id, .. }
            | Self::StateEntered { provider_id, .. }
            | Self::ConnectionAdded { provider_id, .. }
            | Self::ConnectionRemoved { provider_id, .. }
            | Self::HealthCheck { provider_id, .. }
            | Self::HealthWarning { provider_id, .. }
            | Self::HealthCritical { provider_id, .. }
            | Self::HealthRecovered { provider_id, .. } => Some(provider_id),
            _ => None,
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Fan-out channel for [`BrokerEvent`]s
#[derive(Clone, Debug)]
pub struct EventBus {
    events: broadcast::Sender<BrokerEvent>,
}

impl EventBus {
    /// Default broadcast capacity
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// Create a bus with the default capacity
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Create a bus with a custom capacity
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self { events }
    }

    /// Publish an event to all current subscribers
    pub fn emit(&self, event: BrokerEvent) {
        tracing::trace!(event = event.name(), "Broker event");
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    /// Subscribe to events published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
