//! Broker Core - Connection Pooling and Request Scheduling for LLM Backends
//!
//! This crate brokers access to one or more LLM backends behind a uniform
//! provider abstraction. It manages bounded pools of live backend
//! connections under concurrent demand: admitting callers, enforcing
//! capacity, recovering unhealthy connections, retrying transient failures
//! with backoff and reclaiming idle capacity.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        ProviderManager                            │
//! │   acquire / execute / release        schedule / cancel            │
//! └──────┬───────────────┬───────────────────┬──────────────┬────────┘
//!        │               │                   │              │
//!        v               v                   v              v
//! ┌─────────────┐ ┌─────────────┐ ┌───────────────────┐ ┌──────────────┐
//! │ PoolRegistry│ │ErrorHandler │ │ RequestQueue      │ │ State        │
//! │ + maintenance│ │ (backoff)   │ │ high/normal/low   │ │ Machines     │
//! └──────┬──────┘ └─────────────┘ │ ExecutionQueue    │ └──────┬───────┘
//!        │                        └───────────────────┘        │
//!        v                                                     v
//! ┌─────────────┐        ┌─────────────────────┐      ┌──────────────────┐
//! │ConnectionPool│──────>│ Provider (factory)  │<─────│ Health Monitors  │
//! │ per provider │       │ Ollama, ...         │      │ provider / host  │
//! └─────────────┘        └─────────────────────┘      └──────────────────┘
//! ```
//!
//! Every component publishes [`BrokerEvent`]s on one [`EventBus`]; the event
//! names and payloads are the wire contract for UI and telemetry consumers.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use broker_core::{
//!     BrokerConfig, BrokerMetrics, CompletionRequest, DefaultProviderFactory,
//!     ProviderConfig, ProviderManager,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BrokerConfig::default();
//!     let manager = ProviderManager::new(
//!         config.clone(),
//!         Arc::new(DefaultProviderFactory),
//!         Arc::new(BrokerMetrics::new()),
//!     );
//!
//!     manager
//!         .initialize_provider("ollama-default", "ollama", ProviderConfig::ollama_from_env(), config.pool)
//!         .await?;
//!
//!     let response = manager
//!         .generate_completion("ollama-default", &CompletionRequest::new("Hello"))
//!         .await?;
//!     println!("{}", response.content);
//!
//!     manager.dispose().await;
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`pool`]: per-provider connection pools and their maintenance task
//! - [`queue`]: priority request queue and cancellable task runner
//! - [`state`]: provider connection state machine
//! - [`health`]: health records, provider prober, host resource monitor
//! - [`retry`]: error classification and exponential backoff
//! - [`manager`]: the root orchestrator
//! - [`provider`]: provider traits and the Ollama implementation
//! - [`metrics`]: metrics sink trait and in-memory implementation
//! - [`events`]: broker events and the event bus
//! - [`config`]: configuration loading
//!
//! The library never installs a tracing subscriber; binaries do.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod provider;
pub mod queue;
pub mod retry;
pub mod state;

#[cfg(test)]
pub mod test_utils;

pub use config::{
    default_config_path, load_config, load_config_from_path, BrokerConfig, ConfigError,
    ConfigSource, ExecutionConfig, HealthConfig, HostMonitorConfig, PoolConfig, PriorityLimits,
    ProviderEntry, QueueConfig, RetryConfig, StateTimeouts,
};
pub use error::{BrokerError, ConnectionError, ErrorCode};
pub use events::{BrokerEvent, EventBus};
pub use health::{
    HealthLevel, HealthProbe, HealthRecord, HostLevel, HostMonitor, ProcessSampler,
    ProviderHealth, ProviderHealthMonitor, ResourceSampler, ResourceUsage,
};
pub use manager::{ProviderManager, ScheduledRequest};
pub use metrics::{BrokerMetrics, MetricsSink, NoopMetrics};
pub use pool::{
    ConnectionId, ConnectionInfo, ConnectionLease, ConnectionPool, MaintenanceReport, PoolRegistry,
    PoolStats, ReleaseOutcome,
};
pub use provider::{
    CompletionRequest, CompletionResponse, DefaultProviderFactory, HttpStatusError, ModelInfo,
    OllamaProvider, Provider, ProviderConfig, ProviderFactory, StreamingToken,
};
pub use queue::{
    ExecutionQueue, Priority, QueueStats, QueuedRequest, RequestId, RequestQueue, TaskHandle,
    TaskId,
};
pub use retry::ErrorHandler;
pub use state::{ConnectionState, ConnectionStateMachine, StateError, StateSnapshot, TransitionMeta};
