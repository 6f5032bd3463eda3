//! Periodic provider health probing.
//!
//! The monitor follows `stateChanged` events on the bus: entering
//! `connected` starts a repeating probe for that provider, leaving it stops
//! the probe immediately.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::HealthRecord;
use crate::config::HealthConfig;
use crate::events::{BrokerEvent, EventBus};
use crate::state::ConnectionState;

/// Runs a single health probe against a provider
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe the provider. Failures are reported as unhealthy records.
    async fn probe(&self, provider_id: &str) -> HealthRecord;
}

/// Severity derived from consecutive probe results
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    /// Last probe passed
    #[default]
    Healthy,
    /// Recent probes failed, below the threshold
    Warning,
    /// Failures reached the warning threshold
    Critical,
}

/// Health as tracked by the periodic prober
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealth {
    /// Last probe result
    pub record: HealthRecord,
    /// Consecutive unhealthy probes
    pub warning_count: u32,
    /// Severity
    pub level: HealthLevel,
}

/// Periodic prober driven by provider state changes
pub struct ProviderHealthMonitor {
    config: HealthConfig,
    events: EventBus,
    probe: Arc<dyn HealthProbe>,
    health: DashMap<String, ProviderHealth>,
    probes: Mutex<HashMap<String, JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl ProviderHealthMonitor {
    /// Create a monitor; nothing runs until [`start`](Self::start)
    #[must_use]
    pub fn new(config: HealthConfig, events: EventBus, probe: Arc<dyn HealthProbe>) -> Arc<Self> {
        Arc::new(Self {
            config,
            events,
            probe,
            health: DashMap::new(),
            probes: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Start following state changes on the event bus
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.events.subscribe();
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = rx.recv() => event,
                };
                let Some(monitor) = weak.upgrade() else { break };

                match event {
                    Ok(BrokerEvent::StateChanged {
                        provider_id,
                        current,
                        ..
                    }) => {
                        if current == ConnectionState::Connected {
                            monitor.start_probing(&provider_id);
                        } else {
                            monitor.stop_probing(&provider_id);
                        }
                    }
                    Ok(BrokerEvent::ProviderRemoved { provider_id }) => {
                        monitor.stop_probing(&provider_id);
                        monitor.health.remove(&provider_id);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Health monitor lagged behind the event bus");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::debug!("Health monitor stopped");
        })
    }

    /// Begin probing a provider every `check_interval_ms`
    pub fn start_probing(self: &Arc<Self>, provider_id: &str) {
        let mut probes = self.probes.lock();
        if probes.get(provider_id).is_some_and(|h| !h.is_finished()) {
            return;
        }

        let interval = Duration::from_millis(self.config.check_interval_ms.max(1));
        let timeout = Duration::from_millis(self.config.probe_timeout_ms.max(1));
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let id = provider_id.to_string();

        tracing::debug!(provider_id = %id, interval_ms = interval.as_millis() as u64, "Starting health probe");
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(monitor) = weak.upgrade() else { break };
                let record = match tokio::time::timeout(timeout, monitor.probe.probe(&id)).await {
                    Ok(record) => record,
                    Err(_) => HealthRecord::unhealthy(format!(
                        "health probe timed out after {}ms",
                        timeout.as_millis()
                    )),
                };
                monitor.record_result(&id, record);
            }
        });
        probes.insert(provider_id.to_string(), handle);
    }

    /// Stop probing a provider
    pub fn stop_probing(&self, provider_id: &str) {
        if let Some(handle) = self.probes.lock().remove(provider_id) {
            handle.abort();
            tracing::debug!(provider_id = %provider_id, "Stopped health probe");
        }
    }

    /// Whether a probe task is active for the provider
    #[must_use]
    pub fn is_probing(&self, provider_id: &str) -> bool {
        self.probes
            .lock()
            .get(provider_id)
            .is_some_and(|h| !h.is_finished())
    }

    /// Fold a probe result into the provider's health and publish it
    pub fn record_result(&self, provider_id: &str, mut record: HealthRecord) -> HealthLevel {
        let threshold = self.config.warning_threshold.max(1);
        let (level, warning_count, recovered) = {
            let mut entry = self
                .health
                .entry(provider_id.to_string())
                .or_insert_with(|| ProviderHealth {
                    record: HealthRecord::default(),
                    warning_count: 0,
                    level: HealthLevel::Healthy,
                });

            let errors_so_far = entry.record.error_count;
            let recovered = record.is_healthy && entry.warning_count > 0;
            if record.is_healthy {
                entry.warning_count = 0;
                entry.level = HealthLevel::Healthy;
                record.error_count = errors_so_far;
            } else {
                entry.warning_count += 1;
                record.error_count = errors_so_far + 1;
                entry.level = if entry.warning_count >= threshold {
                    HealthLevel::Critical
                } else {
                    HealthLevel::Warning
                };
            }
            entry.record = record.clone();
            (entry.level, entry.warning_count, recovered)
        };

        self.events.emit(BrokerEvent::HealthCheck {
            provider_id: provider_id.to_string(),
            record: record.clone(),
        });

        match level {
            HealthLevel::Healthy if recovered => {
                tracing::info!(provider_id = %provider_id, "Provider health recovered");
                self.events.emit(BrokerEvent::HealthRecovered {
                    provider_id: provider_id.to_string(),
                    record,
                });
            }
            HealthLevel::Healthy => {}
            HealthLevel::Warning => {
                tracing::warn!(
                    provider_id = %provider_id,
                    warning_count,
                    error = record.last_error.as_deref().unwrap_or("unhealthy"),
                    "Provider health warning"
                );
                self.events.emit(BrokerEvent::HealthWarning {
                    provider_id: provider_id.to_string(),
                    record,
                    warning_count,
                });
            }
            HealthLevel::Critical => {
                tracing::error!(
                    provider_id = %provider_id,
                    warning_count,
                    error = record.last_error.as_deref().unwrap_or("unhealthy"),
                    "Provider health critical"
                );
                self.events.emit(BrokerEvent::HealthCritical {
                    provider_id: provider_id.to_string(),
                    record,
                    warning_count,
                });
            }
        }
        level
    }

    /// Tracked health of a provider
    #[must_use]
    pub fn health(&self, provider_id: &str) -> Option<ProviderHealth> {
        self.health.get(provider_id).map(|h| h.clone())
    }

    /// Stop every probe and the event follower
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for (_, handle) in self.probes.lock().drain() {
            handle.abort();
        }
    }
}

impl Drop for ProviderHealthMonitor {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for (_, handle) in self.probes.get_mut().drain() {
            handle.abort();
        }
    }
}
