//! Pool registry and maintenance task.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::connection_pool::{ConnectionPool, MaintenanceReport, PoolStats};
use crate::config::PoolConfig;
use crate::error::BrokerError;
use crate::events::EventBus;
use crate::provider::{ProviderConfig, ProviderFactory};

/// Every provider's pool, keyed by provider id
pub struct PoolRegistry {
    pools: DashMap<String, Arc<ConnectionPool>>,
    factory: Arc<dyn ProviderFactory>,
    events: EventBus,
    shutdown: CancellationToken,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl PoolRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(factory: Arc<dyn ProviderFactory>, events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            pools: DashMap::new(),
            factory,
            events,
            shutdown: CancellationToken::new(),
            maintenance: Mutex::new(None),
        })
    }

    /// Create a pool for `provider_id` and bring it up to `min_size`.
    ///
    /// A pool that fails to reach `min_size` is disposed and forgotten.
    ///
    /// # Errors
    ///
    /// - `BrokerError::InvalidConfig` for an invalid `pool_config`
    /// - `BrokerError::AlreadyInitialized` when the provider already has a pool
    /// - any `add_connection` failure while filling the pool
    pub async fn create_pool(
        &self,
        provider_id: &str,
        provider_type: &str,
        provider_config: ProviderConfig,
        pool_config: PoolConfig,
    ) -> Result<Arc<ConnectionPool>, BrokerError> {
        pool_config
            .validate()
            .map_err(|e| BrokerError::InvalidConfig(e.to_string()))?;

        let pool = ConnectionPool::new(
            provider_id,
            provider_type,
            provider_config,
            pool_config,
            Arc::clone(&self.factory),
            self.events.clone(),
        );
        match self.pools.entry(provider_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(BrokerError::AlreadyInitialized {
                    provider_id: provider_id.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&pool));
            }
        }

        if let Err(e) = pool.initialize().await {
            self.pools
                .remove_if(provider_id, |_, existing| Arc::ptr_eq(existing, &pool));
            pool.dispose().await;
            return Err(e);
        }
        Ok(pool)
    }

    /// Pool of one provider
    #[must_use]
    pub fn get(&self, provider_id: &str) -> Option<Arc<ConnectionPool>> {
        self.pools.get(provider_id).map(|p| Arc::clone(&p))
    }

    /// Providers with a pool, sorted
    #[must_use]
    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Dispose and forget one provider's pool. Returns whether it existed.
    pub async fn remove_pool(&self, provider_id: &str) -> bool {
        let Some((_, pool)) = self.pools.remove(provider_id) else {
            return false;
        };
        pool.dispose().await;
        true
    }

    /// Statistics of every pool
    #[must_use]
    pub fn all_stats(&self) -> HashMap<String, PoolStats> {
        self.snapshot()
            .into_iter()
            .map(|pool| (pool.provider_id().to_string(), pool.stats()))
            .collect()
    }

    fn snapshot(&self) -> Vec<Arc<ConnectionPool>> {
        self.pools.iter().map(|e| Arc::clone(e.value())).collect()
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Run one maintenance pass over every pool
    pub async fn run_maintenance_once(&self) -> HashMap<String, MaintenanceReport> {
        let pools = self.snapshot();
        let reports = join_all(pools.iter().map(|pool| pool.run_maintenance())).await;
        pools
            .iter()
            .map(|pool| pool.provider_id().to_string())
            .zip(reports)
            .collect()
    }

    /// Start the periodic maintenance task. The first pass runs one
    /// `interval` from now. Calling this again replaces the running task.
    pub fn start_maintenance(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(maintenance_loop(weak, shutdown, interval));
        if let Some(previous) = self.maintenance.lock().replace(handle) {
            previous.abort();
        }
        tracing::debug!(interval_ms = interval.as_millis() as u64, "Pool maintenance started");
    }

    /// Stop maintenance and dispose every pool concurrently
    pub async fn dispose(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.maintenance.lock().take() {
            handle.abort();
        }

        let pools = self.snapshot();
        self.pools.clear();
        join_all(pools.iter().map(|pool| pool.dispose())).await;
        tracing::debug!(pools = pools.len(), "Pool registry disposed");
    }
}

impl Drop for PoolRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn maintenance_loop(registry: Weak<PoolRegistry>, shutdown: CancellationToken, interval: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(registry) = registry.upgrade() else {
            break;
        };
        let reports = registry.run_maintenance_once().await;
        for (provider_id, report) in reports {
            if report.added > 0 || report.evicted > 0 || report.unhealthy_removed > 0 {
                tracing::info!(
                    provider_id = %provider_id,
                    evicted = report.evicted,
                    unhealthy_removed = report.unhealthy_removed,
                    added = report.added,
                    "Maintenance adjusted pool"
                );
            }
        }
    }
    tracing::debug!("Pool maintenance stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockFactory;

    fn registry(factory: &MockFactory) -> Arc<PoolRegistry> {
        PoolRegistry::new(Arc::new(factory.clone()), EventBus::new())
    }

    fn config(min_size: usize, max_size: usize) -> PoolConfig {
        PoolConfig {
            min_size,
            max_size,
            idle_timeout_ms: 1_000,
            acquire_timeout_ms: 500,
        }
    }

    #[tokio::test]
    async fn test_duplicate_pool_rejected() {
        let factory = MockFactory::new();
        let registry = registry(&factory);
        registry
            .create_pool("p1", "mock", ProviderConfig::default(), config(1, 2))
            .await
            .unwrap();

        let err = registry
            .create_pool("p1", "mock", ProviderConfig::default(), config(1, 2))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "ALREADY_INITIALIZED");
        assert_eq!(registry.get("p1").unwrap().size(), 1);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let factory = MockFactory::new();
        let registry = registry(&factory);
        let err = registry
            .create_pool("p1", "mock", ProviderConfig::default(), config(3, 2))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "INVALID_CONFIG");
        assert!(registry.get("p1").is_none());
    }

    #[tokio::test]
    async fn test_failed_init_forgets_pool() {
        let factory = MockFactory::new();
        factory.control().set_connect_failure(true);
        let registry = registry(&factory);

        let err = registry
            .create_pool("p1", "mock", ProviderConfig::default(), config(1, 2))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "CONNECTION_FAILED");
        assert!(registry.get("p1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_task_evicts_and_replenishes() {
        let factory = MockFactory::new();
        let registry = registry(&factory);
        let pool = registry
            .create_pool("p1", "mock", ProviderConfig::default(), config(1, 3))
            .await
            .unwrap();
        let first = pool.connections()[0].id;

        registry.start_maintenance(Duration::from_millis(2_000));
        tokio::time::sleep(Duration::from_millis(2_100)).await;

        let connections = pool.connections();
        assert_eq!(connections.len(), 1);
        assert_ne!(connections[0].id, first);
        registry.dispose().await;
    }

    #[tokio::test]
    async fn test_dispose_clears_every_pool() {
        let factory = MockFactory::new();
        let registry = registry(&factory);
        for id in ["a", "b"] {
            registry
                .create_pool(id, "mock", ProviderConfig::default(), config(2, 2))
                .await
                .unwrap();
        }
        assert_eq!(registry.provider_ids(), vec!["a", "b"]);

        registry.dispose().await;
        assert!(registry.provider_ids().is_empty());
        assert_eq!(factory.control().disconnects(), 4);
    }
}
