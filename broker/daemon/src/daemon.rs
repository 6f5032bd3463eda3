//! Daemon Lifecycle
//!
//! Owns the provider manager for the lifetime of the process:
//! - Brings configured providers up (failures leave them in `error`)
//! - Starts provider health probing and optional host monitoring
//! - Reconciles the provider set on config reload
//! - Reports pool statistics periodically and on shutdown

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use broker_core::{
    load_config, load_config_from_path, BrokerConfig, BrokerMetrics, CompletionRequest,
    DefaultProviderFactory, HostMonitor, ProcessSampler, ProviderConfig, ProviderEntry,
    MetricsSink, ProviderManager,
};

/// Provider registered when the configuration lists none
const DEFAULT_PROVIDER_ID: &str = "ollama-default";

/// Options taken from the command line
pub struct DaemonOptions {
    /// Configuration file, or the default location when unset
    pub config_path: Option<PathBuf>,
    /// Backend process to watch for resource exhaustion
    pub monitor_pid: Option<u32>,
    /// Mirror broker events to stdout
    pub emit_events: bool,
    /// Interval between statistics reports (zero disables them)
    pub report_interval: Duration,
}

/// The running daemon
pub struct BrokerDaemon {
    options: DaemonOptions,
    config: BrokerConfig,
    manager: Arc<ProviderManager>,
    metrics: Arc<BrokerMetrics>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

fn read_config(path: Option<&PathBuf>) -> Result<BrokerConfig> {
    let mut config = match path {
        Some(path) => load_config_from_path(Some(path.clone()))
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => load_config().context("Failed to load default config")?,
    };
    if config.providers.is_empty() {
        let ollama = ProviderConfig::ollama_from_env();
        info!(endpoint = ?ollama.endpoint, "No providers configured, using local Ollama");
        config.providers.push(ProviderEntry {
            id: DEFAULT_PROVIDER_ID.to_string(),
            provider_type: "ollama".to_string(),
            endpoint: ollama.endpoint,
            model: ollama.model,
            pool: None,
        });
    }
    Ok(config)
}

fn provider_config(entry: &ProviderEntry) -> ProviderConfig {
    ProviderConfig {
        endpoint: entry.endpoint.clone(),
        model: entry.model.clone(),
        ..ProviderConfig::default()
    }
}

impl BrokerDaemon {
    /// Load the configuration and bring every provider up
    ///
    /// # Errors
    ///
    /// Fails only when the configuration cannot be loaded; providers that
    /// cannot be reached are logged and left in `error`.
    pub async fn start(options: DaemonOptions, shutdown: CancellationToken) -> Result<Self> {
        let config = read_config(options.config_path.as_ref())?;
        info!(
            source = ?config.source(),
            providers = config.providers.len(),
            "Configuration loaded"
        );

        let metrics = Arc::new(BrokerMetrics::new());
        let manager = ProviderManager::new(
            config.clone(),
            Arc::new(DefaultProviderFactory),
            Arc::clone(&metrics) as Arc<dyn MetricsSink>,
        );

        let mut tasks = Vec::new();
        if options.emit_events {
            tasks.push(spawn_event_printer(&manager, shutdown.clone()));
        }

        let mut daemon = Self {
            options,
            config,
            manager,
            metrics,
            shutdown,
            tasks,
        };

        for entry in daemon.config.providers.clone() {
            daemon.bring_up(&entry).await;
        }
        daemon.manager.start_health_monitor();

        if let Some(pid) = daemon.options.monitor_pid {
            let monitor = HostMonitor::new(
                format!("pid:{pid}"),
                daemon.config.host.clone(),
                daemon.manager.events().clone(),
                Box::new(ProcessSampler::new(pid)),
            );
            daemon.tasks.push(monitor.spawn(daemon.shutdown.clone()));
            info!(pid, "Host monitor started");
        }

        Ok(daemon)
    }

    async fn bring_up(&self, entry: &ProviderEntry) {
        let pool = self.config.pool_for(entry);
        match self
            .manager
            .initialize_provider(&entry.id, &entry.provider_type, provider_config(entry), pool)
            .await
        {
            Ok(connections) => info!(provider_id = %entry.id, connections, "Provider ready"),
            Err(e) => warn!(
                provider_id = %entry.id,
                code = e.code(),
                error = %e,
                "Provider unavailable"
            ),
        }
    }

    /// Serve until shutdown, reloading the provider set on request
    ///
    /// # Errors
    ///
    /// Currently never fails; reload errors are logged and the previous
    /// provider set is kept.
    pub async fn run(&self, mut reload: mpsc::UnboundedReceiver<()>) -> Result<()> {
        let period = self.options.report_interval;
        let mut report = (!period.is_zero())
            .then(|| tokio::time::interval_at(tokio::time::Instant::now() + period, period));

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                Some(()) = reload.recv() => {
                    if let Err(e) = self.reload().await {
                        warn!(error = %e, "Config reload failed, keeping current providers");
                    }
                }
                () = next_report(report.as_mut()) => self.report(),
            }
        }
        Ok(())
    }

    /// Run one completion against the first configured provider
    ///
    /// # Errors
    ///
    /// Returns the broker error when the completion fails.
    pub async fn run_prompt(&self, prompt: &str) -> Result<()> {
        let provider_id = self
            .config
            .providers
            .first()
            .map(|entry| entry.id.clone())
            .context("No provider configured")?;

        let request = CompletionRequest::new(prompt);
        let response = tokio::select! {
            () = self.shutdown.cancelled() => anyhow::bail!("Interrupted"),
            response = self.manager.generate_completion(&provider_id, &request) => response?,
        };
        println!("{}", response.content);
        info!(
            provider_id = %provider_id,
            model = %response.model,
            duration_ms = ?response.duration_ms,
            "Completion finished"
        );
        Ok(())
    }

    /// Add providers that appeared in the config and remove those that left.
    /// Changed settings of existing providers take effect on restart.
    async fn reload(&self) -> Result<()> {
        let fresh = read_config(self.options.config_path.as_ref())?;
        let wanted: HashSet<&str> = fresh.providers.iter().map(|e| e.id.as_str()).collect();

        for provider_id in self.manager.provider_ids() {
            if !wanted.contains(provider_id.as_str()) {
                self.manager.remove_provider(&provider_id).await;
                info!(provider_id = %provider_id, "Provider removed by reload");
            }
        }

        let running: HashSet<String> = self.manager.provider_ids().into_iter().collect();
        for entry in &fresh.providers {
            if !running.contains(&entry.id) {
                self.bring_up(entry).await;
            }
        }
        info!(providers = wanted.len(), "Configuration reloaded");
        Ok(())
    }

    fn snapshot(&self) -> Value {
        let ids: BTreeSet<String> = self
            .config
            .providers
            .iter()
            .map(|entry| entry.id.clone())
            .chain(self.manager.provider_ids())
            .collect();
        let providers: BTreeMap<String, Value> = ids
            .into_iter()
            .map(|id| {
                let report = json!({
                    "state": self.manager.provider_state(&id),
                    "pool": self.manager.pool_stats(&id),
                    "health": self.manager.provider_health(&id).map(|h| h.record),
                    "metrics": self.metrics.summary(&id),
                });
                (id, report)
            })
            .collect();
        json!({
            "providers": providers,
            "queue": self.manager.queue_stats(),
        })
    }

    fn report(&self) {
        for provider_id in self.manager.provider_ids() {
            if let Some(stats) = self.manager.pool_stats(&provider_id) {
                info!(
                    provider_id = %provider_id,
                    size = stats.size,
                    in_use = stats.in_use,
                    idle = stats.idle,
                    waiting = stats.waiting_requests,
                    reused = stats.connections_reused,
                    "Pool statistics"
                );
            }
        }
        let queue = self.manager.queue_stats();
        debug!(total = queue.total, active = queue.active, "Queue statistics");
    }

    /// Stop background work and dispose the manager, returning a final
    /// statistics snapshot taken just before disposal
    pub async fn shutdown(mut self) -> Value {
        self.shutdown.cancel();
        let summary = self.snapshot();
        self.manager.dispose().await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        summary
    }
}

async fn next_report(report: Option<&mut tokio::time::Interval>) {
    match report {
        Some(report) => {
            report.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn spawn_event_printer(manager: &ProviderManager, shutdown: CancellationToken) -> JoinHandle<()> {
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                () = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(event = event.name(), error = %e, "Failed to encode event"),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event printer fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
