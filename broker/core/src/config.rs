//! Broker Configuration
//!
//! Configuration for pools, retries, queueing, health monitoring and the
//! providers to bring up at start-up, with support for a TOML configuration
//! file at `~/.config/llm-broker/broker.toml`.
//!
//! # Configuration Priority
//!
//! Values are resolved with the following priority (highest first):
//! 1. CLI arguments (applied by the daemon)
//! 2. Environment variables (`BROKER_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! maintenance_interval_ms = 60000
//!
//! [pool]
//! min_size = 1
//! max_size = 5
//! idle_timeout_ms = 300000
//! acquire_timeout_ms = 30000
//!
//! [retry]
//! max_retries = 3
//! base_delay_ms = 1000
//! max_delay_ms = 30000
//!
//! [queue]
//! max_queue_size = 100
//! queue_timeout_ms = 30000
//! priority_levels = ["high", "normal", "low"]
//!
//! [queue.max_requests_per_priority]
//! high = 50
//! normal = 100
//! low = 100
//!
//! [[providers]]
//! id = "ollama-default"
//! provider_type = "ollama"
//! endpoint = "http://localhost:11434"
//! model = "llama3.2"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::Priority;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Pool Configuration
// =============================================================================

/// Per-provider pool limits. Immutable once the provider is initialised.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections kept warm at all times
    pub min_size: usize,
    /// Hard cap on live connections
    pub max_size: usize,
    /// Idle time after which an unused connection is evicted
    pub idle_timeout_ms: u64,
    /// Upper bound on how long `acquire` may wait
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 5,
            idle_timeout_ms: 300_000, // 5 minutes
            acquire_timeout_ms: 30_000,
        }
    }
}

impl PoolConfig {
    /// Idle timeout as a `Duration`
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Acquire timeout as a `Duration`
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Check `0 <= min_size <= max_size` and `max_size >= 1`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` describing the violated bound.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::ValidationError(
                "pool.max_size must be at least 1".to_string(),
            ));
        }
        if self.min_size > self.max_size {
            return Err(ConfigError::ValidationError(format!(
                "pool.min_size ({}) exceeds pool.max_size ({})",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Retry Configuration
// =============================================================================

/// Retry and backoff settings for transient provider failures
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum retries after the first failure
    pub max_retries: u32,
    /// Delay for attempt 0, doubled on every attempt
    pub base_delay_ms: u64,
    /// Upper bound on any single delay
    pub max_delay_ms: u64,
    /// Maximum jitter as a fraction of the exponential delay
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_factor: 0.3,
        }
    }
}

// =============================================================================
// Queue Configuration
// =============================================================================

/// Capacity of each priority tier
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityLimits {
    /// Capacity of the high tier
    pub high: usize,
    /// Capacity of the normal tier
    pub normal: usize,
    /// Capacity of the low tier
    pub low: usize,
}

impl Default for PriorityLimits {
    fn default() -> Self {
        Self {
            high: 50,
            normal: 100,
            low: 100,
        }
    }
}

impl PriorityLimits {
    /// Capacity configured for a tier
    #[must_use]
    pub fn for_priority(&self, priority: Priority) -> usize {
        match priority {
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }
}

/// Request queue settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Global cap across all tiers
    pub max_queue_size: usize,
    /// How long a request may wait before it is dropped (0 = forever)
    pub queue_timeout_ms: u64,
    /// Tiers that accept requests
    pub priority_levels: Vec<Priority>,
    /// Per-tier capacity
    pub max_requests_per_priority: PriorityLimits,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            queue_timeout_ms: 30_000,
            priority_levels: Priority::ALL.to_vec(),
            max_requests_per_priority: PriorityLimits::default(),
        }
    }
}

impl QueueConfig {
    /// Queue timeout, `None` when disabled
    #[must_use]
    pub fn queue_timeout(&self) -> Option<Duration> {
        (self.queue_timeout_ms > 0).then(|| Duration::from_millis(self.queue_timeout_ms))
    }

    /// Effective capacity of a tier (0 when the tier is not enabled)
    #[must_use]
    pub fn tier_capacity(&self, priority: Priority) -> usize {
        if self.priority_levels.contains(&priority) {
            self.max_requests_per_priority.for_priority(priority)
        } else {
            0
        }
    }
}

// =============================================================================
// Execution Configuration
// =============================================================================

/// Settings for the task runner that drains the request queue
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Tasks allowed to run at once
    pub max_concurrent: usize,
    /// Per-task timeout (0 = none)
    pub task_timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            task_timeout_ms: 120_000, // long generations
        }
    }
}

impl ExecutionConfig {
    /// Task timeout, `None` when disabled
    #[must_use]
    pub fn task_timeout(&self) -> Option<Duration> {
        (self.task_timeout_ms > 0).then(|| Duration::from_millis(self.task_timeout_ms))
    }
}

// =============================================================================
// Health / State Configuration
// =============================================================================

/// Periodic provider health probing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between probes while a provider is connected
    pub check_interval_ms: u64,
    /// Consecutive unhealthy probes before a record turns critical
    pub warning_threshold: u32,
    /// Time limit for a single probe
    pub probe_timeout_ms: u64,
    /// Rebuild a provider's pool when its health turns critical
    pub auto_reconnect: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 30_000,
            warning_threshold: 3,
            probe_timeout_ms: 10_000,
            auto_reconnect: true,
        }
    }
}

/// Resource monitoring of an out-of-process backend host
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostMonitorConfig {
    /// Sampling interval
    pub interval_ms: u64,
    /// CPU utilisation (percent) considered excessive
    pub cpu_threshold: f64,
    /// Memory utilisation (percent) considered excessive
    pub memory_threshold: f64,
    /// How long utilisation must stay excessive before it is critical
    pub sustained_ms: u64,
}

impl Default for HostMonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            cpu_threshold: 90.0,
            memory_threshold: 90.0,
            sustained_ms: 30_000,
        }
    }
}

/// Timeouts for the transitional connection states
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateTimeouts {
    /// Max time in `connecting`
    pub connecting_ms: u64,
    /// Max time in `reconnecting`
    pub reconnecting_ms: u64,
}

impl Default for StateTimeouts {
    fn default() -> Self {
        Self {
            connecting_ms: 30_000,
            reconnecting_ms: 60_000,
        }
    }
}

// =============================================================================
// Provider Entries
// =============================================================================

/// A provider to initialise at start-up
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEntry {
    /// Provider identifier (e.g. "ollama-default")
    pub id: String,
    /// Type understood by the provider factory (e.g. "ollama")
    pub provider_type: String,
    /// Backend endpoint
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Default model for requests to this provider
    #[serde(default)]
    pub model: Option<String>,
    /// Pool overrides for this provider
    #[serde(default)]
    pub pool: Option<PoolConfig>,
}

// =============================================================================
// Full Broker Configuration
// =============================================================================

/// Complete broker configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Default pool limits
    pub pool: PoolConfig,
    /// Retry policy
    pub retry: RetryConfig,
    /// Request queue limits
    pub queue: QueueConfig,
    /// Task runner limits
    pub execution: ExecutionConfig,
    /// Provider health probing
    pub health: HealthConfig,
    /// Host resource monitoring
    pub host: HostMonitorConfig,
    /// Transitional state timeouts
    pub state: StateTimeouts,
    /// Interval of the pool maintenance task
    pub maintenance_interval_ms: u64,
    /// Providers brought up at start-up
    pub providers: Vec<ProviderEntry>,

    /// Path to the config file that was loaded (if any)
    #[serde(skip)]
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    #[serde(skip)]
    source: ConfigSource,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            queue: QueueConfig::default(),
            execution: ExecutionConfig::default(),
            health: HealthConfig::default(),
            host: HostMonitorConfig::default(),
            state: StateTimeouts::default(),
            maintenance_interval_ms: 60_000,
            providers: Vec::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl BrokerConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Maintenance interval as a `Duration`
    #[must_use]
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    /// Pool limits for a provider entry, falling back to the defaults
    #[must_use]
    pub fn pool_for(&self, entry: &ProviderEntry) -> PoolConfig {
        entry.pool.clone().unwrap_or_else(|| self.pool.clone())
    }

    /// Validate every section
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        for entry in &self.providers {
            if entry.id.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "provider id must not be empty".to_string(),
                ));
            }
            if let Some(pool) = &entry.pool {
                pool.validate().map_err(|e| {
                    ConfigError::ValidationError(format!("provider '{}': {e}", entry.id))
                })?;
            }
        }
        if self.queue.priority_levels.is_empty() {
            return Err(ConfigError::ValidationError(
                "queue.priority_levels must list at least one tier".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(ConfigError::ValidationError(format!(
                "retry.jitter_factor ({}) must be within 0.0..=1.0",
                self.retry.jitter_factor
            )));
        }
        if self.execution.max_concurrent == 0 {
            return Err(ConfigError::ValidationError(
                "execution.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.health.warning_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "health.warning_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/llm-broker/broker.toml` or
/// `~/.config/llm-broker/broker.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("llm-broker").join("broker.toml"))
}

/// Load configuration from the default path, environment and defaults
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<BrokerConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read, parsed, or
/// fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<BrokerConfig, ConfigError> {
    let mut config = match path {
        Some(ref config_path) if config_path.exists() => {
            let mut config = parse_config_file(config_path)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;
            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
            config
        }
        Some(ref config_path) => {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
            BrokerConfig::default()
        }
        None => BrokerConfig::default(),
    };

    apply_env_config(&mut config);
    config.validate()?;
    Ok(config)
}

fn parse_config_file(path: &Path) -> Result<BrokerConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(toml::from_str(&content)?)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut BrokerConfig) {
    let mut touched = false;

    if let Some(v) = env_parse("BROKER_POOL_MIN_SIZE") {
        config.pool.min_size = v;
        touched = true;
    }
    if let Some(v) = env_parse("BROKER_POOL_MAX_SIZE") {
        config.pool.max_size = v;
        touched = true;
    }
    if let Some(v) = env_parse("BROKER_IDLE_TIMEOUT_MS") {
        config.pool.idle_timeout_ms = v;
        touched = true;
    }
    if let Some(v) = env_parse("BROKER_ACQUIRE_TIMEOUT_MS") {
        config.pool.acquire_timeout_ms = v;
        touched = true;
    }
    if let Some(v) = env_parse("BROKER_MAX_RETRIES") {
        config.retry.max_retries = v;
        touched = true;
    }
    if let Some(v) = env_parse("BROKER_BASE_DELAY_MS") {
        config.retry.base_delay_ms = v;
        touched = true;
    }
    if let Some(v) = env_parse("BROKER_MAX_QUEUE_SIZE") {
        config.queue.max_queue_size = v;
        touched = true;
    }
    if let Some(v) = env_parse("BROKER_QUEUE_TIMEOUT_MS") {
        config.queue.queue_timeout_ms = v;
        touched = true;
    }
    if let Some(v) = env_parse("BROKER_MAINTENANCE_INTERVAL_MS") {
        config.maintenance_interval_ms = v;
        touched = true;
    }

    if touched {
        config.source = ConfigSource::Env;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = BrokerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.maintenance_interval(), Duration::from_secs(60));
        assert_eq!(config.state.connecting_ms, 30_000);
        assert_eq!(config.state.reconnecting_ms, 60_000);
        assert_eq!(config.health.warning_threshold, 3);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_pool_bounds() {
        let pool = PoolConfig {
            min_size: 4,
            max_size: 2,
            ..Default::default()
        };
        assert!(pool.validate().is_err());

        let pool = PoolConfig {
            min_size: 0,
            max_size: 0,
            ..Default::default()
        };
        assert!(pool.validate().is_err());

        let pool = PoolConfig {
            min_size: 0,
            max_size: 1,
            ..Default::default()
        };
        assert!(pool.validate().is_ok());
    }

    #[test]
    fn test_disabled_tier_has_no_capacity() {
        let queue = QueueConfig {
            priority_levels: vec![Priority::High, Priority::Normal],
            ..Default::default()
        };
        assert_eq!(queue.tier_capacity(Priority::High), 50);
        assert_eq!(queue.tier_capacity(Priority::Low), 0);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
maintenance_interval_ms = 15000

[pool]
min_size = 2
max_size = 3

[queue]
priority_levels = ["high", "low"]

[queue.max_requests_per_priority]
high = 5

[[providers]]
id = "ollama-default"
provider_type = "ollama"
endpoint = "http://localhost:11434"
"#
        )
        .unwrap();

        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.pool.min_size, 2);
        assert_eq!(config.pool.max_size, 3);
        // Unspecified fields keep their defaults
        assert_eq!(config.pool.acquire_timeout_ms, 30_000);
        assert_eq!(config.maintenance_interval(), Duration::from_secs(15));
        assert_eq!(config.queue.priority_levels, vec![Priority::High, Priority::Low]);
        assert_eq!(config.queue.max_requests_per_priority.high, 5);
        assert_eq!(config.queue.max_requests_per_priority.normal, 100);
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].provider_type, "ollama");
        assert_eq!(config.pool_for(&config.providers[0]), config.pool);
        assert_eq!(config.config_file_path.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config =
            load_config_from_path(Some(PathBuf::from("/nonexistent/llm-broker/broker.toml")))
                .unwrap();
        assert!(config.config_file_path.is_none());
        assert_eq!(config.pool, PoolConfig::default());
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pool]\nmin_size = 9\nmax_size = 2").unwrap();
        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pool\nmin_size = ").unwrap();
        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
