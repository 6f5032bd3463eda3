//! Health Monitoring
//!
//! Three flavours of health tracking feed the broker:
//!
//! - Per-connection checks, run by the pool on admission and release, store a
//!   [`HealthRecord`] on each pooled connection. Acquisition skips
//!   connections whose last record is unhealthy.
//! - [`ProviderHealthMonitor`] probes a provider periodically, but only while
//!   its state machine reports `connected`. Consecutive unhealthy probes
//!   escalate from warning to critical.
//! - [`HostMonitor`] samples CPU and memory of an out-of-process backend and
//!   raises warning / critical signals on sustained overload.

mod host;
mod monitor;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use host::{HostLevel, HostMonitor, ProcessSampler, ResourceSampler, ResourceUsage};
pub use monitor::{HealthLevel, HealthProbe, ProviderHealth, ProviderHealthMonitor};

/// Last known result of a health probe
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    /// Whether the probe succeeded
    pub is_healthy: bool,
    /// Round-trip time of the probe
    pub latency_ms: u64,
    /// When the probe ran
    pub last_check: DateTime<Utc>,
    /// Failures observed by the prober so far
    pub error_count: u32,
    /// Description of the last failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl HealthRecord {
    /// A passing probe
    #[must_use]
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            is_healthy: true,
            latency_ms,
            last_check: Utc::now(),
            error_count: 0,
            last_error: None,
        }
    }

    /// A failing probe
    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            is_healthy: false,
            latency_ms: 0,
            last_check: Utc::now(),
            error_count: 1,
            last_error: Some(error.into()),
        }
    }

    /// Set the measured latency
    #[must_use]
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }
}

impl Default for HealthRecord {
    /// Nothing checked yet; assumed healthy until a probe says otherwise
    fn default() -> Self {
        Self::healthy(0)
    }
}
