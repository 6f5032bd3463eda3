//! Request Metrics
//!
//! The manager reports every dispatch to a [`MetricsSink`]. The core keeps no
//! history of its own; [`BrokerMetrics`] is an in-memory sink with lock-free
//! counters and a latency histogram per provider, exportable in the
//! Prometheus text format.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::BrokerError;

/// Receives the outcome of every dispatch
pub trait MetricsSink: Send + Sync {
    /// One call finished
    fn record_request(&self, provider_id: &str, success: bool, latency_ms: u64);

    /// One call failed with `error`
    fn record_error(&self, provider_id: &str, error: &BrokerError);
}

/// Sink that discards everything
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_request(&self, _provider_id: &str, _success: bool, _latency_ms: u64) {}

    fn record_error(&self, _provider_id: &str, _error: &BrokerError) {}
}

// ============================================================================
// Primitives
// ============================================================================

/// A monotonically increasing counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Increment by one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket latency histogram (milliseconds)
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<u64>,
    counts: Vec<AtomicU64>,
    total: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Create a histogram with the given upper bounds
    #[must_use]
    pub fn new(bounds: Vec<u64>) -> Self {
        let counts = bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            counts,
            total: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Buckets suited to LLM call latencies
    #[must_use]
    pub fn latency_default() -> Self {
        Self::new(vec![
            10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000, 60_000, 120_000,
        ])
    }

    /// Record one observation
    pub fn record(&self, value: u64) {
        // Values above the last bound land in the last bucket
        let idx = self
            .bounds
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.bounds.len().saturating_sub(1));
        if let Some(count) = self.counts.get(idx) {
            count.fetch_add(1, Ordering::Relaxed);
        }
        self.total.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
    }

    /// Point-in-time copy
    #[must_use]
    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            bounds: self.bounds.clone(),
            counts: self.counts.iter().map(|c| c.load(Ordering::Relaxed)).collect(),
            total: self.total.load(Ordering::Relaxed),
            sum: self.sum.load(Ordering::Relaxed),
            max: self.max.load(Ordering::Relaxed),
        }
    }
}

/// Copy of a histogram's state
#[derive(Clone, Debug, Serialize)]
pub struct HistogramSnapshot {
    /// Upper bound of every bucket
    pub bounds: Vec<u64>,
    /// Observations per bucket
    pub counts: Vec<u64>,
    /// Number of observations
    pub total: u64,
    /// Sum of observations
    pub sum: u64,
    /// Largest observation
    pub max: u64,
}

impl HistogramSnapshot {
    /// Upper bound of the bucket holding the `p` quantile
    #[must_use]
    pub fn percentile(&self, p: f64) -> u64 {
        if self.total == 0 {
            return 0;
        }
        let target = ((self.total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0;
        for (bound, count) in self.bounds.iter().zip(&self.counts) {
            cumulative += count;
            if cumulative >= target {
                return *bound;
            }
        }
        self.bounds.last().copied().unwrap_or(0)
    }

    /// Mean observation
    #[must_use]
    pub fn mean(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.sum as f64 / self.total as f64
        }
    }
}

// ============================================================================
// Broker Metrics
// ============================================================================

#[derive(Debug)]
struct ProviderMetrics {
    requests: Counter,
    successes: Counter,
    failures: Counter,
    latency: Histogram,
    errors_by_code: Mutex<BTreeMap<&'static str, u64>>,
}

impl Default for ProviderMetrics {
    fn default() -> Self {
        Self {
            requests: Counter::default(),
            successes: Counter::default(),
            failures: Counter::default(),
            latency: Histogram::latency_default(),
            errors_by_code: Mutex::new(BTreeMap::new()),
        }
    }
}

/// Summary of one provider's traffic
#[derive(Clone, Debug, Serialize)]
pub struct ProviderSummary {
    /// Calls dispatched
    pub total_requests: u64,
    /// Calls that succeeded
    pub successful_requests: u64,
    /// Calls that failed
    pub failed_requests: u64,
    /// Median latency bucket
    pub latency_p50_ms: u64,
    /// 90th percentile latency bucket
    pub latency_p90_ms: u64,
    /// 99th percentile latency bucket
    pub latency_p99_ms: u64,
    /// Mean latency
    pub latency_mean_ms: f64,
    /// Errors by stable error code
    pub errors_by_code: BTreeMap<String, u64>,
}

/// In-memory metrics sink keyed by provider id
#[derive(Debug, Default)]
pub struct BrokerMetrics {
    providers: DashMap<String, Arc<ProviderMetrics>>,
}

impl BrokerMetrics {
    /// Create an empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn provider(&self, provider_id: &str) -> Arc<ProviderMetrics> {
        if let Some(metrics) = self.providers.get(provider_id) {
            return Arc::clone(&metrics);
        }
        Arc::clone(
            &self
                .providers
                .entry(provider_id.to_string())
                .or_default(),
        )
    }

    /// Summary for one provider
    #[must_use]
    pub fn summary(&self, provider_id: &str) -> Option<ProviderSummary> {
        let metrics = self.providers.get(provider_id).map(|m| Arc::clone(&m))?;
        let latency = metrics.latency.snapshot();
        let errors_by_code = metrics
            .errors_by_code
            .lock()
            .iter()
            .map(|(code, count)| ((*code).to_string(), *count))
            .collect();
        Some(ProviderSummary {
            total_requests: metrics.requests.get(),
            successful_requests: metrics.successes.get(),
            failed_requests: metrics.failures.get(),
            latency_p50_ms: latency.percentile(0.5),
            latency_p90_ms: latency.percentile(0.9),
            latency_p99_ms: latency.percentile(0.99),
            latency_mean_ms: latency.mean(),
            errors_by_code,
        })
    }

    /// Providers with recorded traffic
    #[must_use]
    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Prometheus text exposition
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        let summaries: Vec<(String, ProviderSummary)> = self
            .provider_ids()
            .into_iter()
            .filter_map(|id| self.summary(&id).map(|s| (id, s)))
            .collect();

        out.push_str("# HELP broker_requests_total Requests dispatched per provider\n");
        out.push_str("# TYPE broker_requests_total counter\n");
        for (id, s) in &summaries {
            let _ = writeln!(
                out,
                "broker_requests_total{{provider=\"{id}\",outcome=\"success\"}} {}",
                s.successful_requests
            );
            let _ = writeln!(
                out,
                "broker_requests_total{{provider=\"{id}\",outcome=\"failure\"}} {}",
                s.failed_requests
            );
        }

        out.push_str("\n# HELP broker_errors_total Errors per provider and code\n");
        out.push_str("# TYPE broker_errors_total counter\n");
        for (id, s) in &summaries {
            for (code, count) in &s.errors_by_code {
                let _ = writeln!(
                    out,
                    "broker_errors_total{{provider=\"{id}\",code=\"{code}\"}} {count}"
                );
            }
        }

        out.push_str("\n# HELP broker_latency_ms Request latency percentiles\n");
        out.push_str("# TYPE broker_latency_ms gauge\n");
        for (id, s) in &summaries {
            for (quantile, value) in [
                ("0.5", s.latency_p50_ms),
                ("0.9", s.latency_p90_ms),
                ("0.99", s.latency_p99_ms),
            ] {
                let _ = writeln!(
                    out,
                    "broker_latency_ms{{provider=\"{id}\",quantile=\"{quantile}\"}} {value}"
                );
            }
        }
        out
    }
}

impl MetricsSink for BrokerMetrics {
    fn record_request(&self, provider_id: &str, success: bool, latency_ms: u64) {
        let metrics = self.provider(provider_id);
        metrics.requests.inc();
        if success {
            metrics.successes.inc();
        } else {
            metrics.failures.inc();
        }
        metrics.latency.record(latency_ms);
    }

    fn record_error(&self, provider_id: &str, error: &BrokerError) {
        let metrics = self.provider(provider_id);
        *metrics.errors_by_code.lock().entry(error.code()).or_insert(0) += 1;
    }
}
