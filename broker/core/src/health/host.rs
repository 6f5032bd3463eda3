//! Out-of-process host monitoring.
//!
//! Samples CPU and memory utilisation of a backend process (for example a
//! local `ollama serve`) on a fixed interval. Crossing a threshold raises a
//! warning; staying over it for the sustained period raises a critical
//! signal. The signals inform restart decisions and do not touch the pools.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::HostMonitorConfig;
use crate::events::{BrokerEvent, EventBus};

/// One utilisation sample
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    /// CPU utilisation in percent of one core
    pub cpu_percent: f64,
    /// Resident memory in percent of total memory
    pub memory_percent: f64,
    /// Resident memory in bytes
    pub memory_bytes: u64,
    /// When the sample was taken
    pub sampled_at: DateTime<Utc>,
}

/// Source of utilisation samples
pub trait ResourceSampler: Send {
    /// Take a sample
    ///
    /// # Errors
    ///
    /// Returns an error if the target cannot be inspected.
    fn sample(&mut self) -> anyhow::Result<ResourceUsage>;
}

// ============================================================================
// procfs Sampler
// ============================================================================

/// Kernel clock ticks per second used by `/proc/<pid>/stat`
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

/// Samples a process through `/proc` (Linux)
pub struct ProcessSampler {
    pid: u32,
    proc_root: PathBuf,
    last_cpu: Option<(u64, Instant)>,
}

impl ProcessSampler {
    /// Sample the process with the given pid
    #[must_use]
    pub fn new(pid: u32) -> Self {
        Self::with_proc_root(pid, "/proc")
    }

    /// Sample using an alternative procfs mount
    pub fn with_proc_root(pid: u32, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            pid,
            proc_root: proc_root.into(),
            last_cpu: None,
        }
    }

    fn read(&self, relative: &str) -> anyhow::Result<String> {
        let path = self.proc_root.join(relative);
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
    }

    /// utime + stime in clock ticks
    fn cpu_ticks(&self) -> anyhow::Result<u64> {
        let stat = self.read(&format!("{}/stat", self.pid))?;
        parse_cpu_ticks(&stat)
    }
}

impl ResourceSampler for ProcessSampler {
    fn sample(&mut self) -> anyhow::Result<ResourceUsage> {
        let ticks = self.cpu_ticks()?;
        let now = Instant::now();
        let cpu_percent = match self.last_cpu {
            Some((last_ticks, last_at)) => {
                let elapsed = now.duration_since(last_at).as_secs_f64();
                if elapsed > 0.0 {
                    (ticks.saturating_sub(last_ticks) as f64 / CLOCK_TICKS_PER_SEC) / elapsed
                        * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last_cpu = Some((ticks, now));

        let status = self.read(&format!("{}/status", self.pid))?;
        let meminfo = self.read("meminfo")?;
        let rss_kb = parse_kb_field(&status, "VmRSS:").unwrap_or(0);
        let total_kb = parse_kb_field(&meminfo, "MemTotal:")
            .context("MemTotal missing from meminfo")?;
        let memory_percent = if total_kb > 0 {
            rss_kb as f64 / total_kb as f64 * 100.0
        } else {
            0.0
        };

        Ok(ResourceUsage {
            cpu_percent,
            memory_percent,
            memory_bytes: rss_kb * 1024,
            sampled_at: Utc::now(),
        })
    }
}

/// Fields 14 and 15 of `/proc/<pid>/stat`. The command name (field 2) may
/// contain spaces, so fields are counted from the closing parenthesis.
fn parse_cpu_ticks(stat: &str) -> anyhow::Result<u64> {
    let after_comm = stat
        .rfind(')')
        .map(|i| &stat[i + 1..])
        .context("malformed stat line")?;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // fields[0] is field 3 (state)
    let utime: u64 = fields.get(11).context("utime missing")?.parse()?;
    let stime: u64 = fields.get(12).context("stime missing")?.parse()?;
    Ok(utime + stime)
}

fn parse_kb_field(text: &str, key: &str) -> Option<u64> {
    text.lines()
        .find(|line| line.starts_with(key))
        .and_then(|line| line[key.len()..].split_whitespace().next())
        .and_then(|value| value.parse().ok())
}

// ============================================================================
// Host Monitor
// ============================================================================

/// Severity of the host's resource usage
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostLevel {
    /// Below thresholds
    Normal,
    /// Over a threshold
    Warning,
    /// Over a threshold for at least the sustained period
    Critical,
}

#[derive(Default)]
struct BreachState {
    since: Option<Instant>,
    critical_emitted: bool,
    last: Option<ResourceUsage>,
}

/// Periodic resource monitor for one out-of-process host
pub struct HostMonitor {
    target: String,
    config: HostMonitorConfig,
    events: EventBus,
    sampler: Mutex<Box<dyn ResourceSampler>>,
    state: Mutex<BreachState>,
}

impl HostMonitor {
    /// Create a monitor for `target` (a label used in events)
    pub fn new(
        target: impl Into<String>,
        config: HostMonitorConfig,
        events: EventBus,
        sampler: Box<dyn ResourceSampler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            target: target.into(),
            config,
            events,
            sampler: Mutex::new(sampler),
            state: Mutex::new(BreachState::default()),
        })
    }

    /// Label of the monitored host
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Most recent sample
    #[must_use]
    pub fn last_usage(&self) -> Option<ResourceUsage> {
        self.state.lock().last.clone()
    }

    /// Take one sample and evaluate it
    ///
    /// # Errors
    ///
    /// Returns the sampler's error.
    pub fn sample_once(&self) -> anyhow::Result<HostLevel> {
        let usage = self.sampler.lock().sample()?;
        Ok(self.evaluate(usage))
    }

    /// Evaluate a sample against the thresholds and publish any signal
    pub fn evaluate(&self, usage: ResourceUsage) -> HostLevel {
        let over = usage.cpu_percent > self.config.cpu_threshold
            || usage.memory_percent > self.config.memory_threshold;
        let sustained = Duration::from_millis(self.config.sustained_ms);
        let now = Instant::now();

        let mut state = self.state.lock();
        state.last = Some(usage.clone());

        if !over {
            if state.since.take().is_some() {
                tracing::info!(target_host = %self.target, "Host resource usage back to normal");
            }
            state.critical_emitted = false;
            return HostLevel::Normal;
        }

        let Some(since) = state.since else {
            state.since = Some(now);
            drop(state);
            tracing::warn!(
                target_host = %self.target,
                cpu = usage.cpu_percent,
                memory = usage.memory_percent,
                "Host resource usage over threshold"
            );
            self.events.emit(BrokerEvent::HostWarning {
                target: self.target.clone(),
                usage,
            });
            return HostLevel::Warning;
        };

        let breached_for = now.duration_since(since);
        if breached_for < sustained {
            return HostLevel::Warning;
        }
        if !state.critical_emitted {
            state.critical_emitted = true;
            drop(state);
            tracing::error!(
                target_host = %self.target,
                cpu = usage.cpu_percent,
                memory = usage.memory_percent,
                sustained_ms = breached_for.as_millis() as u64,
                "Host resource usage critical"
            );
            self.events.emit(BrokerEvent::HostCritical {
                target: self.target.clone(),
                usage,
                sustained_ms: breached_for.as_millis() as u64,
            });
        }
        HostLevel::Critical
    }

    /// Sample every `interval_ms` until `shutdown` is cancelled
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let interval = Duration::from_millis(monitor.config.interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = monitor.sample_once() {
                    tracing::warn!(target_host = %monitor.target, error = %e, "Host sampling failed");
                }
            }
            tracing::debug!(target_host = %monitor.target, "Host monitor stopped");
        })
    }
}
