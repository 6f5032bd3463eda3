//! Request Scheduling
//!
//! Two cooperating queues sit in front of the connection pools:
//!
//! - [`RequestQueue`] holds pending requests in three priority tiers and hands
//!   them out in strict priority order. A tier is only served while every
//!   higher tier is empty, so a sustained flood of `high` work starves `low`
//!   work indefinitely. Callers that need fairness must shape their traffic.
//! - [`ExecutionQueue`] runs dequeued work with bounded concurrency, a
//!   per-task cancellation token and an optional timeout.

mod execution;
mod request_queue;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use execution::{ExecutionQueue, TaskHandle, TaskId};
pub use request_queue::{OldestRequest, QueueStats, QueuedRequest, RequestId, RequestQueue};

/// Priority tier of a queued request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Served before everything else
    High,
    /// Default tier
    #[default]
    Normal,
    /// Served only when the other tiers are empty
    Low,
}

impl Priority {
    /// All tiers in service order
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    /// Lowercase wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}
