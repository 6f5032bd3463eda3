//! Test Utilities
//!
//! Scriptable mock providers for exercising the pool, retry and manager paths
//! without a real backend.
//!
//! # Usage
//!
//! ```ignore
//! use broker_core::test_utils::MockFactory;
//!
//! let factory = MockFactory::new();
//! let control = factory.control();
//!
//! // Fail the next completion with a retryable error
//! control.push_failure(ErrorCode::Timeout);
//!
//! // Every health check from now on reports unhealthy
//! control.set_healthy(false);
//!
//! assert_eq!(control.connects(), 2);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{ConnectionError, ErrorCode};
use crate::health::HealthRecord;
use crate::provider::{
    CompletionRequest, CompletionResponse, ModelInfo, Provider, ProviderConfig, ProviderFactory,
    StreamingToken,
};

// ============================================================================
// Mock Control
// ============================================================================

/// Shared switches and counters for every provider a [`MockFactory`] builds
#[derive(Debug, Default)]
pub struct MockControl {
    connect_fails: AtomicBool,
    unhealthy: AtomicBool,
    disconnect_fails: AtomicBool,
    create_fails: AtomicBool,
    latency_ms: AtomicU64,
    health_latency_ms: AtomicU64,
    failures: Mutex<VecDeque<ErrorCode>>,
    created: AtomicUsize,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    health_checks: AtomicUsize,
    completions: AtomicUsize,
}

impl MockControl {
    /// Make `connect` fail with a network error
    pub fn set_connect_failure(&self, fail: bool) {
        self.connect_fails.store(fail, Ordering::SeqCst);
    }

    /// Make the factory itself fail
    pub fn set_create_failure(&self, fail: bool) {
        self.create_fails.store(fail, Ordering::SeqCst);
    }

    /// Choose what `health_check` reports
    pub fn set_healthy(&self, healthy: bool) {
        self.unhealthy.store(!healthy, Ordering::SeqCst);
    }

    /// Make `disconnect` fail
    pub fn set_disconnect_failure(&self, fail: bool) {
        self.disconnect_fails.store(fail, Ordering::SeqCst);
    }

    /// Delay every completion
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay every health check
    pub fn set_health_latency(&self, latency: Duration) {
        self.health_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Fail the next completion with `code`; queued failures are consumed in order
    pub fn push_failure(&self, code: ErrorCode) {
        self.failures.lock().push_back(code);
    }

    /// Providers built by the factory
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Successful and failed `connect` calls
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// `disconnect` calls
    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// `health_check` calls
    pub fn health_checks(&self) -> usize {
        self.health_checks.load(Ordering::SeqCst)
    }

    /// `generate_completion` and `stream_completion` calls
    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Mock Provider
// ============================================================================

/// Provider whose behaviour is driven by a shared [`MockControl`]
pub struct MockProvider {
    serial: usize,
    control: Arc<MockControl>,
}

impl MockProvider {
    /// Position in creation order, starting at 1
    pub fn serial(&self) -> usize {
        self.serial
    }

    async fn begin_completion(&self) -> anyhow::Result<()> {
        self.control.completions.fetch_add(1, Ordering::SeqCst);
        let latency = self.control.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        let failure = self.control.failures.lock().pop_front();
        match failure {
            Some(code) => Err(ConnectionError::new(code, format!("scripted {code} failure")).into()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn provider_type(&self) -> &str {
        "mock"
    }

    async fn connect(&self) -> anyhow::Result<()> {
        self.control.connects.fetch_add(1, Ordering::SeqCst);
        if self.control.connect_fails.load(Ordering::SeqCst) {
            anyhow::bail!("ECONNREFUSED: mock backend refused connection");
        }
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.control.disconnects.fetch_add(1, Ordering::SeqCst);
        if self.control.disconnect_fails.load(Ordering::SeqCst) {
            anyhow::bail!("mock disconnect failed");
        }
        Ok(())
    }

    async fn health_check(&self) -> anyhow::Result<HealthRecord> {
        self.control.health_checks.fetch_add(1, Ordering::SeqCst);
        let latency = self.control.health_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.control.unhealthy.load(Ordering::SeqCst) {
            Ok(HealthRecord::unhealthy("mock backend unhealthy"))
        } else {
            Ok(HealthRecord::healthy(1))
        }
    }

    async fn generate_completion(
        &self,
        request: &CompletionRequest,
    ) -> anyhow::Result<CompletionResponse> {
        self.begin_completion().await?;
        Ok(CompletionResponse {
            content: format!("echo: {}", request.prompt),
            model: request.model.clone().unwrap_or_else(|| "mock-model".to_string()),
            tokens_used: Some(request.prompt.split_whitespace().count() as u32),
            duration_ms: Some(self.control.latency_ms.load(Ordering::SeqCst)),
        })
    }

    async fn stream_completion(
        &self,
        request: &CompletionRequest,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>> {
        self.begin_completion().await?;
        let words: Vec<String> = request
            .prompt
            .split_whitespace()
            .map(ToString::to_string)
            .collect();
        let (tx, rx) = mpsc::channel(words.len() + 1);
        for word in &words {
            let _ = tx.try_send(StreamingToken::Token(word.clone()));
        }
        let _ = tx.try_send(StreamingToken::Complete {
            message: words.join(" "),
        });
        Ok(rx)
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        Ok(vec![ModelInfo {
            name: "mock-model".to_string(),
            size: None,
            parameters: None,
        }])
    }
}

// ============================================================================
// Mock Factory
// ============================================================================

/// Factory building [`MockProvider`]s that share one [`MockControl`]
#[derive(Clone, Default)]
pub struct MockFactory {
    control: Arc<MockControl>,
}

impl MockFactory {
    /// Factory with every switch off
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches and counters shared by every built provider
    pub fn control(&self) -> Arc<MockControl> {
        Arc::clone(&self.control)
    }
}

impl ProviderFactory for MockFactory {
    fn create_provider(
        &self,
        _provider_type: &str,
        _config: &ProviderConfig,
    ) -> anyhow::Result<Arc<dyn Provider>> {
        if self.control.create_fails.load(Ordering::SeqCst) {
            anyhow::bail!("mock factory refused to build a provider");
        }
        let serial = self.control.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(MockProvider {
            serial,
            control: Arc::clone(&self.control),
        }))
    }
}
