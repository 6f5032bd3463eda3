//! Shared fixtures for the broker integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use broker_core::{
    BrokerEvent, CompletionRequest, CompletionResponse, ConnectionError, ErrorCode, HealthRecord,
    ModelInfo, PoolConfig, Provider, ProviderConfig, ProviderFactory, StreamingToken,
};

/// Switches and counters shared by every provider a [`TestFactory`] builds
#[derive(Default)]
pub struct Backend {
    pub unhealthy: AtomicBool,
    pub refuse_connect: AtomicBool,
    pub created: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub calls: AtomicUsize,
    pub failures: Mutex<VecDeque<ErrorCode>>,
    pub prompts: Mutex<Vec<String>>,
    pub latency_ms: AtomicU64,
    pub health_delay_ms: AtomicU64,
    pub stream_gap_ms: AtomicU64,
}

impl Backend {
    pub fn set_healthy(&self, healthy: bool) {
        self.unhealthy.store(!healthy, Ordering::SeqCst);
    }

    pub fn fail_next(&self, code: ErrorCode, times: usize) {
        let mut failures = self.failures.lock().unwrap();
        failures.extend(std::iter::repeat(code).take(times));
    }

    /// Delay every completion
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay every health check
    pub fn set_health_delay(&self, delay: Duration) {
        self.health_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Pause between the token and the end of a stream
    pub fn set_stream_gap(&self, gap: Duration) {
        self.stream_gap_ms.store(gap.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts in the order the backend saw them
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

pub struct TestProvider {
    backend: Arc<Backend>,
}

#[async_trait]
impl Provider for TestProvider {
    fn provider_type(&self) -> &str {
        "test"
    }

    async fn connect(&self) -> anyhow::Result<()> {
        if self.backend.refuse_connect.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.backend.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn health_check(&self) -> anyhow::Result<HealthRecord> {
        let delay = self.backend.health_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.backend.unhealthy.load(Ordering::SeqCst) {
            anyhow::bail!("503 service unavailable");
        }
        Ok(HealthRecord::healthy(2))
    }

    async fn generate_completion(
        &self,
        request: &CompletionRequest,
    ) -> anyhow::Result<CompletionResponse> {
        self.backend.calls.fetch_add(1, Ordering::SeqCst);
        self.backend.prompts.lock().unwrap().push(request.prompt.clone());
        let latency = self.backend.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        let failure = self.backend.failures.lock().unwrap().pop_front();
        if let Some(code) = failure {
            return Err(ConnectionError::new(code, "injected failure").into());
        }
        Ok(CompletionResponse {
            content: request.prompt.to_uppercase(),
            model: "test-model".to_string(),
            tokens_used: None,
            duration_ms: None,
        })
    }

    async fn stream_completion(
        &self,
        request: &CompletionRequest,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>> {
        let (tx, rx) = mpsc::channel(4);
        let gap = Duration::from_millis(self.backend.stream_gap_ms.load(Ordering::SeqCst));
        let prompt = request.prompt.clone();
        tokio::spawn(async move {
            if tx.send(StreamingToken::Token(prompt.clone())).await.is_err() {
                return;
            }
            tokio::time::sleep(gap).await;
            let _ = tx.send(StreamingToken::Complete { message: prompt }).await;
        });
        Ok(rx)
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        Ok(Vec::new())
    }
}

#[derive(Clone, Default)]
pub struct TestFactory {
    pub backend: Arc<Backend>,
}

impl TestFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProviderFactory for TestFactory {
    fn create_provider(
        &self,
        _provider_type: &str,
        _config: &ProviderConfig,
    ) -> anyhow::Result<Arc<dyn Provider>> {
        self.backend.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(TestProvider {
            backend: Arc::clone(&self.backend),
        }))
    }
}

pub fn pool_config(min_size: usize, max_size: usize) -> PoolConfig {
    PoolConfig {
        min_size,
        max_size,
        idle_timeout_ms: 10_000,
        acquire_timeout_ms: 1_000,
    }
}

/// Drain whatever events are buffered, returning their names
pub fn drain_names(rx: &mut broadcast::Receiver<BrokerEvent>) -> Vec<&'static str> {
    std::iter::from_fn(|| rx.try_recv().ok().map(|e| e.name())).collect()
}

/// Wait for the first event matching `pred`
pub async fn wait_for<F>(
    rx: &mut broadcast::Receiver<BrokerEvent>,
    limit: Duration,
    pred: F,
) -> Option<BrokerEvent>
where
    F: Fn(&BrokerEvent) -> bool,
{
    tokio::time::timeout(limit, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}
