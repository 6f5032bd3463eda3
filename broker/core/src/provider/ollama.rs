//! Ollama Provider
//!
//! HTTP provider for a local or remote Ollama server.
//!
//! - `/api/generate` - completions (batch and newline-delimited JSON stream)
//! - `/api/tags` - model listing; doubles as the reachability probe

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use super::traits::{
    CompletionRequest, CompletionResponse, HttpStatusError, ModelInfo, Provider, ProviderConfig,
    StreamingToken,
};
use crate::health::HealthRecord;

/// Default Ollama endpoint
pub const DEFAULT_OLLAMA_ENDPOINT: &str = "http://localhost:11434";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_ERROR_BODY: usize = 512;

/// Ollama HTTP provider
pub struct OllamaProvider {
    base_url: String,
    model: Option<String>,
    http_client: reqwest::Client,
    connected: AtomicBool,
}

impl OllamaProvider {
    /// Create a provider from configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &ProviderConfig) -> anyhow::Result<Self> {
        let timeout = if config.request_timeout_ms > 0 {
            Duration::from_millis(config.request_timeout_ms)
        } else {
            DEFAULT_REQUEST_TIMEOUT
        };
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = config
            .endpoint
            .as_deref()
            .unwrap_or(DEFAULT_OLLAMA_ENDPOINT)
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            base_url,
            model: config.model.clone(),
            http_client,
            connected: AtomicBool::new(false),
        })
    }

    /// Base URL of the server
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Whether `connect` succeeded and `disconnect` has not been called
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }

    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url)
    }

    fn resolve_model(&self, request: &CompletionRequest) -> anyhow::Result<String> {
        request
            .model
            .clone()
            .or_else(|| self.model.clone())
            .ok_or_else(|| anyhow::Error::new(HttpStatusError {
                status: 400,
                body: "no model given and no default model configured".to_string(),
            }))
    }

    /// System prompt, context and prompt joined the way Ollama's raw
    /// generate endpoint expects them
    fn build_prompt(request: &CompletionRequest) -> String {
        let mut full = String::new();
        if let Some(system) = &request.system {
            full.push_str(system);
            full.push_str("\n\n");
        }
        if let Some(context) = &request.context {
            full.push_str(context);
            full.push('\n');
        }
        full.push_str(&request.prompt);
        full
    }

    fn request_body(model: &str, request: &CompletionRequest, stream: bool) -> serde_json::Value {
        let mut options = serde_json::Map::new();
        options.insert("temperature".to_string(), serde_json::json!(request.temperature));
        if request.max_tokens > 0 {
            options.insert("num_predict".to_string(), serde_json::json!(request.max_tokens));
        }
        serde_json::json!({
            "model": model,
            "prompt": Self::build_prompt(request),
            "stream": stream,
            "options": options,
        })
    }

    /// Turn a non-2xx response into an `HttpStatusError`
    async fn check_status(response: reqwest::Response) -> anyhow::Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let mut body = response.text().await.unwrap_or_default();
        body.truncate(MAX_ERROR_BODY);
        Err(HttpStatusError {
            status: status.as_u16(),
            body,
        }
        .into())
    }
}

/// Splits raw stream bytes into lines. Bytes are only decoded once a full
/// line is buffered, so characters split across chunks survive intact.
#[derive(Default)]
struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.bytes.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.bytes.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line).trim().to_string())
    }
}

/// One line of the generate stream
enum StreamLine {
    Token(String),
    Done,
    Skip,
}

fn parse_stream_line(line: &str) -> StreamLine {
    let Ok(data) = serde_json::from_str::<serde_json::Value>(line) else {
        return StreamLine::Skip;
    };
    if data
        .get("done")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
    {
        return StreamLine::Done;
    }
    match data.get("response").and_then(|r| r.as_str()) {
        Some(token) if !token.is_empty() => StreamLine::Token(token.to_string()),
        _ => StreamLine::Skip,
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn provider_type(&self) -> &str {
        "ollama"
    }

    async fn connect(&self) -> anyhow::Result<()> {
        let response = self
            .http_client
            .get(self.tags_url())
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?;
        Self::check_status(response).await?;
        self.connected.store(true, Ordering::Release);
        tracing::debug!(endpoint = %self.base_url, "Connected to Ollama");
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        // HTTP keeps no session; just stop claiming to be connected
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    async fn health_check(&self) -> anyhow::Result<HealthRecord> {
        let start = Instant::now();
        let result = self
            .http_client
            .get(self.tags_url())
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        Ok(match result {
            Ok(response) if response.status().is_success() => HealthRecord::healthy(latency_ms),
            Ok(response) => HealthRecord::unhealthy(format!("HTTP {}", response.status()))
                .with_latency(latency_ms),
            Err(e) => HealthRecord::unhealthy(e.to_string()).with_latency(latency_ms),
        })
    }

    async fn generate_completion(
        &self,
        request: &CompletionRequest,
    ) -> anyhow::Result<CompletionResponse> {
        let start = Instant::now();
        let model = self.resolve_model(request)?;
        let response = self
            .http_client
            .post(self.generate_url())
            .json(&Self::request_body(&model, request, false))
            .send()
            .await?;
        let data: serde_json::Value = Self::check_status(response).await?.json().await?;

        Ok(CompletionResponse {
            content: data
                .get("response")
                .and_then(|r| r.as_str())
                .unwrap_or_default()
                .to_string(),
            model,
            tokens_used: data
                .get("eval_count")
                .and_then(serde_json::Value::as_u64)
                .map(|c| c as u32),
            duration_ms: Some(start.elapsed().as_millis() as u64),
        })
    }

    async fn stream_completion(
        &self,
        request: &CompletionRequest,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>> {
        let model = self.resolve_model(request)?;
        let response = self
            .http_client
            .post(self.generate_url())
            .json(&Self::request_body(&model, request, true))
            .send()
            .await?;
        let mut stream = Self::check_status(response).await?.bytes_stream();
        let (tx, rx) = mpsc::channel(100);

        tokio::spawn(async move {
            let mut buffer = LineBuffer::default();
            let mut message = String::new();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(StreamingToken::Error(e.to_string())).await;
                        return;
                    }
                };
                buffer.push(&bytes);

                while let Some(line) = buffer.next_line() {
                    match parse_stream_line(&line) {
                        StreamLine::Token(token) => {
                            message.push_str(&token);
                            if tx.send(StreamingToken::Token(token)).await.is_err() {
                                return;
                            }
                        }
                        StreamLine::Done => {
                            let _ = tx.send(StreamingToken::Complete { message }).await;
                            return;
                        }
                        StreamLine::Skip => {}
                    }
                }
            }

            // Stream ended without a done marker
            if !message.is_empty() {
                let _ = tx.send(StreamingToken::Complete { message }).await;
            }
        });

        Ok(rx)
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        let response = self
            .http_client
            .get(self.tags_url())
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        let data: serde_json::Value = Self::check_status(response).await?.json().await?;

        Ok(data
            .get("models")
            .and_then(|m| m.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| {
                        Some(ModelInfo {
                            name: m.get("name")?.as_str()?.to_string(),
                            size: m.get("size").and_then(serde_json::Value::as_u64),
                            parameters: m
                                .get("details")
                                .and_then(|d| d.get("parameter_size"))
                                .and_then(|p| p.as_str())
                                .map(String::from),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}
