//! Provider Traits
//!
//! A provider is one live handle to an LLM backend. The pool owns providers
//! and hands them to callers for the duration of a single call; the pool
//! never constructs one itself and goes through a [`ProviderFactory`].
//!
//! Implementations return `anyhow::Result`. The broker classifies failures
//! by walking the cause chain, so implementations should surface HTTP status
//! failures as [`HttpStatusError`] and keep `reqwest` errors in the chain.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::health::HealthRecord;

/// Token stream events from a streaming completion
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamingToken {
    /// A token from the response
    Token(String),
    /// Response completed successfully
    Complete {
        /// The complete message
        message: String,
    },
    /// Error occurred during streaming
    Error(String),
}

/// A completion request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// The prompt to complete
    pub prompt: String,
    /// Model to use; the provider's configured model when `None`
    pub model: Option<String>,
    /// Maximum tokens in the response (0 = backend default)
    pub max_tokens: u32,
    /// Sampling temperature (0.0-1.0)
    pub temperature: f32,
    /// System prompt prepended to the conversation
    pub system: Option<String>,
    /// Prior conversation rendered as text
    pub context: Option<String>,
}

impl Default for CompletionRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            model: None,
            max_tokens: 0,
            temperature: 0.7,
            system: None,
            context: None,
        }
    }
}

impl CompletionRequest {
    /// Create a request for a prompt
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Pin the model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set temperature (clamped to 0.0-1.0)
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 1.0);
        self
    }

    /// Set system prompt
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Set conversation context
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Response from a non-streaming completion
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Generated text
    pub content: String,
    /// Model that produced it
    pub model: String,
    /// Tokens generated (if reported)
    pub tokens_used: Option<u32>,
    /// Generation time in milliseconds
    pub duration_ms: Option<u64>,
}

/// A model offered by a backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier
    pub name: String,
    /// Size on disk in bytes (if known)
    pub size: Option<u64>,
    /// Parameter count label (e.g. "8B")
    pub parameters: Option<String>,
}

/// Non-2xx HTTP response from a backend
#[derive(Debug, Error)]
#[error("backend returned HTTP {status}: {body}")]
pub struct HttpStatusError {
    /// Status code
    pub status: u16,
    /// Response body (possibly truncated)
    pub body: String,
}

/// Settings handed to the factory for every connection it creates
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Backend base URL
    pub endpoint: Option<String>,
    /// Default model
    pub model: Option<String>,
    /// Credential for remote APIs
    pub api_key: Option<String>,
    /// Per-request timeout (0 = provider default)
    pub request_timeout_ms: u64,
    /// Provider-specific options
    pub options: HashMap<String, String>,
}

impl ProviderConfig {
    /// Configuration pointing at an endpoint
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..Default::default()
        }
    }

    /// Set the default model
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Ollama location from `OLLAMA_HOST` / `OLLAMA_PORT`
    #[must_use]
    pub fn ollama_from_env() -> Self {
        let host = std::env::var("OLLAMA_HOST").unwrap_or_else(|_| "localhost".to_string());
        let port: u16 = std::env::var("OLLAMA_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(11434);
        let endpoint = if host.starts_with("http://") || host.starts_with("https://") {
            host
        } else {
            format!("http://{host}:{port}")
        };
        let mut config = Self::with_endpoint(endpoint);
        config.model = std::env::var("OLLAMA_MODEL").ok();
        config
    }
}

/// A live handle to one backend instance
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider type (e.g. "ollama")
    fn provider_type(&self) -> &str;

    /// Open the handle
    async fn connect(&self) -> anyhow::Result<()>;

    /// Close the handle
    async fn disconnect(&self) -> anyhow::Result<()>;

    /// Probe liveness and latency
    async fn health_check(&self) -> anyhow::Result<HealthRecord>;

    /// Generate a complete response
    async fn generate_completion(
        &self,
        request: &CompletionRequest,
    ) -> anyhow::Result<CompletionResponse>;

    /// Generate a streamed response.
    ///
    /// The channel closes after `Complete` or `Error`.
    async fn stream_completion(
        &self,
        request: &CompletionRequest,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>>;

    /// List models offered by the backend
    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>>;

    /// Check if a specific model is available
    async fn has_model(&self, model: &str) -> anyhow::Result<bool> {
        let models = self.list_models().await?;
        Ok(models.iter().any(|m| m.name == model))
    }
}

/// Builds providers for the pool
pub trait ProviderFactory: Send + Sync {
    /// Create an unconnected provider of the given type
    ///
    /// # Errors
    ///
    /// Returns an error for unknown types or unusable configuration.
    fn create_provider(
        &self,
        provider_type: &str,
        config: &ProviderConfig,
    ) -> anyhow::Result<Arc<dyn Provider>>;
}
