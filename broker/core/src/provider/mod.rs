//! LLM Providers
//!
//! The uniform provider abstraction the pools are built on, plus the
//! built-in Ollama implementation and the factory that maps provider type
//! names to implementations.

mod ollama;
mod traits;

use std::sync::Arc;

pub use ollama::{OllamaProvider, DEFAULT_OLLAMA_ENDPOINT};
pub use traits::{
    CompletionRequest, CompletionResponse, HttpStatusError, ModelInfo, Provider, ProviderConfig,
    ProviderFactory, StreamingToken,
};

use crate::error::{ConnectionError, ErrorCode};

/// Factory for the built-in provider types
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultProviderFactory;

impl DefaultProviderFactory {
    /// Provider types this factory understands
    pub const SUPPORTED_TYPES: &'static [&'static str] = &["ollama"];
}

impl ProviderFactory for DefaultProviderFactory {
    fn create_provider(
        &self,
        provider_type: &str,
        config: &ProviderConfig,
    ) -> anyhow::Result<Arc<dyn Provider>> {
        match provider_type {
            "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
            other => Err(ConnectionError::new(
                ErrorCode::InvalidRequest,
                format!(
                    "unknown provider type '{other}' (supported: {})",
                    Self::SUPPORTED_TYPES.join(", ")
                ),
            )
            .into()),
        }
    }
}
