//! Error Classification and Retry
//!
//! The [`ErrorHandler`] turns arbitrary provider failures into a
//! [`ConnectionError`] with a stable [`ErrorCode`], decides whether the code
//! may be retried and, if so, sleeps for an exponential backoff with jitter
//! before telling the caller to go again.
//!
//! # Backoff
//!
//! ```text
//! delay(attempt) = min(base * 2^attempt + jitter, max_delay)
//! jitter         = uniform(0, jitter_factor * base * 2^attempt)
//! ```
//!
//! Attempt counters are keyed per logical request and error code, and are
//! dropped when the request succeeds, fails permanently, or runs out of
//! retries.

use std::time::Duration;

use dashmap::DashMap;
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::error::{BrokerError, ConnectionError, ErrorCode};
use crate::provider::HttpStatusError;

// ============================================================================
// Classification
// ============================================================================

/// Map an HTTP status to an error code
#[must_use]
pub fn code_for_status(status: u16) -> ErrorCode {
    match status {
        408 => ErrorCode::Timeout,
        429 => ErrorCode::RateLimited,
        401 | 403 => ErrorCode::AuthenticationFailed,
        404 => ErrorCode::ModelNotFound,
        502..=504 => ErrorCode::ServiceUnavailable,
        400..=499 => ErrorCode::InvalidRequest,
        500..=599 => ErrorCode::ServiceUnavailable,
        _ => ErrorCode::Unknown,
    }
}

const KEYWORDS: &[(&str, ErrorCode)] = &[
    ("econnrefused", ErrorCode::NetworkError),
    ("connection refused", ErrorCode::NetworkError),
    ("econnreset", ErrorCode::NetworkError),
    ("connection reset", ErrorCode::NetworkError),
    ("enotfound", ErrorCode::NetworkError),
    ("broken pipe", ErrorCode::NetworkError),
    ("network", ErrorCode::NetworkError),
    ("etimedout", ErrorCode::Timeout),
    ("timed out", ErrorCode::Timeout),
    ("timeout", ErrorCode::Timeout),
    ("rate limit", ErrorCode::RateLimited),
    ("too many requests", ErrorCode::RateLimited),
    ("service unavailable", ErrorCode::ServiceUnavailable),
    ("bad gateway", ErrorCode::ServiceUnavailable),
    ("overloaded", ErrorCode::ServiceUnavailable),
    ("unauthorized", ErrorCode::AuthenticationFailed),
    ("forbidden", ErrorCode::AuthenticationFailed),
    ("invalid api key", ErrorCode::AuthenticationFailed),
    ("model not found", ErrorCode::ModelNotFound),
];

fn code_for_message(message: &str) -> ErrorCode {
    let lower = message.to_ascii_lowercase();
    KEYWORDS
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map_or(ErrorCode::Unknown, |(_, code)| *code)
}

/// Classify an error by walking its cause chain.
///
/// Already-classified errors keep their code; HTTP statuses and `reqwest`
/// flags come next; message keywords are the last resort.
#[must_use]
pub fn classify(error: &anyhow::Error) -> ErrorCode {
    for cause in error.chain() {
        if let Some(classified) = cause.downcast_ref::<ConnectionError>() {
            return classified.code;
        }
        if let Some(http) = cause.downcast_ref::<HttpStatusError>() {
            return code_for_status(http.status);
        }
        if let Some(req) = cause.downcast_ref::<reqwest::Error>() {
            if req.is_timeout() {
                return ErrorCode::Timeout;
            }
            if req.is_connect() {
                return ErrorCode::NetworkError;
            }
            if let Some(status) = req.status() {
                return code_for_status(status.as_u16());
            }
        }
    }
    code_for_message(&format!("{error:#}"))
}

/// Normalise an error into a [`ConnectionError`] for `provider_id`
#[must_use]
pub fn normalize(error: anyhow::Error, provider_id: &str) -> ConnectionError {
    let error = match error.downcast::<ConnectionError>() {
        Ok(mut classified) => {
            if classified.provider_id.is_none() {
                classified.provider_id = Some(provider_id.to_string());
            }
            return classified;
        }
        Err(error) => error,
    };
    let code = classify(&error);
    ConnectionError::new(code, format!("{error:#}"))
        .with_provider(provider_id)
        .with_source(error)
}

// ============================================================================
// Error Handler
// ============================================================================

/// Decides retries and applies backoff
pub struct ErrorHandler {
    config: RetryConfig,
    attempts: DashMap<String, u32>,
}

impl ErrorHandler {
    /// Create a handler with the given policy
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempts: DashMap::new(),
        }
    }

    /// Retry policy in use
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Counter key for one request and error code
    #[must_use]
    pub fn retry_key(request_id: &Uuid, code: ErrorCode) -> String {
        format!("{request_id}:{code}")
    }

    /// Decide what to do about a failed attempt.
    ///
    /// Returns `Ok(())` after sleeping for the backoff delay when the caller
    /// should try again, or the error to surface otherwise.
    ///
    /// # Errors
    ///
    /// - `BrokerError::Connection` for non-retryable codes
    /// - `BrokerError::RetriesExhausted` once `max_retries` retries were spent
    pub async fn handle_error(
        &self,
        request_id: &Uuid,
        provider_id: &str,
        error: ConnectionError,
    ) -> Result<(), BrokerError> {
        let key = Self::retry_key(request_id, error.code);

        if !error.is_retryable() {
            self.attempts.remove(&key);
            tracing::debug!(
                provider_id = %provider_id,
                code = %error.code,
                "Error is not retryable"
            );
            return Err(BrokerError::Connection {
                provider_id: provider_id.to_string(),
                source: error,
            });
        }

        let attempt = {
            let mut entry = self.attempts.entry(key.clone()).or_insert(0);
            let attempt = *entry;
            if attempt < self.config.max_retries {
                *entry += 1;
            }
            attempt
        };

        if attempt >= self.config.max_retries {
            self.attempts.remove(&key);
            tracing::error!(
                provider_id = %provider_id,
                code = %error.code,
                attempts = attempt + 1,
                "Retries exhausted"
            );
            return Err(BrokerError::RetriesExhausted {
                provider_id: provider_id.to_string(),
                attempts: attempt + 1,
                source: error,
            });
        }

        let delay = self.backoff_delay(attempt);
        tracing::warn!(
            provider_id = %provider_id,
            code = %error.code,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "Retrying after transient error"
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }

    /// Backoff for `attempt` with random jitter
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_delay_with_jitter(attempt, rand::random::<f64>())
    }

    /// Backoff for `attempt` with the jitter position fixed to `fraction`
    /// (0.0 = no jitter, 1.0 = full jitter)
    #[must_use]
    pub fn backoff_delay_with_jitter(&self, attempt: u32, fraction: f64) -> Duration {
        let exponential = self.config.base_delay_ms as f64 * 2f64.powi(attempt.min(62) as i32);
        let jitter = exponential * self.config.jitter_factor * fraction.clamp(0.0, 1.0);
        let capped = (exponential + jitter).min(self.config.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Retries recorded so far for a request and code
    #[must_use]
    pub fn attempts(&self, request_id: &Uuid, code: ErrorCode) -> u32 {
        self.attempts
            .get(&Self::retry_key(request_id, code))
            .map_or(0, |v| *v)
    }

    /// Forget every counter belonging to a request
    pub fn clear(&self, request_id: &Uuid) {
        let prefix = format!("{request_id}:");
        self.attempts.retain(|key, _| !key.starts_with(&prefix));
    }

    /// Number of live retry counters
    #[must_use]
    pub fn active_retries(&self) -> usize {
        self.attempts.len()
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
