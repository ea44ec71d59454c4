//! Provider error taxonomy and retry policy.
//!
//! Every backend failure is classified into one of five kinds. Only
//! `RateLimited` and `Timeout` are retried; everything else is surfaced to the
//! supervisor as a terminal step failure.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Credentials rejected. Fatal, never retried.
    AuthError,
    /// Backend asked us to slow down. Retried with backoff.
    RateLimited,
    /// The call did not finish in time. Retried once.
    Timeout,
    /// The model or backend cannot serve the request. Fatal; the UI can
    /// suggest switching providers.
    ModelUnavailable,
    /// The response could not be understood. Fatal, treated as a bug signal.
    MalformedResponse,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthError => "auth_error",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::ModelUnavailable => "model_unavailable",
            Self::MalformedResponse => "malformed_response",
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified provider failure.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    /// Delay requested by the backend (Retry-After), if any.
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::AuthError, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            kind: ProviderErrorKind::RateLimited,
            message: message.into(),
            retry_after,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    pub fn model_unavailable(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::ModelUnavailable, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::MalformedResponse, message)
    }

    /// Build an error from a non-success HTTP response.
    pub fn from_http(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let kind = classify_http_status(status, body);
        let message = format!("HTTP {}: {}", status, truncate_body(body));
        match kind {
            ProviderErrorKind::RateLimited => Self::rate_limited(message, retry_after),
            _ => Self::new(kind, message),
        }
    }

    /// Build an error from a transport-level reqwest failure.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(format!("Request timeout: {}", err))
        } else if err.is_connect() {
            // Unreachable backends get the same single retry as a timeout.
            Self::timeout(format!("Connection failed: {}", err))
        } else if err.is_decode() {
            Self::malformed(format!("Failed to decode response: {}", err))
        } else {
            Self::model_unavailable(format!("Request failed: {}", err))
        }
    }
}

/// Map an HTTP status (and error body) to an error kind.
pub fn classify_http_status(status: u16, body: &str) -> ProviderErrorKind {
    match status {
        401 | 403 => ProviderErrorKind::AuthError,
        429 => ProviderErrorKind::RateLimited,
        408 | 504 => ProviderErrorKind::Timeout,
        400 | 404 | 422 if mentions_model(body) => ProviderErrorKind::ModelUnavailable,
        400..=499 => ProviderErrorKind::MalformedResponse,
        _ => ProviderErrorKind::ModelUnavailable,
    }
}

fn mentions_model(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("model") && (lower.contains("not found") || lower.contains("does not exist") || lower.contains("unavailable") || lower.contains("not a valid"))
}

fn truncate_body(body: &str) -> &str {
    const MAX: usize = 500;
    if body.len() <= MAX {
        return body;
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

/// Retry policy for provider calls.
///
/// Bounds are configuration; see `Config::from_env`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries allowed after a rate-limit response.
    pub max_rate_limit_retries: u32,
    /// Retries allowed after a timeout.
    pub max_timeout_retries: u32,
    /// First backoff delay; doubled on every retry.
    pub base_delay: Duration,
    /// Upper bound for a single backoff delay.
    pub max_delay: Duration,
    /// Bounded wait for one provider call.
    pub call_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_rate_limit_retries: 4,
            max_timeout_retries: 1,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            call_timeout: Duration::from_secs(600),
        }
    }
}

impl RetryConfig {
    /// Whether another attempt is allowed after `retries_so_far` retries of this kind.
    pub fn should_retry(&self, error: &ProviderError, retries_so_far: u32) -> bool {
        match error.kind {
            ProviderErrorKind::RateLimited => retries_so_far < self.max_rate_limit_retries,
            ProviderErrorKind::Timeout => retries_so_far < self.max_timeout_retries,
            _ => false,
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry.min(16)));
        retry_after
            .map(|hint| hint.max(exponential))
            .unwrap_or(exponential)
            .min(self.max_delay)
    }
}

/// Run `op` under the per-call timeout, retrying rate limits and timeouts
/// according to `config`.
pub async fn call_with_retry<T, F, Fut>(
    config: &RetryConfig,
    label: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut rate_limit_retries = 0u32;
    let mut timeout_retries = 0u32;

    loop {
        let result = match tokio::time::timeout(config.call_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::timeout(format!(
                "{} did not respond within {:?}",
                label, config.call_timeout
            ))),
        };

        let error = match result {
            Ok(value) => {
                if rate_limit_retries + timeout_retries > 0 {
                    tracing::info!(
                        "{} succeeded after {} retries",
                        label,
                        rate_limit_retries + timeout_retries
                    );
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        let retries_so_far = match error.kind {
            ProviderErrorKind::RateLimited => &mut rate_limit_retries,
            ProviderErrorKind::Timeout => &mut timeout_retries,
            _ => {
                tracing::error!("{} failed (non-retryable): {}", label, error);
                return Err(error);
            }
        };

        if !config.should_retry(&error, *retries_so_far) {
            tracing::error!(
                "{} failed after {} {} retries: {}",
                label,
                *retries_so_far,
                error.kind,
                error
            );
            return Err(error);
        }

        let delay = config.backoff(*retries_so_far, error.retry_after);
        *retries_so_far += 1;
        tracing::warn!(
            "{} attempt failed with {}, retrying in {:?}: {}",
            label,
            error.kind,
            delay,
            error.message
        );
        tokio::time::sleep(delay).await;
    }
}
