//! Report publishing.
//!
//! The compiled report is POSTed to an external endpoint with an HMAC
//! signature over the exact body bytes. Every attempt gets its own HTTP
//! client with no idle pool; the client is dropped when the attempt ends,
//! whichever way it ends.

mod signing;
mod tracking;

pub use signing::{sign, verify, SIGNATURE_HEADER};
pub use tracking::{recipient_token, tracking_url, TrackingParams};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::llm::ProviderKind;
use crate::render::RenderedReport;
use crate::research::ResearchTask;
use crate::subjects::Subject;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PublishError {
    /// Connection failures, timeouts and 5xx responses. Retried.
    #[error("transient publish failure: {0}")]
    Transient(String),

    /// 4xx responses and unusable replies. Never retried.
    #[error("publish rejected: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishedSubject {
    pub id: i64,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishMetadata {
    pub provider: ProviderKind,
    pub generated_at: DateTime<Utc>,
    pub cost_cents: u64,
    /// Indices of steps whose output was truncated.
    pub truncated_steps: Vec<u8>,
}

/// Body sent to the publish endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PublishRequest {
    pub subject: PublishedSubject,
    pub content: RenderedReport,
    pub metadata: PublishMetadata,
}

impl PublishRequest {
    pub fn new(subject: &Subject, task: &ResearchTask, content: RenderedReport) -> Self {
        Self {
            subject: PublishedSubject {
                id: subject.id,
                name: subject.name.clone(),
                slug: subject.slug(),
            },
            content,
            metadata: PublishMetadata {
                provider: task.provider,
                generated_at: Utc::now(),
                cost_cents: task.cost_cents,
                truncated_steps: task.truncated_steps(),
            },
        }
    }
}

#[async_trait]
pub trait ReportPublisher: Send + Sync {
    /// Publish and return the report URL.
    async fn publish(&self, request: &PublishRequest) -> Result<String, PublishError>;
}

#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub url: String,
    pub secret: String,
    /// Per-attempt request timeout.
    pub timeout: Duration,
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl PublishConfig {
    pub fn new(url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            secret: secret.into(),
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// HTTP publisher with signed bodies and bounded retries.
pub struct HttpPublisher {
    config: PublishConfig,
}

impl HttpPublisher {
    pub fn new(config: PublishConfig) -> Self {
        Self { config }
    }

    async fn attempt(&self, body: &[u8], signature: &str, attempt: u32) -> Result<String, PublishError> {
        let connection = PublishConnection::open(self.config.timeout, attempt)?;

        let response = connection
            .client
            .post(&self.config.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| PublishError::Transient(e.to_string()))?;

        let status = response.status();
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response
            .text()
            .await
            .map_err(|e| PublishError::Transient(e.to_string()))?;

        if status.is_server_error() {
            return Err(PublishError::Transient(format!("{}: {}", status, snippet(&text))));
        }
        if !status.is_success() {
            return Err(PublishError::Fatal(format!("{}: {}", status, snippet(&text))));
        }

        extract_report_url(&text)
            .or(location)
            .ok_or_else(|| PublishError::Fatal("response carried no report url".to_string()))
    }
}

#[async_trait]
impl ReportPublisher for HttpPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<String, PublishError> {
        let body = serde_json::to_vec(request)
            .map_err(|e| PublishError::Fatal(format!("failed to encode body: {}", e)))?;
        let signature = sign(self.config.secret.as_bytes(), &body)
            .map_err(|e| PublishError::Fatal(format!("failed to sign body: {}", e)))?;
        let max_attempts = self.config.max_attempts.max(1);

        let mut attempt = 1;
        loop {
            match self.attempt(&body, &signature, attempt).await {
                Ok(url) => {
                    tracing::info!(
                        subject_id = request.subject.id,
                        attempt,
                        "Published report to {}",
                        url
                    );
                    return Ok(url);
                }
                Err(PublishError::Transient(message)) if attempt < max_attempts => {
                    let delay = self.config.backoff(attempt);
                    tracing::warn!(
                        subject_id = request.subject.id,
                        attempt,
                        "Publish attempt failed ({}), retrying in {:?}",
                        message,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(subject_id = request.subject.id, attempt, "Publish failed: {}", e);
                    return Err(e);
                }
            }
        }
    }
}

/// HTTP client owned by a single publish attempt.
struct PublishConnection {
    client: reqwest::Client,
    attempt: u32,
}

impl PublishConnection {
    fn open(timeout: Duration, attempt: u32) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .timeout(timeout)
            .build()
            .map_err(|e| PublishError::Fatal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, attempt })
    }
}

impl Drop for PublishConnection {
    fn drop(&mut self) {
        tracing::debug!(attempt = self.attempt, "Released publish connection");
    }
}

fn extract_report_url(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    ["url", "location", "report_url"]
        .iter()
        .find_map(|key| value.get(*key).and_then(|v| v.as_str()))
        .filter(|url| !url.is_empty())
        .map(str::to_string)
}

fn snippet(text: &str) -> String {
    text.chars().take(200).collect()
}
