//! Provider adapter layer.
//!
//! Research backends are hidden behind the [`ResearchProvider`] trait. Three
//! variants exist:
//!
//! - **A**: Responses-style API with live web retrieval and a continuation
//!   handle (`previous_response_id`) that lets later steps skip re-sending
//!   prior context.
//! - **B**: chat completions through OpenRouter, no web retrieval.
//! - **C**: chat completions against a search-grounded model.
//!
//! Every variant is wrapped in [`RetryingProvider`], so rate limits and
//! timeouts are handled the same way regardless of backend.

mod error;
mod openrouter;
mod responses;

pub use error::{
    call_with_retry, classify_http_status, ProviderError, ProviderErrorKind, RetryConfig,
};
pub use openrouter::OpenRouterClient;
pub use responses::ResponsesClient;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Which research backend a task uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[serde(alias = "a", alias = "A")]
    ProviderA,
    #[serde(alias = "b", alias = "B")]
    ProviderB,
    #[serde(alias = "c", alias = "C")]
    ProviderC,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [Self::ProviderA, Self::ProviderB, Self::ProviderC];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProviderA => "provider_a",
            Self::ProviderB => "provider_b",
            Self::ProviderC => "provider_c",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::ProviderA => "Web research (Responses API)",
            Self::ProviderB => "OpenRouter chat",
            Self::ProviderC => "Search-grounded chat",
        }
    }

    /// Whether the backend retrieves live web content while answering.
    pub fn has_web_retrieval(&self) -> bool {
        matches!(self, Self::ProviderA | Self::ProviderC)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "provider_a" | "a" => Ok(Self::ProviderA),
            "provider_b" | "b" => Ok(Self::ProviderB),
            "provider_c" | "c" => Ok(Self::ProviderC),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

/// Output of an earlier step handed to a later one as context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorOutput {
    pub label: String,
    pub content: String,
}

/// A single research call.
#[derive(Debug, Clone)]
pub struct ResearchRequest {
    /// System instructions for the backend.
    pub system_context: String,
    /// Outputs of completed earlier steps, oldest first.
    pub prior_outputs: Vec<PriorOutput>,
    /// The instruction for this step.
    pub prompt: String,
    /// Handle returned by a previous call, if the backend supports one.
    pub continuation: Option<String>,
    pub max_output_tokens: Option<u64>,
}

/// Token usage reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Create a usage object ensuring `total_tokens` is consistent.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// Result of a research call.
#[derive(Debug, Clone)]
pub struct ResearchResponse {
    pub output: String,
    /// New continuation handle; `None` when the backend has none.
    pub continuation: Option<String>,
    /// Estimated cost of this call in cents.
    pub cost_cents: u64,
    /// The backend stopped early (token limit) and the output is incomplete.
    pub truncated: bool,
    pub usage: Option<TokenUsage>,
    pub model: String,
}

/// Uniform contract over research backends.
#[async_trait]
pub trait ResearchProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn research(&self, request: &ResearchRequest) -> Result<ResearchResponse, ProviderError>;
}

pub type ProviderRef = Arc<dyn ResearchProvider>;

/// Decorator applying the shared timeout and retry policy to a backend.
pub struct RetryingProvider {
    inner: ProviderRef,
    retry: RetryConfig,
}

impl RetryingProvider {
    pub fn new(inner: ProviderRef, retry: RetryConfig) -> Self {
        Self { inner, retry }
    }
}

#[async_trait]
impl ResearchProvider for RetryingProvider {
    fn kind(&self) -> ProviderKind {
        self.inner.kind()
    }

    async fn research(&self, request: &ResearchRequest) -> Result<ResearchResponse, ProviderError> {
        let label = format!("{} research call", self.inner.kind());
        call_with_retry(&self.retry, &label, || self.inner.research(request)).await
    }
}

/// The configured backends, keyed by variant.
#[derive(Default, Clone)]
pub struct ProviderSet {
    providers: HashMap<ProviderKind, ProviderRef>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend, wrapping it in the retry policy.
    pub fn with_retrying(mut self, provider: ProviderRef, retry: RetryConfig) -> Self {
        let kind = provider.kind();
        self.providers
            .insert(kind, Arc::new(RetryingProvider::new(provider, retry)));
        self
    }

    /// Register a backend as-is.
    pub fn with(mut self, provider: ProviderRef) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Option<ProviderRef> {
        self.providers.get(&kind).cloned()
    }

    pub fn configured(&self) -> Vec<ProviderKind> {
        ProviderKind::ALL
            .into_iter()
            .filter(|k| self.providers.contains_key(k))
            .collect()
    }
}

/// Role in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        ChatMessage {
            role,
            content: content.into(),
        }
    }
}

/// Render prior outputs as one block of context text.
pub(crate) fn format_prior_outputs(prior: &[PriorOutput]) -> Option<String> {
    if prior.is_empty() {
        return None;
    }
    let sections: Vec<String> = prior
        .iter()
        .map(|p| format!("## {}\n\n{}", p.label, p.content.trim()))
        .collect();
    Some(format!(
        "Context from earlier research steps:\n\n{}",
        sections.join("\n\n")
    ))
}
