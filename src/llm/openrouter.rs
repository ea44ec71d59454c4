//! OpenRouter chat-completions backend (providers B and C).
//!
//! Chat completions carry no server-side conversation state, so prior step
//! outputs are always re-sent and no continuation handle is returned.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::ProviderError;
use super::{
    format_prior_outputs, ChatMessage, ProviderKind, ResearchProvider, ResearchRequest,
    ResearchResponse, Role, TokenUsage,
};
use crate::budget::estimate_cost_cents;

pub const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// OpenRouter API client bound to one model.
pub struct OpenRouterClient {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    kind: ProviderKind,
}

impl OpenRouterClient {
    pub fn new(kind: ProviderKind, api_key: String, model: String) -> Self {
        Self::with_endpoint(kind, api_key, model, OPENROUTER_API_URL.to_string())
    }

    pub fn with_endpoint(
        kind: ProviderKind,
        api_key: String,
        model: String,
        endpoint: String,
    ) -> Self {
        Self {
            client: Client::new(),
            endpoint,
            api_key,
            model,
            kind,
        }
    }

    /// Parse Retry-After header if present.
    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    fn build_messages(request: &ResearchRequest) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::new(Role::System, &request.system_context)];
        if let Some(context) = format_prior_outputs(&request.prior_outputs) {
            messages.push(ChatMessage::new(Role::User, context));
        }
        messages.push(ChatMessage::new(Role::User, &request.prompt));
        messages
    }

    fn parse_response(&self, body: &str) -> Result<ResearchResponse, ProviderError> {
        let parsed: ChatCompletionResponse = serde_json::from_str(body).map_err(|e| {
            ProviderError::malformed(format!("Failed to parse response: {}", e))
        })?;

        // OpenRouter reports some upstream failures inside a 200 body.
        if let Some(err) = parsed.error {
            let status = err.code.unwrap_or(502);
            return Err(ProviderError::from_http(status, &err.message, None));
        }

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::malformed("No choices in response"))?;

        let output = choice
            .message
            .content
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ProviderError::malformed("Response contained no text"))?;

        let usage = parsed
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens));
        let model = parsed.model.unwrap_or_else(|| self.model.clone());
        let cost_cents = usage
            .as_ref()
            .map(|u| estimate_cost_cents(&model, u))
            .unwrap_or(0);

        Ok(ResearchResponse {
            output,
            continuation: None,
            cost_cents,
            truncated: choice.finish_reason.as_deref() == Some("length"),
            usage,
            model,
        })
    }
}

#[async_trait]
impl ResearchProvider for OpenRouterClient {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn research(&self, request: &ResearchRequest) -> Result<ResearchResponse, ProviderError> {
        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages: Self::build_messages(request),
            max_tokens: request.max_output_tokens,
        };

        tracing::debug!(
            "Sending request to OpenRouter: provider={} model={}",
            self.kind,
            self.model
        );

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("X-Title", "Deep Research")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(&e))?;

        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::from_transport(&e))?;

        if !status.is_success() {
            return Err(ProviderError::from_http(status.as_u16(), &text, retry_after));
        }

        self.parse_response(&text)
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    error: Option<ChatError>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ChatError {
    #[serde(default)]
    code: Option<u16>,
    message: String,
}
