//! Responses API backend with live web search (provider A).
//!
//! The response id doubles as the continuation handle: when a later step
//! passes it back as `previous_response_id`, the earlier conversation is
//! already known server-side and prior outputs are not re-sent.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use super::error::ProviderError;
use super::{
    format_prior_outputs, ProviderKind, ResearchProvider, ResearchRequest, ResearchResponse,
    TokenUsage,
};
use crate::budget::estimate_cost_cents;

pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

pub struct ResponsesClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl ResponsesClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self::with_base_url(api_key, model, OPENAI_API_BASE.to_string())
    }

    pub fn with_base_url(api_key: String, model: String, base_url: String) -> Self {
        let mut base_url = base_url;
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            client: Client::new(),
            base_url,
            api_key,
            model,
        }
    }

    fn build_body(&self, request: &ResearchRequest) -> ResponsesRequest {
        let input = match (&request.continuation, format_prior_outputs(&request.prior_outputs)) {
            // The server already holds the earlier turns.
            (Some(_), _) | (None, None) => request.prompt.clone(),
            (None, Some(context)) => format!("{}\n\n{}", context, request.prompt),
        };

        ResponsesRequest {
            model: self.model.clone(),
            instructions: request.system_context.clone(),
            input,
            tools: vec![json!({ "type": "web_search_preview" })],
            previous_response_id: request.continuation.clone(),
            max_output_tokens: request.max_output_tokens,
        }
    }

    fn parse_response(&self, body: &str) -> Result<ResearchResponse, ProviderError> {
        let parsed: ResponsesResponse = serde_json::from_str(body).map_err(|e| {
            ProviderError::malformed(format!("Failed to parse response: {}", e))
        })?;

        if let Some(err) = parsed.error.filter(|e| !e.is_null()) {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(ProviderError::model_unavailable(message));
        }

        let text: String = parsed
            .output
            .iter()
            .filter(|item| item.item_type == "message")
            .flat_map(|item| item.content.iter())
            .filter(|part| part.part_type == "output_text")
            .filter_map(|part| part.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n\n");

        if text.trim().is_empty() {
            return Err(ProviderError::malformed("Response contained no output text"));
        }

        let truncated = parsed.status.as_deref() == Some("incomplete")
            && parsed
                .incomplete_details
                .as_ref()
                .and_then(|d| d.reason.as_deref())
                == Some("max_output_tokens");

        let usage = parsed
            .usage
            .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens));
        let model = parsed.model.unwrap_or_else(|| self.model.clone());
        let cost_cents = usage
            .as_ref()
            .map(|u| estimate_cost_cents(&model, u))
            .unwrap_or(0);

        Ok(ResearchResponse {
            output: text,
            continuation: Some(parsed.id),
            cost_cents,
            truncated,
            usage,
            model,
        })
    }
}

#[async_trait]
impl ResearchProvider for ResponsesClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ProviderA
    }

    async fn research(&self, request: &ResearchRequest) -> Result<ResearchResponse, ProviderError> {
        let body = self.build_body(request);
        tracing::debug!(
            "Sending request to Responses API: model={} continuation={}",
            self.model,
            body.previous_response_id.is_some()
        );

        let response = self
            .client
            .post(format!("{}/responses", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(&e))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
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
struct ResponsesRequest {
    model: String,
    instructions: String,
    input: String,
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_response_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ResponsesResponse {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    output: Vec<OutputItem>,
    #[serde(default)]
    incomplete_details: Option<IncompleteDetails>,
    #[serde(default)]
    usage: Option<ResponsesUsage>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(rename = "type")]
    item_type: String,
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(rename = "type")]
    part_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IncompleteDetails {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponsesUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{PriorOutput, ProviderErrorKind};
    use axum::{http::StatusCode, routing::post, Json, Router};

    async fn spawn_server(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn request(continuation: Option<&str>) -> ResearchRequest {
        ResearchRequest {
            system_context: "Research companies.".to_string(),
            prior_outputs: vec![PriorOutput {
                label: "Baseline research".to_string(),
                content: "Acme makes anvils.".to_string(),
            }],
            prompt: "Analyse strategy.".to_string(),
            continuation: continuation.map(str::to_string),
            max_output_tokens: None,
        }
    }

    #[test]
    fn test_continuation_skips_prior_outputs() {
        let client = ResponsesClient::new("key".to_string(), "m".to_string());

        let fresh = client.build_body(&request(None));
        assert!(fresh.input.contains("Acme makes anvils."));
        assert!(fresh.previous_response_id.is_none());

        let continued = client.build_body(&request(Some("resp_1")));
        assert_eq!(continued.input, "Analyse strategy.");
        assert_eq!(continued.previous_response_id.as_deref(), Some("resp_1"));
    }

    #[tokio::test]
    async fn test_response_text_and_handle() {
        let router = Router::new().route(
            "/responses",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["previous_response_id"], "resp_1");
                Json(json!({
                    "id": "resp_2",
                    "status": "completed",
                    "model": "gpt-test",
                    "output": [
                        {"type": "web_search_call", "status": "completed"},
                        {"type": "message", "content": [
                            {"type": "output_text", "text": "Part one"},
                            {"type": "output_text", "text": "Part two"}
                        ]}
                    ],
                    "usage": {"input_tokens": 10, "output_tokens": 20}
                }))
            }),
        );
        let base = spawn_server(router).await;
        let client = ResponsesClient::with_base_url("key".to_string(), "gpt-test".to_string(), base);

        let response = client.research(&request(Some("resp_1"))).await.unwrap();
        assert_eq!(response.output, "Part one\n\nPart two");
        assert_eq!(response.continuation.as_deref(), Some("resp_2"));
        assert!(!response.truncated);
    }

    #[tokio::test]
    async fn test_incomplete_response_flags_truncation() {
        let router = Router::new().route(
            "/responses",
            post(|| async {
                Json(json!({
                    "id": "resp_3",
                    "status": "incomplete",
                    "incomplete_details": {"reason": "max_output_tokens"},
                    "output": [{"type": "message", "content": [{"type": "output_text", "text": "Half"}]}]
                }))
            }),
        );
        let base = spawn_server(router).await;
        let client = ResponsesClient::with_base_url("key".to_string(), "m".to_string(), base);

        let response = client.research(&request(None)).await.unwrap();
        assert!(response.truncated);
    }

    #[tokio::test]
    async fn test_rate_limit_carries_retry_after() {
        let router = Router::new().route(
            "/responses",
            post(|| async {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [("retry-after", "7")],
                    "slow down",
                )
            }),
        );
        let base = spawn_server(router).await;
        let client = ResponsesClient::with_base_url("key".to_string(), "m".to_string(), base);

        let err = client.research(&request(None)).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::RateLimited);
        assert_eq!(err.retry_after, Some(Duration::from_secs(7)));
    }
}
