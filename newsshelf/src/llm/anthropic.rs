use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{LlmProvider, LlmRequest, LlmResponse, UsageMetadata};
use crate::http::{send_with_retry, RetryPolicy};

pub const DEFAULT_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Provider speaking the Anthropic Messages API
pub struct AnthropicProvider {
    messages_url: String,
    api_key: String,
    model: String,
    default_timeout: Duration,
    default_max_tokens: usize,
    default_temperature: f32,
    retry: RetryPolicy,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(
        messages_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            messages_url: messages_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            default_timeout: Duration::from_secs(30),
            default_max_tokens: 1000,
            default_temperature: 0.0,
            retry: RetryPolicy::none(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_defaults(mut self, timeout_secs: u64, max_tokens: usize, temperature: f32) -> Self {
        self.default_timeout = Duration::from_secs(timeout_secs);
        self.default_max_tokens = max_tokens;
        self.default_temperature = temperature;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse> {
        let timeout = request
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let req_body = MessagesRequest {
            model: &self.model,
            max_tokens: request.max_tokens.unwrap_or(self.default_max_tokens),
            temperature: request.temperature.unwrap_or(self.default_temperature),
            messages: vec![MessageParam {
                role: "user",
                content: &request.prompt,
            }],
        };

        let response = send_with_retry(&self.retry, "Anthropic API", || {
            self.client
                .post(&self.messages_url)
                .timeout(timeout)
                .header("x-api-key", self.api_key.as_str())
                .header("anthropic-version", API_VERSION)
                .json(&req_body)
        })
        .await
        .map_err(|failure| anyhow::anyhow!("LLM API error: {}", failure))?;

        let body: MessagesResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                anyhow::anyhow!("LLM response timed out")
            } else {
                anyhow::Error::new(e).context("Failed to parse Anthropic response")
            }
        })?;

        // Concatenate text blocks; tool or other block types are ignored.
        let content: String = body
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        if content.is_empty() {
            anyhow::bail!("Anthropic response has no text content");
        }

        let usage = body
            .usage
            .map(|u| UsageMetadata {
                prompt_tokens: u.input_tokens,
                completion_tokens: u.output_tokens,
                total_tokens: u.input_tokens + u.output_tokens,
            })
            .unwrap_or_default();

        Ok(LlmResponse {
            content,
            usage,
            model: body.model.unwrap_or_else(|| self.model.clone()),
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: usize,
    temperature: f32,
    messages: Vec<MessageParam<'a>>,
}

#[derive(Debug, Serialize)]
struct MessageParam<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    model: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: usize,
    #[serde(default)]
    output_tokens: usize,
}
