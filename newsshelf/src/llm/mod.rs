use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Core trait for language-model providers
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate completion for a given prompt
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse>;

    /// Model name used for logging and run bookkeeping
    fn model(&self) -> &str;
}

/// Request structure for LLM generation
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub prompt: String,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub timeout_seconds: Option<u64>,
}

/// Response from LLM generation
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: UsageMetadata,
    pub model: String,
}

/// Token usage metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

pub mod anthropic;
pub mod remote;

/// Helper to extract JSON from text that might contain markdown backticks or preamble
pub fn extract_json_from_text(text: &str) -> Option<String> {
    // 1. Try to find content between ```json and ```
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }

    // 2. Try to find content between ``` and ```
    if let Some(start) = text.find("```") {
        let rest = &text[start + 3..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }

    // 3. Try to find the first '{' and last '}'
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            return Some(text[start..=end].to_string());
        }
    }

    None
}

/// Decode model output into `T` through a strict schema.
///
/// Returns `MalformedResponse` when no JSON object can be located or when it does not
/// match the schema; callers decide which fallback policy applies.
pub fn decode_model_json<T: DeserializeOwned>(text: &str) -> std::result::Result<T, PipelineError> {
    let cleaned = extract_json_from_text(text)
        .ok_or_else(|| PipelineError::malformed("llm", "no JSON object found in model output"))?;
    serde_json::from_str(&cleaned).map_err(|e| {
        PipelineError::malformed(
            "llm",
            format!("{} (input: {})", e, crate::http::truncate_for_log(&cleaned, 200)),
        )
    })
}

/// Create a provider from the `[llm]` config section.
pub fn provider_from_config(
    llm_config: &common::LlmConfig,
    retry: crate::http::RetryPolicy,
) -> Result<Box<dyn LlmProvider>> {
    let adapter = llm_config.adapter.as_deref().unwrap_or("remote");
    let remote_config = llm_config
        .remote
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("LLM adapter '{}' selected but [llm.remote] is missing", adapter))?;

    let api_key = common::api_key_from_env("llm", remote_config.api_key_env.as_deref())?;
    let timeout_secs = remote_config.timeout_seconds.unwrap_or(30);
    let max_tokens = remote_config.max_tokens.unwrap_or(1000);

    match adapter {
        "remote" => {
            let model = remote_config.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string());
            let api_url = remote_config
                .api_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434/v1/chat/completions".to_string());
            let provider = remote::RemoteLlmProvider::new(api_url, api_key, model)
                .with_defaults(timeout_secs, max_tokens, 0.2)
                .with_retry(retry);
            Ok(Box::new(provider))
        }
        "anthropic" => {
            let model = remote_config
                .model
                .clone()
                .unwrap_or_else(|| "claude-3-5-sonnet-20241022".to_string());
            let api_url = remote_config
                .api_url
                .clone()
                .unwrap_or_else(|| anthropic::DEFAULT_MESSAGES_URL.to_string());
            let provider = anthropic::AnthropicProvider::new(api_url, api_key, model)
                .with_defaults(timeout_secs, max_tokens, 0.0)
                .with_retry(retry);
            Ok(Box::new(provider))
        }
        _ => anyhow::bail!("Unknown LLM adapter type: {}", adapter),
    }
}
