//! LLM transport via OpenRouter
//!
//! BYOK only: the user provides an OpenRouter API key, billed directly.
//!
//! Two model tiers are enough for patch work:
//! - Patch (claude-sonnet-4.5): diff generation for all primary strategies
//! - Repair (gpt-oss-120b): mechanical diff-format repair, where a cheap model
//!   does as well as an expensive one
//!
//! All calls go through a shared admission semaphore so concurrent pursuits
//! queue for the provider instead of tripping its rate limits, plus a
//! 429-aware exponential backoff inside each call.

use crate::config::RunConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// OpenRouter direct API URL (BYOK mode)
const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

const MODEL_MAX_TOKENS: u32 = 8192;

/// Rate limit retry configuration
const MAX_TRANSPORT_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000;
const BACKOFF_MULTIPLIER: u64 = 2;

// Model pricing per million tokens (estimated, check OpenRouter for current rates)
const PATCH_INPUT_COST: f64 = 3.0;
const PATCH_OUTPUT_COST: f64 = 15.0;
const REPAIR_INPUT_COST: f64 = 0.10;
const REPAIR_OUTPUT_COST: f64 = 0.30;

/// Model tiers available for patch generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Model {
    /// Primary tier for diff generation (claude-sonnet-4.5)
    Patch,
    /// Cheap tier for format repair (gpt-oss-120b)
    Repair,
}

impl Model {
    pub fn id(&self) -> &'static str {
        match self {
            Model::Patch => "anthropic/claude-sonnet-4.5",
            Model::Repair => "openai/gpt-oss-120b",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Model::Patch => "patch",
            Model::Repair => "repair",
        }
    }

    /// Calculate cost in USD based on token usage
    pub fn calculate_cost(&self, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        let (input_rate, output_rate) = match self {
            Model::Patch => (PATCH_INPUT_COST, PATCH_OUTPUT_COST),
            Model::Repair => (REPAIR_INPUT_COST, REPAIR_OUTPUT_COST),
        };

        let input_cost = (prompt_tokens as f64 / 1_000_000.0) * input_rate;
        let output_cost = (completion_tokens as f64 / 1_000_000.0) * output_rate;

        input_cost + output_cost
    }
}

/// API usage information from OpenRouter
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn calculate_cost(&self, model: Model) -> f64 {
        model.calculate_cost(self.prompt_tokens, self.completion_tokens)
    }
}

/// Response from the LLM including content and usage stats
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: Option<Usage>,
    pub model: String,
}

/// One request to the model boundary.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system: String,
    pub user: String,
    pub model: Model,
    /// Force `response_format: json_object` on providers that support it.
    pub json_mode: bool,
}

/// The opaque model boundary. Output content is never assumed well-formed;
/// transport errors are transient and surface as `Err` after client-level
/// retries are exhausted.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate(&self, request: &LlmRequest) -> anyhow::Result<LlmResponse>;
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    content: String,
}

/// Extract a retry-after hint from an OpenRouter response body (if present)
fn parse_retry_after(text: &str) -> Option<u64> {
    let text_lower = text.to_lowercase();
    if let Some(pos) = text_lower.find("retry") {
        let after_retry = &text_lower[pos..];
        for word in after_retry.split_whitespace().skip(1).take(5) {
            if let Ok(secs) = word.trim_matches(|c: char| !c.is_numeric()).parse::<u64>() {
                if secs > 0 && secs < 300 {
                    return Some(secs);
                }
            }
        }
    }
    None
}

/// Production client against OpenRouter.
pub struct OpenRouterClient {
    api_key: String,
    client: reqwest::Client,
    /// Shared across all pursuits; callers queue here instead of failing.
    admission: Arc<Semaphore>,
}

impl OpenRouterClient {
    pub fn new(config: &RunConfig) -> anyhow::Result<Self> {
        let api_key = config
            .api_key()
            .ok_or_else(|| anyhow::anyhow!("No API key configured. Set OPENROUTER_API_KEY."))?;

        Ok(Self {
            api_key,
            client: reqwest::Client::new(),
            admission: Arc::new(Semaphore::new(config.llm_concurrency.max(1))),
        })
    }
}

#[async_trait]
impl ModelClient for OpenRouterClient {
    async fn generate(&self, request: &LlmRequest) -> anyhow::Result<LlmResponse> {
        // Queue for an admission slot; holders are other in-flight calls.
        let _permit = self
            .admission
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| anyhow::anyhow!("LLM admission queue closed"))?;

        let response_format = if request.json_mode {
            Some(ResponseFormat {
                format_type: "json_object".to_string(),
            })
        } else {
            None
        };

        let body = ChatRequest {
            model: request.model.id().to_string(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: request.system.clone(),
                },
                Message {
                    role: "user".to_string(),
                    content: request.user.clone(),
                },
            ],
            max_tokens: MODEL_MAX_TOKENS,
            stream: false,
            response_format,
        };

        let mut retry_count = 0;

        loop {
            let response = self
                .client
                .post(OPENROUTER_URL)
                .header("Content-Type", "application/json")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await?;

            if response.status().is_success() {
                let chat_response: ChatResponse = response.json().await?;

                let content = chat_response
                    .choices
                    .first()
                    .map(|c| c.message.content.clone())
                    .ok_or_else(|| anyhow::anyhow!("No response content from model"))?;

                return Ok(LlmResponse {
                    content,
                    usage: chat_response.usage,
                    model: chat_response
                        .model
                        .unwrap_or_else(|| request.model.id().to_string()),
                });
            }

            let status = response.status();
            let text = response.text().await.unwrap_or_default();

            if status.as_u16() == 429 && retry_count < MAX_TRANSPORT_RETRIES {
                retry_count += 1;

                let backoff_secs = parse_retry_after(&text).unwrap_or_else(|| {
                    INITIAL_BACKOFF_MS * BACKOFF_MULTIPLIER.pow(retry_count - 1) / 1000
                });
                tokio::time::sleep(tokio::time::Duration::from_secs(backoff_secs)).await;
                continue;
            }

            let error_msg = match status.as_u16() {
                401 => "Invalid API key. Check OPENROUTER_API_KEY.".to_string(),
                429 => format!(
                    "Rate limited by OpenRouter after {} retries. Try again in a few minutes.",
                    retry_count
                ),
                500..=599 => format!(
                    "OpenRouter server error ({}). The service may be temporarily unavailable.",
                    status
                ),
                _ => format!("API error {}: {}", status, crate::util::truncate(&text, 200)),
            };
            return Err(anyhow::anyhow!("{}", error_msg));
        }
    }
}
