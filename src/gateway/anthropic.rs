//! Anthropic Messages API adapter.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::openai_compat::{
    extract_request_id, is_refusal, read_limited_body, ChatProvider, MAX_INPUT_CHARS,
};
use super::types::*;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Messages API requires an explicit output cap.
const DEFAULT_MAX_TOKENS: u32 = 1_024;

#[derive(Debug, Clone)]
pub struct AnthropicAdapter {
    provider_id: String,
    client: reqwest::Client,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn with_config(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        let key_value = HeaderValue::from_str(&api_key)
            .map_err(|_| ProviderError::config("Invalid API key format"))?;
        headers.insert("x-api-key", key_value);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            provider_id: provider_id.into(),
            client,
            base_url,
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/messages", self.base_url)
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct MessagesApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ApiMessage>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: Vec<ApiBlock>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiBlock {
    Text { text: String },
    Image { source: ApiImageSource },
}

#[derive(Serialize)]
struct ApiImageSource {
    #[serde(rename = "type")]
    source_type: &'static str,
    media_type: String,
    data: String,
}

#[derive(Deserialize)]
struct MessagesApiResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
    stop_reason: Option<String>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    error_type: Option<String>,
    message: Option<String>,
}

/// System messages become the top-level `system` field; images go before text
/// in each user turn.
fn split_messages(messages: &[Message]) -> (Option<String>, Vec<ApiMessage>) {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    let system = (!system.is_empty()).then(|| system.join("\n\n"));

    let turns = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let mut content: Vec<ApiBlock> = m
                .images
                .iter()
                .map(|img| ApiBlock::Image {
                    source: ApiImageSource {
                        source_type: "base64",
                        media_type: img.media_type.clone(),
                        data: img.base64.clone(),
                    },
                })
                .collect();
            content.push(ApiBlock::Text {
                text: m.content.clone(),
            });
            ApiMessage {
                role: if m.role == Role::Assistant {
                    "assistant"
                } else {
                    "user"
                },
                content,
            }
        })
        .collect();

    (system, turns)
}

#[async_trait]
impl ChatProvider for AnthropicAdapter {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn endpoint(&self) -> &'static str {
        "messages"
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let total_chars = req.text_chars();
        if total_chars > MAX_INPUT_CHARS {
            return Err(ProviderError::invalid_request(format!(
                "Input too large: {total_chars} chars (max {MAX_INPUT_CHARS})"
            )));
        }

        let start = Instant::now();
        let (system, messages) = split_messages(&req.messages);
        let api_req = MessagesApiRequest {
            model: &req.model,
            max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: req.temperature,
            system,
            messages,
        };

        let response = self
            .client
            .post(self.messages_url())
            .json(&api_req)
            .send()
            .await?;

        let status = response.status();
        let request_id = extract_request_id(response.headers());
        let body = read_limited_body(&self.provider_id, response).await?;

        let ctx = ErrorContext::new().with_status(status.as_u16());
        let ctx = match &request_id {
            Some(id) => ctx.with_request_id(id),
            None => ctx,
        };

        if !status.is_success() {
            let mut message = format!("HTTP {}", status.as_u16());
            let mut ctx = ctx;
            if let Ok(ErrorEnvelope { error: Some(error) }) =
                serde_json::from_str::<ErrorEnvelope>(&body)
            {
                if let Some(m) = error.message {
                    message = m;
                }
                if let Some(t) = error.error_type {
                    ctx = ctx.with_code(t);
                }
            }
            // 529 = overloaded; retryable like any 5xx.
            return Err(ProviderError::from_status(
                &self.provider_id,
                status.as_u16(),
                message,
                ctx,
            ));
        }

        let parsed: MessagesApiResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::provider(&self.provider_id, format!("Invalid JSON: {e}"), false)
        })?;

        let content: String = parsed
            .content
            .into_iter()
            .filter(|b| b.block_type == "text")
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");

        if is_refusal(&content) {
            return Err(ProviderError::refused(content));
        }

        let (input_tokens, output_tokens) = parsed
            .usage
            .map(|u| (u.input_tokens.unwrap_or(0), u.output_tokens.unwrap_or(0)))
            .unwrap_or((0, 0));

        Ok(ChatResponse {
            content,
            input_tokens,
            output_tokens,
            latency: start.elapsed(),
            finish_reason: FinishReason::from(parsed.stop_reason),
        })
    }
}
