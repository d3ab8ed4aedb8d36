//! Valuation providers: one capability-set trait, one chat-backed adapter, and a
//! registry that builds adapters from resolved configuration.

pub mod analysis;
pub mod config;
pub mod registry;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::gateway::{Attribution, ChatGateway, ChatRequest, ImageData, ProviderError};
use crate::prompts::PromptInstance;

pub use analysis::{parse_analysis, ConfidencePolicy, Decision, ParsedAnalysis};
pub use config::{default_providers, ApiFlavor, Capabilities, ProviderConfig, ResolvedProvider};
pub use registry::ProviderRegistry;

/// Knobs shared by every adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Bound on a single HTTP attempt. A provider's own `timeout_seconds` wins.
    pub timeout_seconds: u64,
    /// Retries after the first attempt; the default gives two attempts.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_jitter: f64,
    pub temperature: f32,
    pub max_tokens: u32,
    pub confidence: ConfidencePolicy,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 20,
            max_retries: 1,
            retry_base_delay_ms: 500,
            retry_jitter: 0.25,
            temperature: 0.2,
            max_tokens: 1_024,
            confidence: ConfidencePolicy::default(),
        }
    }
}

impl AdapterConfig {
    pub fn attempt_timeout(&self, provider_seconds: Option<u64>) -> Duration {
        Duration::from_secs(provider_seconds.unwrap_or(self.timeout_seconds).max(1))
    }

    /// Bound on a whole provider call: every attempt timing out plus the
    /// longest possible backoff between them.
    pub fn call_deadline(&self, provider_seconds: Option<u64>) -> Duration {
        let attempt = self.attempt_timeout(provider_seconds);
        let base = Duration::from_millis(self.retry_base_delay_ms);
        let jitter = 1.0 + self.retry_jitter.max(0.0);
        let backoff: Duration = (0..self.max_retries)
            .map(|i| (base * 2u32.pow(i.min(5))).mul_f64(jitter))
            .sum();
        attempt * (self.max_retries + 1) + backoff
    }
}

/// One valuation call.
#[derive(Debug, Clone)]
pub struct AnalysisRequest<'a> {
    pub images: &'a [ImageData],
    pub prompt: &'a PromptInstance,
    /// Used as the item name when the answer omits one.
    pub item_hint: &'a str,
    pub attribution: Attribution,
}

/// A provider's answer, already parsed.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub analysis: ParsedAnalysis,
    pub raw_response: String,
    /// True when the response held no JSON and `analysis` is the conservative stand-in.
    pub fallback: bool,
    pub latency: Duration,
}

#[async_trait]
pub trait ValuationProvider: Send + Sync {
    fn config(&self) -> &ProviderConfig;

    fn id(&self) -> &str {
        &self.config().id
    }

    fn supports_vision(&self) -> bool {
        self.config().capabilities.vision
    }

    fn base_weight(&self) -> f64 {
        self.config().effective_base_weight()
    }

    /// Bound on one `analyze` call, retries included. `None` leaves it to the caller.
    fn call_deadline(&self) -> Option<Duration> {
        None
    }

    /// Malformed output is not an error: it comes back as a fallback outcome.
    async fn analyze(&self, req: &AnalysisRequest<'_>) -> Result<AnalysisOutcome, ProviderError>;
}

/// Adapter over any [`ChatGateway`].
pub struct ChatValuationProvider {
    config: ProviderConfig,
    gateway: Arc<dyn ChatGateway>,
    deadline: Duration,
    temperature: f32,
    max_tokens: u32,
    confidence: ConfidencePolicy,
}

impl ChatValuationProvider {
    pub fn new(config: ProviderConfig, gateway: Arc<dyn ChatGateway>, adapter: &AdapterConfig) -> Self {
        Self {
            deadline: adapter.call_deadline(config.timeout_seconds),
            config,
            gateway,
            temperature: adapter.temperature,
            max_tokens: adapter.max_tokens,
            confidence: adapter.confidence,
        }
    }

    fn build_request(&self, req: &AnalysisRequest<'_>) -> ChatRequest {
        let messages = if self.supports_vision() && !req.images.is_empty() {
            req.prompt.to_messages_with_images(req.images.to_vec())
        } else if req.images.is_empty() {
            req.prompt.to_messages()
        } else {
            req.prompt.text_only().to_messages()
        };

        let chat = ChatRequest::new(&self.config.model, messages, req.attribution)
            .temperature(self.temperature)
            .max_tokens(self.max_tokens);
        if self.config.capabilities.json_mode {
            chat.json()
        } else {
            chat
        }
    }
}

#[async_trait]
impl ValuationProvider for ChatValuationProvider {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn call_deadline(&self) -> Option<Duration> {
        Some(self.deadline)
    }

    async fn analyze(&self, req: &AnalysisRequest<'_>) -> Result<AnalysisOutcome, ProviderError> {
        let started = Instant::now();
        let response = self.gateway.chat(self.build_request(req)).await?;

        let (analysis, fallback) = match parse_analysis(&response.content, req.item_hint, &self.confidence) {
            Ok(analysis) => (analysis, false),
            Err(err) => {
                warn!(
                    provider = %self.config.id,
                    error = %err,
                    response_len = response.content.len(),
                    "unparseable provider response; using fallback vote"
                );
                (ParsedAnalysis::fallback(req.item_hint, &self.confidence), true)
            }
        };

        Ok(AnalysisOutcome {
            analysis,
            raw_response: response.content,
            fallback,
            latency: started.elapsed(),
        })
    }
}
