//! Provider gateway: wire transports plus a retrying, call-recording wrapper.

pub mod anthropic;
pub mod error;
pub mod openai_compat;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::debug;

pub use anthropic::AnthropicAdapter;
pub use error::{ErrorContext, ProviderError};
pub use openai_compat::{ChatProvider, OpenAiCompatAdapter};
pub use types::*;
pub use usage::{CallStatus, NoopUsageSink, ProviderCallRecord, TracingUsageSink, UsageSink};

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Retries after the first attempt. Only retryable errors are retried.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Extra random delay as a fraction of the backoff (0.25 = up to +25%).
    pub jitter: f64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            retry_base_delay: Duration::from_millis(500),
            jitter: 0.25,
        }
    }
}

pub struct ProviderGateway<U: UsageSink> {
    provider: Arc<dyn ChatProvider>,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl<U: UsageSink> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl<U: UsageSink> ProviderGateway<U> {
    pub fn with_config(
        provider: Arc<dyn ChatProvider>,
        usage_sink: Arc<U>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            provider,
            usage_sink,
            config,
        }
    }

    pub fn provider_id(&self) -> &str {
        self.provider.provider_id()
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut last_error: Option<ProviderError> = None;

        for attempt in 0..=self.config.max_retries {
            let started = std::time::Instant::now();
            let result = self.provider.chat(&req).await;
            match result {
                Ok(resp) => {
                    self.record_call(&req, attempt, Ok(&resp), started.elapsed())
                        .await;
                    return Ok(resp);
                }
                Err(err) => {
                    self.record_call(&req, attempt, Err(&err), started.elapsed())
                        .await;

                    if !err.is_retryable() || attempt == self.config.max_retries {
                        return Err(err);
                    }

                    let delay = backoff_delay(self.config.retry_base_delay, attempt, self.config.jitter);
                    debug!(
                        provider = self.provider.provider_id(),
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "retrying provider call"
                    );
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ProviderError::provider(self.provider.provider_id(), "unknown error", false)
        }))
    }

    async fn record_call(
        &self,
        req: &ChatRequest,
        attempt: u32,
        outcome: Result<&ChatResponse, &ProviderError>,
        elapsed: Duration,
    ) {
        let record = ProviderCallRecord::new(
            self.provider.provider_id(),
            self.provider.endpoint(),
            req.model.clone(),
            req.attribution.caller,
        )
        .valuation(req.attribution.valuation_id)
        .attempt(attempt)
        .latency(elapsed.as_millis() as u64);

        let record = match outcome {
            Ok(resp) => record.tokens(resp.input_tokens, resp.output_tokens),
            Err(err) => record
                .error(err.code())
                .request_id(err.request_id().map(str::to_string)),
        };

        self.usage_sink.record(record).await;
    }
}

fn backoff_delay(base: Duration, attempt: u32, jitter: f64) -> Duration {
    let multiplier = 2u32.pow(attempt.min(5));
    let delay = base * multiplier;
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let extra = rand::thread_rng().gen_range(0.0..jitter);
    delay.mul_f64(1.0 + extra)
}
