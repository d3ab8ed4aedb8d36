//! Provider factory and registry.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::config::{ApiFlavor, ResolvedProvider};
use super::{AdapterConfig, ChatValuationProvider, ValuationProvider};
use crate::gateway::{
    AnthropicAdapter, ChatProvider, GatewayConfig, OpenAiCompatAdapter, ProviderError,
    ProviderGateway, UsageSink,
};

/// A configured provider that will not be called, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnavailableProvider {
    pub id: String,
    pub reason: String,
}

/// Build the adapter for one resolved provider.
pub fn build_provider<U: UsageSink + 'static>(
    resolved: &ResolvedProvider,
    usage_sink: Arc<U>,
    adapter: &AdapterConfig,
) -> Result<Arc<dyn ValuationProvider>, ProviderError> {
    let config = &resolved.config;
    if let Some(reason) = resolved.unavailable_reason() {
        return Err(ProviderError::unavailable(&config.id, reason));
    }
    let api_key = resolved.api_key.clone().unwrap_or_default();

    let transport: Arc<dyn ChatProvider> = match config.flavor {
        ApiFlavor::OpenAiCompatible => Arc::new(OpenAiCompatAdapter::with_config(
            &config.id,
            api_key,
            &config.base_url,
            adapter.attempt_timeout(config.timeout_seconds),
        )?),
        ApiFlavor::Anthropic => Arc::new(AnthropicAdapter::with_config(
            &config.id,
            api_key,
            &config.base_url,
            adapter.attempt_timeout(config.timeout_seconds),
        )?),
    };

    let gateway = ProviderGateway::with_config(
        transport,
        usage_sink,
        GatewayConfig {
            max_retries: adapter.max_retries,
            retry_base_delay: Duration::from_millis(adapter.retry_base_delay_ms),
            jitter: adapter.retry_jitter,
        },
    );

    Ok(Arc::new(ChatValuationProvider::new(
        config.clone(),
        Arc::new(gateway),
        adapter,
    )))
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn ValuationProvider>>,
    unavailable: Vec<UnavailableProvider>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every resolved provider. Failures are kept as unavailable entries.
    pub fn from_resolved<U: UsageSink + 'static>(
        resolved: &[ResolvedProvider],
        usage_sink: Arc<U>,
        adapter: &AdapterConfig,
    ) -> Self {
        let mut registry = Self::new();
        for r in resolved {
            match build_provider(r, usage_sink.clone(), adapter) {
                Ok(provider) => registry.insert(provider),
                Err(err) => {
                    let reason = match &err {
                        ProviderError::Unavailable { reason, .. } => reason.clone(),
                        other => other.to_string(),
                    };
                    warn!(provider = %r.config.id, %reason, "provider unavailable");
                    registry.mark_unavailable(&r.config.id, reason);
                }
            }
        }
        info!(
            available = registry.providers.len(),
            unavailable = registry.unavailable.len(),
            "provider registry built"
        );
        registry
    }

    /// Add a provider, replacing any existing one with the same id.
    pub fn insert(&mut self, provider: Arc<dyn ValuationProvider>) {
        self.unavailable.retain(|u| u.id != provider.id());
        self.providers.retain(|p| p.id() != provider.id());
        self.providers.push(provider);
    }

    pub fn mark_unavailable(&mut self, id: impl Into<String>, reason: impl Into<String>) {
        let id = id.into();
        self.providers.retain(|p| p.id() != id);
        self.unavailable.retain(|u| u.id != id);
        self.unavailable.push(UnavailableProvider {
            id,
            reason: reason.into(),
        });
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ValuationProvider>> {
        self.providers.iter().find(|p| p.id() == id).cloned()
    }

    pub fn providers(&self) -> &[Arc<dyn ValuationProvider>] {
        &self.providers
    }

    pub fn unavailable(&self) -> &[UnavailableProvider] {
        &self.unavailable
    }

    pub fn ids(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.id().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
