//! Static provider descriptions, loaded once at startup.

use serde::{Deserialize, Serialize};

/// Which wire protocol an adapter speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiFlavor {
    /// `POST /chat/completions` with bearer auth.
    OpenAiCompatible,
    /// Anthropic `POST /messages`.
    Anthropic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub vision: bool,
    pub search: bool,
    pub fast_inference: bool,
    pub tiebreaker_eligible: bool,
    /// Accepts `response_format: json_object`.
    pub json_mode: bool,
}

/// One inference provider in the ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub display_name: String,
    pub model: String,
    pub flavor: ApiFlavor,
    pub base_url: String,
    #[serde(default)]
    pub capabilities: Capabilities,
    /// Static trust level before self-heal adjustment. Never negative.
    #[serde(default = "default_base_weight")]
    pub base_weight: f64,
    /// Environment variable holding the API key.
    pub credential_env: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Per-attempt timeout for this provider; the adapter default applies when unset.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

fn default_base_weight() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

impl ProviderConfig {
    #[allow(clippy::too_many_arguments)]
    fn preset(
        id: &str,
        display_name: &str,
        model: &str,
        flavor: ApiFlavor,
        base_url: &str,
        capabilities: Capabilities,
        base_weight: f64,
        credential_env: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            model: model.to_string(),
            flavor,
            base_url: base_url.to_string(),
            capabilities,
            base_weight,
            credential_env: credential_env.to_string(),
            enabled: true,
            timeout_seconds: None,
        }
    }

    /// Base weight with negative or non-finite values clamped to zero.
    pub fn effective_base_weight(&self) -> f64 {
        if self.base_weight.is_finite() {
            self.base_weight.max(0.0)
        } else {
            0.0
        }
    }

    /// Built-in configuration for a known provider name.
    pub fn known(name: &str) -> Option<Self> {
        default_providers().into_iter().find(|p| p.id == name)
    }
}

/// A provider paired with its credential, resolved once at startup.
#[derive(Clone)]
pub struct ResolvedProvider {
    pub config: ProviderConfig,
    pub api_key: Option<String>,
}

impl ResolvedProvider {
    pub fn new(config: ProviderConfig, api_key: Option<String>) -> Self {
        let api_key = api_key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty());
        Self { config, api_key }
    }

    /// Reason this provider cannot be called, if any.
    pub fn unavailable_reason(&self) -> Option<String> {
        if !self.config.enabled {
            Some("disabled in configuration".to_string())
        } else if self.api_key.is_none() {
            Some(format!("{} is not set", self.config.credential_env))
        } else {
            None
        }
    }
}

impl std::fmt::Debug for ResolvedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedProvider")
            .field("config", &self.config)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Default ensemble roster.
pub fn default_providers() -> Vec<ProviderConfig> {
    use ApiFlavor::*;

    let vision = Capabilities {
        vision: true,
        json_mode: true,
        ..Default::default()
    };

    vec![
        ProviderConfig::preset(
            "openai",
            "OpenAI",
            "gpt-4o",
            OpenAiCompatible,
            "https://api.openai.com/v1",
            vision,
            1.0,
            "OPENAI_API_KEY",
        ),
        ProviderConfig::preset(
            "anthropic",
            "Anthropic Claude",
            "claude-sonnet-4-5",
            Anthropic,
            "https://api.anthropic.com/v1",
            vision,
            1.0,
            "ANTHROPIC_API_KEY",
        ),
        ProviderConfig::preset(
            "gemini",
            "Google Gemini",
            "gemini-2.5-flash",
            OpenAiCompatible,
            "https://generativelanguage.googleapis.com/v1beta/openai",
            Capabilities {
                vision: true,
                fast_inference: true,
                json_mode: true,
                ..Default::default()
            },
            1.0,
            "GEMINI_API_KEY",
        ),
        ProviderConfig::preset(
            "xai",
            "xAI Grok",
            "grok-4-fast",
            OpenAiCompatible,
            "https://api.x.ai/v1",
            vision,
            0.9,
            "XAI_API_KEY",
        ),
        ProviderConfig::preset(
            "perplexity",
            "Perplexity",
            "sonar",
            OpenAiCompatible,
            "https://api.perplexity.ai",
            Capabilities {
                search: true,
                ..Default::default()
            },
            0.9,
            "PERPLEXITY_API_KEY",
        ),
        ProviderConfig::preset(
            "groq",
            "Groq Llama",
            "llama-3.3-70b-versatile",
            OpenAiCompatible,
            "https://api.groq.com/openai/v1",
            Capabilities {
                fast_inference: true,
                json_mode: true,
                ..Default::default()
            },
            0.8,
            "GROQ_API_KEY",
        ),
        ProviderConfig::preset(
            "mistral",
            "Mistral",
            "mistral-large-latest",
            OpenAiCompatible,
            "https://api.mistral.ai/v1",
            Capabilities {
                json_mode: true,
                ..Default::default()
            },
            0.7,
            "MISTRAL_API_KEY",
        ),
        ProviderConfig::preset(
            "deepseek",
            "DeepSeek Reasoner",
            "deepseek-reasoner",
            OpenAiCompatible,
            "https://api.deepseek.com/v1",
            Capabilities {
                tiebreaker_eligible: true,
                ..Default::default()
            },
            0.6,
            "DEEPSEEK_API_KEY",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_roster_has_unique_ids_and_a_tiebreaker() {
        let providers = default_providers();
        let mut ids: Vec<&str> = providers.iter().map(|p| p.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), providers.len());
        assert!(providers.iter().any(|p| p.capabilities.tiebreaker_eligible));
    }

    #[test]
    fn negative_base_weight_is_treated_as_zero() {
        let mut p = ProviderConfig::known("openai").unwrap();
        p.base_weight = -2.0;
        assert_eq!(p.effective_base_weight(), 0.0);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let json = r#"{"id": "local", "display_name": "Local", "model": "llava",
            "flavor": "open_ai_compatible", "base_url": "http://localhost:11434/v1",
            "credential_env": "LOCAL_KEY"}"#;
        let p: ProviderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(p.base_weight, 1.0);
        assert!(p.enabled);
        assert!(!p.capabilities.vision);
    }

    #[test]
    fn missing_or_blank_key_is_unavailable() {
        let config = ProviderConfig::known("groq").unwrap();
        let r = ResolvedProvider::new(config.clone(), Some("   ".to_string()));
        assert!(r.unavailable_reason().unwrap().contains("GROQ_API_KEY"));

        let mut disabled = config;
        disabled.enabled = false;
        let r = ResolvedProvider::new(disabled, Some("k".to_string()));
        assert!(r.unavailable_reason().unwrap().contains("disabled"));
    }

    #[test]
    fn debug_output_redacts_key() {
        let r = ResolvedProvider::new(ProviderConfig::known("openai").unwrap(), Some("sk-secret".into()));
        assert!(!format!("{r:?}").contains("sk-secret"));
    }
}
