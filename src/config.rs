//! Startup configuration: defaults, then an optional JSON file, then the
//! `APPRAISER_*` environment overlay.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::consensus::{EngineConfig, TallyConfig, TiebreakerConfig};
use crate::providers::{default_providers, AdapterConfig, ProviderConfig, ResolvedProvider};
use crate::self_heal::{SelfHealConfig, WeightCache};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub tally: TallyConfig,
    pub tiebreaker: TiebreakerConfig,
    pub self_heal: SelfHealConfig,
    pub adapter: AdapterConfig,
    pub providers: Vec<ProviderConfig>,
    pub benchmark_db: Option<PathBuf>,
    /// JSON array of category overrides, read in addition to the store's table.
    pub overrides_path: Option<PathBuf>,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            tally: TallyConfig::default(),
            tiebreaker: TiebreakerConfig::default(),
            self_heal: SelfHealConfig::default(),
            adapter: AdapterConfig::default(),
            providers: default_providers(),
            benchmark_db: None,
            overrides_path: None,
        }
    }
}

impl EnsembleConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// File (if given) plus environment. The usual startup path.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_path(path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Overlay values from `lookup`. Unparseable values are ignored.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        overlay(&get, "APPRAISER_CLOSE_VOTE_THRESHOLD", &mut self.tally.close_vote_threshold);
        overlay(&get, "APPRAISER_MIN_PRIMARY_VOTES", &mut self.tally.min_primary_votes);
        overlay(&get, "APPRAISER_PROVIDER_TIMEOUT_SECONDS", &mut self.adapter.timeout_seconds);
        overlay(&get, "APPRAISER_MAX_RETRIES", &mut self.adapter.max_retries);
        overlay(&get, "APPRAISER_SELF_HEAL_WINDOW_DAYS", &mut self.self_heal.window_days);
        overlay(
            &get,
            "APPRAISER_SELF_HEAL_MIN_SAMPLES",
            &mut self.self_heal.min_samples_per_provider,
        );
        overlay(
            &get,
            "APPRAISER_WEIGHT_CACHE_TTL_SECONDS",
            &mut self.self_heal.cache_ttl_seconds,
        );
        if let Some(provider) = get("APPRAISER_TIEBREAKER_PROVIDER") {
            self.tiebreaker.provider = Some(provider);
        }
        if let Some(path) = get("APPRAISER_BENCHMARK_DB") {
            self.benchmark_db = Some(PathBuf::from(path));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.tally.close_vote_threshold) {
            return Err(ConfigError::Invalid(format!(
                "close_vote_threshold must be within [0, 1], got {}",
                self.tally.close_vote_threshold
            )));
        }
        if !(self.tiebreaker.weight_factor >= 0.0 && self.tiebreaker.weight_factor < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "tiebreaker weight_factor must be within [0, 1), got {}",
                self.tiebreaker.weight_factor
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for p in &self.providers {
            if p.id.trim().is_empty() {
                return Err(ConfigError::Invalid("provider id must be non-empty".to_string()));
            }
            if !seen.insert(p.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate provider id {}", p.id)));
            }
        }
        Ok(())
    }

    /// Pair each provider with its credential from the environment.
    pub fn resolve_providers(&self) -> Vec<ResolvedProvider> {
        self.resolve_providers_from(|key| std::env::var(key).ok())
    }

    pub fn resolve_providers_from(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Vec<ResolvedProvider> {
        self.providers
            .iter()
            .map(|p| ResolvedProvider::new(p.clone(), lookup(&p.credential_env)))
            .collect()
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            tally: self.tally.clone(),
            tiebreaker: self.tiebreaker.clone(),
            provider_timeout: self.adapter.call_deadline(None),
        }
    }

    pub fn weight_cache(&self) -> Arc<WeightCache> {
        Arc::new(WeightCache::new(
            self.self_heal.cache_ttl(),
            self.self_heal.min_weight,
            self.self_heal.max_boost,
        ))
    }
}

fn overlay<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(raw) = get(key) {
        match raw.parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => warn!(key, value = %raw, "ignoring unparseable environment override"),
        }
    }
}
