//! Accuracy-driven provider weight multipliers.
//!
//! Benchmark history in a rolling window becomes one multiplier per provider:
//! `clamp(1 + coefficient * (provider_accuracy - fleet_accuracy))`, with an
//! extra penalty when a provider's most recent samples fall well below its
//! window average. Providers without enough samples get no entry and fall back
//! to their static base weight.

pub mod cache;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::benchmark::BenchmarkRecord;
use crate::store::{BenchmarkStore, StoreError};

pub use cache::{Clock, ManualClock, RefreshGuard, SystemClock, WeightCache, WeightSnapshot};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfHealConfig {
    pub window_days: u32,
    /// A prediction is accurate when within this many percent of the sale price.
    pub accuracy_band_percent: f64,
    pub coefficient: f64,
    pub min_weight: f64,
    pub max_boost: f64,
    pub min_samples_per_provider: usize,
    pub min_fleet_samples: usize,
    /// Share of a provider's newest samples compared against its window accuracy.
    pub recent_fraction: f64,
    /// Accuracy drop (0..1) that marks a provider degraded.
    pub degradation_threshold: f64,
    pub degradation_penalty: f64,
    pub cache_ttl_seconds: u64,
}

impl Default for SelfHealConfig {
    fn default() -> Self {
        Self {
            window_days: 30,
            accuracy_band_percent: 10.0,
            coefficient: 0.5,
            min_weight: 0.3,
            max_boost: 1.5,
            min_samples_per_provider: 10,
            min_fleet_samples: 30,
            recent_fraction: 0.25,
            degradation_threshold: 0.20,
            degradation_penalty: 0.8,
            cache_ttl_seconds: 3600,
        }
    }
}

impl SelfHealConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::days(i64::from(self.window_days))
    }

    fn clamp(&self, value: f64) -> f64 {
        let (lo, hi) = cache::ordered_bounds(self.min_weight, self.max_boost);
        if value.is_finite() {
            value.clamp(lo, hi)
        } else {
            1.0_f64.clamp(lo, hi)
        }
    }
}

// =============================================================================
// Report
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStats {
    pub provider_id: String,
    pub samples: usize,
    pub accuracy: f64,
    pub mean_abs_error_percent: f64,
    pub decision_accuracy: f64,
    pub recent_samples: usize,
    pub recent_accuracy: f64,
    /// None when below the sample minimum.
    pub multiplier: Option<f64>,
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DegradationAlert {
    pub provider_id: String,
    pub window_accuracy: f64,
    pub recent_accuracy: f64,
    pub drop: f64,
    pub multiplier: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightReport {
    pub computed_at: DateTime<Utc>,
    pub window_days: u32,
    pub category: Option<String>,
    pub total_samples: usize,
    /// None when the fleet has too few samples to compare against.
    pub fleet_accuracy: Option<f64>,
    pub providers: Vec<ProviderStats>,
    pub alerts: Vec<DegradationAlert>,
}

impl WeightReport {
    pub fn multipliers(&self) -> BTreeMap<String, f64> {
        self.providers
            .iter()
            .filter_map(|p| p.multiplier.map(|m| (p.provider_id.clone(), m)))
            .collect()
    }
}

/// Pure computation over records already restricted to the window.
pub fn compute_report(
    records: &[BenchmarkRecord],
    config: &SelfHealConfig,
    category: Option<&str>,
    computed_at: DateTime<Utc>,
) -> WeightReport {
    let usable: Vec<&BenchmarkRecord> = records
        .iter()
        .filter(|r| r.price_error_percent.is_finite())
        .collect();
    if usable.len() < records.len() {
        debug!(dropped = records.len() - usable.len(), "ignoring non-finite benchmark errors");
    }

    let band = config.accuracy_band_percent;
    let total = usable.len();
    let fleet_accuracy = (total >= config.min_fleet_samples.max(1))
        .then(|| usable.iter().filter(|r| r.is_accurate(band)).count() as f64 / total as f64);

    let mut by_provider: BTreeMap<&str, Vec<&BenchmarkRecord>> = BTreeMap::new();
    for &r in &usable {
        by_provider.entry(r.provider_id.as_str()).or_default().push(r);
    }

    let mut providers = Vec::with_capacity(by_provider.len());
    let mut alerts = Vec::new();

    for (provider_id, mut rows) in by_provider {
        rows.sort_by_key(|r| r.recorded_at);
        let n = rows.len();
        let accuracy = accuracy_of(&rows, band);
        let mean_abs_error_percent =
            rows.iter().map(|r| r.price_error_percent.abs()).sum::<f64>() / n as f64;
        let decision_accuracy = rows.iter().filter(|r| r.decision_correct).count() as f64 / n as f64;

        let recent_samples = ((n as f64 * config.recent_fraction).ceil() as usize).clamp(1, n);
        let recent_accuracy = accuracy_of(&rows[n - recent_samples..], band);

        let mut degraded = false;
        let multiplier = match fleet_accuracy {
            Some(fleet) if n >= config.min_samples_per_provider.max(1) => {
                let mut m = config.clamp(1.0 + config.coefficient * (accuracy - fleet));
                let drop = accuracy - recent_accuracy;
                if drop > config.degradation_threshold {
                    m = config.clamp(m * config.degradation_penalty);
                    degraded = true;
                    warn!(
                        provider = provider_id,
                        window_accuracy = accuracy,
                        recent_accuracy,
                        multiplier = m,
                        "provider accuracy degraded"
                    );
                    alerts.push(DegradationAlert {
                        provider_id: provider_id.to_string(),
                        window_accuracy: accuracy,
                        recent_accuracy,
                        drop,
                        multiplier: m,
                    });
                }
                Some(m)
            }
            _ => None,
        };

        providers.push(ProviderStats {
            provider_id: provider_id.to_string(),
            samples: n,
            accuracy,
            mean_abs_error_percent,
            decision_accuracy,
            recent_samples,
            recent_accuracy,
            multiplier,
            degraded,
        });
    }

    WeightReport {
        computed_at,
        window_days: config.window_days,
        category: category.map(str::to_string),
        total_samples: total,
        fleet_accuracy,
        providers,
        alerts,
    }
}

fn accuracy_of(rows: &[&BenchmarkRecord], band: f64) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }
    rows.iter().filter(|r| r.is_accurate(band)).count() as f64 / rows.len() as f64
}

// =============================================================================
// Engine
// =============================================================================

/// Reads the benchmark store and keeps the shared [`WeightCache`] current.
pub struct SelfHealEngine {
    store: Arc<dyn BenchmarkStore>,
    cache: Arc<WeightCache>,
    config: SelfHealConfig,
}

impl SelfHealEngine {
    pub fn new(store: Arc<dyn BenchmarkStore>, cache: Arc<WeightCache>, config: SelfHealConfig) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<WeightCache> {
        &self.cache
    }

    pub fn config(&self) -> &SelfHealConfig {
        &self.config
    }

    /// Report for the current window, optionally for one category.
    pub async fn compute(&self, category: Option<&str>) -> Result<WeightReport, StoreError> {
        let now = self.cache.now();
        let records = self
            .store
            .query(self.config.window_start(now), category)
            .await?;
        Ok(compute_report(&records, &self.config, category, now))
    }

    /// Recompute fleet-wide multipliers and swap them into the cache. Store
    /// errors are logged and the previous snapshot stays in place.
    pub async fn refresh(&self) -> Option<WeightReport> {
        match self.compute(None).await {
            Ok(report) => {
                let snapshot = self.cache.install(report.multipliers());
                info!(
                    samples = report.total_samples,
                    providers = snapshot.multipliers().len(),
                    alerts = report.alerts.len(),
                    "provider weights refreshed"
                );
                Some(report)
            }
            Err(err) => {
                warn!(error = %err, "self-heal refresh failed; keeping previous weights");
                None
            }
        }
    }

    /// Hot-path read. Never waits: a stale cache triggers at most one
    /// background refresh and the current snapshot is returned immediately.
    pub fn current_weights(self: &Arc<Self>) -> Arc<WeightSnapshot> {
        if !self.cache.is_stale() {
            return self.cache.snapshot();
        }
        if let Some(guard) = self.cache.try_begin_refresh() {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                let _guard = guard;
                engine.refresh().await;
            });
        }
        self.cache.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(provider: &str, err: f64, minutes_ago: i64, now: DateTime<Utc>) -> BenchmarkRecord {
        BenchmarkRecord::new(provider, "toys", err, true, now - chrono::Duration::minutes(minutes_ago))
    }

    fn fleet(now: DateTime<Utc>) -> Vec<BenchmarkRecord> {
        let mut records = Vec::new();
        // "good": all 20 accurate; "bad": 5 of 20 accurate
        for i in 0..20 {
            records.push(record("good", 2.0, i, now));
            records.push(record("bad", if i < 5 { 3.0 } else { 40.0 }, i, now));
        }
        records
    }

    #[test]
    fn multiplier_follows_accuracy_delta() {
        let now = Utc::now();
        let report = compute_report(&fleet(now), &SelfHealConfig::default(), None, now);
        let fleet_acc = report.fleet_accuracy.unwrap();
        assert!((fleet_acc - 25.0 / 40.0).abs() < 1e-9);

        let m = report.multipliers();
        assert!((m["good"] - (1.0 + 0.5 * (1.0 - 0.625))).abs() < 1e-9);
        assert!(m["bad"] < 1.0);
    }

    #[test]
    fn multipliers_stay_in_bounds_on_degenerate_history() {
        let now = Utc::now();
        let uniform = |err: f64| -> Vec<BenchmarkRecord> {
            (0..20)
                .flat_map(|i| [record("a", err, i, now), record("b", err, i, now)])
                .collect()
        };
        // "floor" was accurate, then its newest five all missed
        let mut sliding: Vec<_> = (0..40).map(|i| record("good", 1.0, i, now)).collect();
        sliding.extend((0..20).map(|i| record("floor", if i < 5 { 60.0 } else { 1.0 }, i, now)));

        let histories = [
            ("all inaccurate", uniform(50.0)),
            ("all identical", uniform(2.0)),
            ("floor and degrading", sliding),
        ];
        let configs = [
            SelfHealConfig::default(),
            SelfHealConfig {
                coefficient: 10.0,
                degradation_penalty: 0.1,
                ..SelfHealConfig::default()
            },
            SelfHealConfig {
                min_weight: 1.5,
                max_boost: 0.3,
                degradation_penalty: 0.0,
                ..SelfHealConfig::default()
            },
        ];

        for (name, records) in &histories {
            for config in &configs {
                let (lo, hi) = cache::ordered_bounds(config.min_weight, config.max_boost);
                let report = compute_report(records, config, None, now);
                assert!(!report.multipliers().is_empty(), "{name}");
                for (id, m) in report.multipliers() {
                    assert!(m.is_finite() && (lo..=hi).contains(&m), "{name}: {id} = {m}");
                }
            }
        }

        let harsh = compute_report(&histories[2].1, &configs[1], None, now);
        let floor = harsh.providers.iter().find(|p| p.provider_id == "floor").unwrap();
        assert!(floor.degraded);
        assert_eq!(floor.multiplier, Some(0.3));
        assert_eq!(harsh.alerts.len(), 1);

        let flat = compute_report(&histories[0].1, &configs[0], None, now);
        assert_eq!(flat.fleet_accuracy, Some(0.0));
        assert!(flat.multipliers().values().all(|&m| m == 1.0));
    }

    #[test]
    fn below_fleet_minimum_yields_no_multipliers() {
        let now = Utc::now();
        let records: Vec<_> = (0..20).map(|i| record("solo", 1.0, i, now)).collect();
        let report = compute_report(&records, &SelfHealConfig::default(), None, now);
        assert!(report.fleet_accuracy.is_none());
        assert!(report.multipliers().is_empty());
        assert_eq!(report.providers[0].samples, 20);
    }

    #[test]
    fn sparse_provider_is_omitted() {
        let now = Utc::now();
        let mut records = fleet(now);
        records.extend((0..9).map(|i| record("new", 1.0, i, now)));
        let m = compute_report(&records, &SelfHealConfig::default(), None, now).multipliers();
        assert!(!m.contains_key("new"));
        assert!(m.contains_key("good"));
    }

    #[test]
    fn recent_collapse_is_penalised_and_alerted() {
        let now = Utc::now();
        let mut records = fleet(now);
        // 20 samples: oldest 15 accurate, newest 5 wildly off
        for i in 0..20 {
            let err = if i < 5 { 80.0 } else { 1.0 };
            records.push(record("slipping", err, i, now));
        }
        let config = SelfHealConfig::default();
        let report = compute_report(&records, &config, None, now);
        let stats = report
            .providers
            .iter()
            .find(|p| p.provider_id == "slipping")
            .unwrap();
        assert!(stats.degraded);
        assert_eq!(stats.recent_samples, 5);
        assert_eq!(stats.recent_accuracy, 0.0);
        let undamped = config.clamp(1.0 + 0.5 * (0.75 - report.fleet_accuracy.unwrap()));
        assert!((stats.multiplier.unwrap() - config.clamp(undamped * 0.8)).abs() < 1e-9);
        assert_eq!(report.alerts.len(), 1);
        assert_eq!(report.alerts[0].provider_id, "slipping");
    }

    #[test]
    fn identical_records_stay_in_bounds() {
        let now = Utc::now();
        let records: Vec<_> = (0..40)
            .map(|i| record(if i % 2 == 0 { "a" } else { "b" }, 5.0, 0, now))
            .collect();
        let report = compute_report(&records, &SelfHealConfig::default(), None, now);
        for m in report.multipliers().values() {
            assert_eq!(*m, 1.0);
        }
    }

    #[test]
    fn non_finite_errors_are_ignored() {
        let now = Utc::now();
        let mut records = fleet(now);
        records.push(record("good", f64::NAN, 0, now));
        let report = compute_report(&records, &SelfHealConfig::default(), None, now);
        assert_eq!(report.total_samples, 40);
    }
}
