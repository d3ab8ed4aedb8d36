//! Process-wide weight multiplier cache.
//!
//! Readers take an `Arc<WeightSnapshot>` and never block on a refresh; a
//! refresh builds a new snapshot and swaps it in whole.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

// =============================================================================
// Clock
// =============================================================================

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        let by = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        *now = *now + by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Immutable view of provider multipliers at one point in time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WeightSnapshot {
    computed: BTreeMap<String, f64>,
    manual: BTreeMap<String, f64>,
    computed_at: Option<DateTime<Utc>>,
}

impl WeightSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Snapshot with fixed computed multipliers and no manual overrides.
    pub fn from_multipliers(multipliers: impl IntoIterator<Item = (String, f64)>) -> Self {
        Self {
            computed: multipliers.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Multiplier for a provider: manual override, then computed, then 1.0.
    pub fn multiplier(&self, provider_id: &str) -> f64 {
        self.manual
            .get(provider_id)
            .or_else(|| self.computed.get(provider_id))
            .copied()
            .unwrap_or(1.0)
    }

    pub fn has_entry(&self, provider_id: &str) -> bool {
        self.manual.contains_key(provider_id) || self.computed.contains_key(provider_id)
    }

    /// Effective multipliers, manual overrides applied.
    pub fn multipliers(&self) -> BTreeMap<String, f64> {
        let mut merged = self.computed.clone();
        merged.extend(self.manual.iter().map(|(k, v)| (k.clone(), *v)));
        merged
    }

    pub fn manual_overrides(&self) -> &BTreeMap<String, f64> {
        &self.manual
    }

    pub fn computed_at(&self) -> Option<DateTime<Utc>> {
        self.computed_at
    }
}

// =============================================================================
// Cache
// =============================================================================

pub struct WeightCache {
    current: RwLock<Arc<WeightSnapshot>>,
    ttl: Duration,
    min_weight: f64,
    max_boost: f64,
    clock: Arc<dyn Clock>,
    invalidated: AtomicBool,
    refreshing: AtomicBool,
}

impl WeightCache {
    pub fn new(ttl: Duration, min_weight: f64, max_boost: f64) -> Self {
        Self::with_clock(ttl, min_weight, max_boost, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, min_weight: f64, max_boost: f64, clock: Arc<dyn Clock>) -> Self {
        let (min_weight, max_boost) = ordered_bounds(min_weight, max_boost);
        Self {
            current: RwLock::new(Arc::new(WeightSnapshot::empty())),
            ttl,
            min_weight,
            max_boost,
            clock,
            invalidated: AtomicBool::new(false),
            refreshing: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> Arc<WeightSnapshot> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// True when never computed, invalidated, or older than the TTL.
    pub fn is_stale(&self) -> bool {
        if self.invalidated.load(Ordering::Acquire) {
            return true;
        }
        match self.snapshot().computed_at {
            None => true,
            Some(at) => {
                let age = self.clock.now().signed_duration_since(at);
                age.to_std().map_or(false, |age| age >= self.ttl)
            }
        }
    }

    /// Mark the current snapshot stale without discarding it.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
    }

    /// Swap in freshly computed multipliers. Manual overrides carry over.
    pub fn install(&self, computed: BTreeMap<String, f64>) -> Arc<WeightSnapshot> {
        let computed = computed
            .into_iter()
            .map(|(k, v)| (k, self.clamp(v)))
            .collect();
        let now = self.clock.now();
        let next = self.swap(|prev| WeightSnapshot {
            computed,
            manual: prev.manual.clone(),
            computed_at: Some(now),
        });
        self.invalidated.store(false, Ordering::Release);
        next
    }

    /// Pin a provider's multiplier. Returns the clamped value.
    pub fn set_manual_override(&self, provider_id: &str, value: f64) -> f64 {
        let value = self.clamp(value);
        self.swap(|prev| {
            let mut next = prev.clone();
            next.manual.insert(provider_id.to_string(), value);
            next
        });
        info!(provider = provider_id, multiplier = value, "manual weight override set");
        self.invalidate();
        value
    }

    pub fn clear_manual_override(&self, provider_id: &str) -> bool {
        let mut removed = false;
        self.swap(|prev| {
            let mut next = prev.clone();
            removed = next.manual.remove(provider_id).is_some();
            next
        });
        if removed {
            info!(provider = provider_id, "manual weight override cleared");
            self.invalidate();
        }
        removed
    }

    /// Claim the single refresh slot. `None` if a refresh is already running.
    /// The slot is released when the guard drops, including on unwind.
    pub fn try_begin_refresh(self: &Arc<Self>) -> Option<RefreshGuard> {
        self.refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RefreshGuard {
                cache: Arc::clone(self),
            })
    }

    pub fn clamp(&self, value: f64) -> f64 {
        if value.is_finite() {
            value.clamp(self.min_weight, self.max_boost)
        } else {
            1.0_f64.clamp(self.min_weight, self.max_boost)
        }
    }

    fn swap<F>(&self, build: F) -> Arc<WeightSnapshot>
    where
        F: FnOnce(&WeightSnapshot) -> WeightSnapshot,
    {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let next = Arc::new(build(&guard));
        *guard = next.clone();
        next
    }
}

pub(crate) fn ordered_bounds(a: f64, b: f64) -> (f64, f64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Held by the task running a refresh.
pub struct RefreshGuard {
    cache: Arc<WeightCache>,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.cache.refreshing.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> (WeightCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (
            WeightCache::with_clock(Duration::from_secs(3600), 0.3, 1.5, clock.clone()),
            clock,
        )
    }

    #[test]
    fn empty_cache_is_stale_and_defaults_to_one() {
        let (cache, _) = cache();
        assert!(cache.is_stale());
        assert_eq!(cache.snapshot().multiplier("openai"), 1.0);
    }

    #[test]
    fn install_clamps_and_expires_after_ttl() {
        let (cache, clock) = cache();
        cache.install(BTreeMap::from([("a".to_string(), 9.0), ("b".to_string(), 0.01)]));
        let snap = cache.snapshot();
        assert_eq!(snap.multiplier("a"), 1.5);
        assert_eq!(snap.multiplier("b"), 0.3);
        assert!(!cache.is_stale());

        clock.advance(Duration::from_secs(3599));
        assert!(!cache.is_stale());
        clock.advance(Duration::from_secs(1));
        assert!(cache.is_stale());
    }

    #[test]
    fn readers_keep_old_snapshot_after_swap() {
        let (cache, _) = cache();
        cache.install(BTreeMap::from([("a".to_string(), 1.2)]));
        let old = cache.snapshot();
        cache.install(BTreeMap::from([("a".to_string(), 0.8)]));
        assert_eq!(old.multiplier("a"), 1.2);
        assert_eq!(cache.snapshot().multiplier("a"), 0.8);
    }

    #[test]
    fn manual_override_wins_and_invalidates() {
        let (cache, _) = cache();
        cache.install(BTreeMap::from([("a".to_string(), 1.2)]));
        assert!(!cache.is_stale());

        assert_eq!(cache.set_manual_override("a", 5.0), 1.5);
        assert!(cache.is_stale());
        assert_eq!(cache.snapshot().multiplier("a"), 1.5);

        cache.install(BTreeMap::from([("a".to_string(), 0.9)]));
        assert_eq!(cache.snapshot().multiplier("a"), 1.5);

        assert!(cache.clear_manual_override("a"));
        assert_eq!(cache.snapshot().multiplier("a"), 0.9);
        assert!(!cache.clear_manual_override("a"));
    }

    #[test]
    fn only_one_refresh_at_a_time() {
        let cache = Arc::new(cache().0);
        let guard = cache.try_begin_refresh().unwrap();
        assert!(cache.try_begin_refresh().is_none());
        drop(guard);
        assert!(cache.try_begin_refresh().is_some());
    }

    #[tokio::test]
    async fn panicking_refresh_releases_the_slot() {
        let cache = Arc::new(cache().0);
        let guard = cache.try_begin_refresh().unwrap();
        let task = tokio::spawn(async move {
            let _guard = guard;
            panic!("refresh blew up");
        });
        assert!(task.await.unwrap_err().is_panic());
        assert!(cache.try_begin_refresh().is_some());
    }

    #[test]
    fn inverted_bounds_are_reordered() {
        let cache = WeightCache::new(Duration::from_secs(1), 1.5, 0.3);
        assert_eq!(cache.clamp(2.0), 1.5);
        assert_eq!(cache.clamp(0.0), 0.3);
    }
}
