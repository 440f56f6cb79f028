//! Orchestration of the cache tiers.
//!
//! Read path: L1, then L2 (promoting frequently read keys into L1). Write
//! path: L1 within budget, then L2. L2 failures never fail an operation; the
//! manager logs them, counts them and bypasses L2 for `l2_retry_interval`.
//!
//! Every invalidation (`delete`, `clear`) advances an epoch. Fills that read
//! the system of record go through [`CacheManager::set_if_unchanged`] with the
//! epoch observed before the read, so a fill that raced an invalidation is
//! dropped instead of resurrecting the stale value.

use super::{
    CacheError, CacheLevel, CacheStats, CacheStrategy, FrequencyTracker, L1Cache, L1Limits,
    L1Outcome, L2Cache,
};
use crate::metrics;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MIN_CLEANUP_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Default)]
struct Counters {
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
    promotions: AtomicU64,
    evictions: AtomicU64,
    l2_errors: AtomicU64,
}

impl Counters {
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct CacheManager {
    strategy: RwLock<CacheStrategy>,
    l1: L1Cache,
    l2: Option<Arc<dyn L2Cache>>,
    tracker: FrequencyTracker,
    /// Set when an L2 call fails; L2 is skipped until the retry interval passes
    l2_down_since: Mutex<Option<Instant>>,
    /// Invalidation epoch. L1 writes that depend on it happen under this lock.
    epoch: Mutex<u64>,
    counters: Counters,
}

impl CacheManager {
    /// L1-only manager.
    pub fn new(strategy: CacheStrategy) -> Self {
        Self::build(strategy, None)
    }

    pub fn with_l2(strategy: CacheStrategy, l2: Arc<dyn L2Cache>) -> Self {
        info!("Cache manager using {} L2 backend", l2.backend());
        Self::build(strategy, Some(l2))
    }

    fn build(strategy: CacheStrategy, l2: Option<Arc<dyn L2Cache>>) -> Self {
        Self {
            tracker: FrequencyTracker::new(strategy.access_freq_window),
            strategy: RwLock::new(strategy),
            l1: L1Cache::new(),
            l2,
            l2_down_since: Mutex::new(None),
            epoch: Mutex::new(0),
            counters: Counters::default(),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        if let Some(value) = self.l1.get(key) {
            self.tracker.record(key);
            Counters::inc(&self.counters.l1_hits);
            metrics::record_cache_op("l1", "hit");
            return Ok(Some(value));
        }
        Counters::inc(&self.counters.l1_misses);
        metrics::record_cache_op("l1", "miss");

        let Some(l2) = self.available_l2() else {
            return Ok(None);
        };

        let epoch = self.generation();
        match l2.get_with_ttl(key).await {
            Ok(Some((value, remaining))) => {
                self.l2_succeeded();
                Counters::inc(&self.counters.l2_hits);
                metrics::record_cache_op("l2", "hit");

                let accesses = self.tracker.record(key);
                let strategy = self.strategy();
                if strategy.should_promote(accesses) {
                    // Never outlive the L2 copy.
                    let ttl = match remaining {
                        Some(remaining) => strategy.ttl_for_key(key).min(remaining),
                        None => strategy.ttl_for_key(key),
                    };
                    if !ttl.is_zero() {
                        self.promote(key, &value, ttl, epoch, &strategy, accesses);
                    }
                }
                Ok(Some(value))
            }
            Ok(None) => {
                self.l2_succeeded();
                Counters::inc(&self.counters.l2_misses);
                metrics::record_cache_op("l2", "miss");
                Ok(None)
            }
            Err(e) => {
                self.l2_failed("get", &e);
                Ok(None)
            }
        }
    }

    /// Write through both tiers. L2 failures are logged and swallowed.
    pub async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        {
            let _epoch = self.epoch.lock();
            self.insert_l1(key, &value, ttl);
        }
        self.write_l2(key, value, ttl).await;
        Ok(())
    }

    /// Current invalidation epoch. Read it before loading a value from the
    /// system of record and hand it to [`set_if_unchanged`](Self::set_if_unchanged).
    pub fn generation(&self) -> u64 {
        *self.epoch.lock()
    }

    /// Like [`set`](Self::set), but only if no invalidation happened since
    /// `generation` was read. Returns whether the value was cached.
    pub async fn set_if_unchanged(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool, CacheError> {
        {
            let epoch = self.epoch.lock();
            if *epoch != generation {
                debug!(key, "invalidated while loading, not caching");
                return Ok(false);
            }
            self.insert_l1(key, &value, ttl);
        }

        self.write_l2(key, value, ttl).await;
        // An invalidation that ran while the L2 write was in flight may have
        // deleted before our write landed.
        if self.generation() != generation {
            debug!(key, "invalidated during fill, removing");
            self.delete(key).await?;
            return Ok(false);
        }
        Ok(true)
    }

    fn insert_l1(&self, key: &str, value: &Bytes, ttl: Duration) {
        let strategy = self.strategy();
        let outcome = self.l1.insert(
            key,
            value.clone(),
            ttl,
            Self::limits(&strategy),
            &self.tracker,
        );
        if !outcome.stored {
            debug!(key, size = value.len(), "value not admitted into L1");
        }
        self.note_evictions(&outcome);
        metrics::record_cache_op("l1", "set");
    }

    async fn write_l2(&self, key: &str, value: Bytes, ttl: Duration) {
        if let Some(l2) = self.available_l2() {
            match l2.set(key, value, ttl).await {
                Ok(()) => {
                    self.l2_succeeded();
                    metrics::record_cache_op("l2", "set");
                }
                Err(e) => self.l2_failed("set", &e),
            }
        }
    }

    fn promote(
        &self,
        key: &str,
        value: &Bytes,
        ttl: Duration,
        generation: u64,
        strategy: &CacheStrategy,
        accesses: u64,
    ) {
        let epoch = self.epoch.lock();
        if *epoch != generation {
            debug!(key, "invalidated during L2 read, not promoting");
            return;
        }
        let outcome = self.l1.insert(
            key,
            value.clone(),
            ttl,
            Self::limits(strategy),
            &self.tracker,
        );
        drop(epoch);
        if outcome.stored {
            debug!(key, accesses, "promoted L2 entry into L1");
            Counters::inc(&self.counters.promotions);
            metrics::record_promotion();
        }
        self.note_evictions(&outcome);
    }

    /// Remove `key` from every tier. Deleting a missing key is fine.
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        {
            let mut epoch = self.epoch.lock();
            *epoch += 1;
            self.l1.remove(key);
        }
        self.tracker.forget(key);

        // Invalidation is attempted even while L2 is backed off.
        if let Some(l2) = &self.l2 {
            match l2.delete(key).await {
                Ok(()) => self.l2_succeeded(),
                Err(e) => self.l2_failed("delete", &e),
            }
        }
        Ok(())
    }

    pub async fn clear(&self, level: CacheLevel) -> Result<(), CacheError> {
        match level {
            CacheLevel::L1Hot => {
                let removed = {
                    let mut epoch = self.epoch.lock();
                    *epoch += 1;
                    self.l1.clear()
                };
                self.tracker.clear();
                info!("Cleared {} entries from L1", removed);
                Ok(())
            }
            CacheLevel::L2Warm => match &self.l2 {
                Some(l2) => {
                    *self.epoch.lock() += 1;
                    l2.clear().await.inspect_err(|e| {
                        Counters::inc(&self.counters.l2_errors);
                        warn!("Failed to clear L2: {}", e);
                    })?;
                    self.l2_succeeded();
                    Ok(())
                }
                None => Ok(()),
            },
            // The repository is the system of record; nothing to clear.
            CacheLevel::L3Cold => Ok(()),
        }
    }

    /// Counters plus a live L2 health check.
    pub async fn stats(&self) -> CacheStats {
        let (l2_healthy, l2_backend) = match &self.l2 {
            Some(l2) => {
                let healthy = match l2.ping().await {
                    Ok(()) => {
                        self.l2_succeeded();
                        true
                    }
                    Err(e) => {
                        debug!("L2 ping failed: {}", e);
                        false
                    }
                };
                (Some(healthy), Some(l2.backend()))
            }
            None => (None, None),
        };

        let c = &self.counters;
        CacheStats {
            l1_hits: c.l1_hits.load(Ordering::Relaxed),
            l1_misses: c.l1_misses.load(Ordering::Relaxed),
            l2_hits: c.l2_hits.load(Ordering::Relaxed),
            l2_misses: c.l2_misses.load(Ordering::Relaxed),
            promotions: c.promotions.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            expirations: self.l1.expirations(),
            l2_errors: c.l2_errors.load(Ordering::Relaxed),
            l1_entries: self.l1.len(),
            l1_memory_bytes: self.l1.memory_bytes(),
            l2_healthy,
            l2_backend,
        }
    }

    pub fn strategy(&self) -> CacheStrategy {
        self.strategy.read().clone()
    }

    /// Replace the strategy. A smaller L1 budget is enforced immediately.
    pub fn update_strategy(&self, strategy: CacheStrategy) {
        let limits = Self::limits(&strategy);
        self.tracker.set_window(strategy.access_freq_window);
        *self.strategy.write() = strategy;

        let outcome = self.l1.enforce(limits, &self.tracker);
        self.note_evictions(&outcome);
        info!(
            "Cache strategy updated (l1_max_entries={}, l1_max_memory_bytes={}, evicted={})",
            limits.max_entries,
            limits.max_memory_bytes,
            outcome.evicted.len()
        );
    }

    /// One cleanup sweep: expired entries, budget enforcement, stale
    /// frequency samples.
    pub fn run_cleanup(&self) -> L1Outcome {
        let expired = self.l1.cleanup_expired();
        let mut outcome = self.l1.enforce(Self::limits(&self.strategy()), &self.tracker);
        outcome.expired += expired;
        self.note_evictions(&outcome);
        let pruned = self.tracker.prune();
        if outcome.expired > 0 || !outcome.evicted.is_empty() || pruned > 0 {
            debug!(
                expired = outcome.expired,
                evicted = outcome.evicted.len(),
                pruned,
                "L1 cleanup sweep"
            );
        }
        outcome
    }

    /// Run [`run_cleanup`](Self::run_cleanup) every `l1_cleanup_interval`
    /// until `shutdown` fires. The interval is re-read on every tick.
    pub fn spawn_cleanup(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let interval = manager
                    .strategy()
                    .l1_cleanup_interval
                    .max(MIN_CLEANUP_INTERVAL);
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Cache cleanup task stopped");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        manager.run_cleanup();
                    }
                }
            }
        })
    }

    pub fn has_l2(&self) -> bool {
        self.l2.is_some()
    }

    fn limits(strategy: &CacheStrategy) -> L1Limits {
        L1Limits {
            max_entries: strategy.l1_max_entries,
            max_memory_bytes: strategy.l1_max_memory_bytes,
        }
    }

    fn note_evictions(&self, outcome: &L1Outcome) {
        let count = outcome.evicted.len();
        if count > 0 {
            self.counters
                .evictions
                .fetch_add(count as u64, Ordering::Relaxed);
            metrics::record_evictions(count);
        }
    }

    fn available_l2(&self) -> Option<&Arc<dyn L2Cache>> {
        let l2 = self.l2.as_ref()?;
        let down_since = *self.l2_down_since.lock();
        match down_since {
            Some(since) if since.elapsed() < self.strategy.read().l2_retry_interval => None,
            _ => Some(l2),
        }
    }

    fn l2_failed(&self, op: &str, err: &CacheError) {
        Counters::inc(&self.counters.l2_errors);
        metrics::record_cache_op("l2", "error");
        let mut down_since = self.l2_down_since.lock();
        if down_since.is_none() {
            warn!("L2 {} failed, continuing with L1 only: {}", op, err);
        } else {
            debug!("L2 {} failed again: {}", op, err);
        }
        *down_since = Some(Instant::now());
    }

    fn l2_succeeded(&self) {
        if self.l2_down_since.lock().take().is_some() {
            info!("L2 cache reachable again");
        }
    }
}
