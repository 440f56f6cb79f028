//! L1 - in-process hot tier.
//!
//! Bounded by entry count and by memory (key + value bytes). Entries expire by
//! TTL. When over budget, expired entries are dropped first and then the
//! entries with the lowest tracked access frequency, older insertions losing
//! ties. A single mutex guards the map; it is never held across an `.await`.

use super::frequency::FrequencyTracker;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

/// Budget enforced on every insert and on each cleanup sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L1Limits {
    pub max_entries: usize,
    pub max_memory_bytes: usize,
}

#[derive(Debug)]
struct L1Entry {
    value: Bytes,
    expires_at: Instant,
    /// Insertion order, used as the eviction tie-break
    seq: u64,
}

impl L1Entry {
    fn size(key: &str, value: &Bytes) -> usize {
        key.len() + value.len()
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default)]
struct L1State {
    entries: HashMap<String, L1Entry>,
    memory_bytes: usize,
    next_seq: u64,
}

impl L1State {
    fn remove(&mut self, key: &str) -> Option<L1Entry> {
        let entry = self.entries.remove(key)?;
        self.memory_bytes -= L1Entry::size(key, &entry.value);
        Some(entry)
    }

    fn over_budget(&self, limits: L1Limits) -> bool {
        self.entries.len() > limits.max_entries || self.memory_bytes > limits.max_memory_bytes
    }

    fn remove_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }
}

/// Result of an insert or an enforcement pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct L1Outcome {
    /// Whether the written value is now resident in L1
    pub stored: bool,
    /// Keys evicted to get back under budget
    pub evicted: Vec<String>,
    /// Expired entries dropped along the way
    pub expired: usize,
}

pub struct L1Cache {
    state: Mutex<L1State>,
    expirations: AtomicU64,
}

impl Default for L1Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl L1Cache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(L1State::default()),
            expirations: AtomicU64::new(0),
        }
    }

    /// Live value of `key`; an expired entry is removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.value.clone()),
            Some(_) => {
                trace!(key, "L1 entry expired on read");
                state.remove(key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => None,
        }
    }

    /// Insert or replace `key`, then evict until within `limits`.
    ///
    /// The key being written is never chosen as the victim. A value that alone
    /// exceeds the memory budget is not stored (any previous value is dropped).
    pub fn insert(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        limits: L1Limits,
        tracker: &FrequencyTracker,
    ) -> L1Outcome {
        let now = Instant::now();
        let size = L1Entry::size(key, &value);
        let mut state = self.state.lock();

        if size > limits.max_memory_bytes || limits.max_entries == 0 {
            state.remove(key);
            return L1Outcome::default();
        }

        state.remove(key);
        let seq = state.next_seq;
        state.next_seq += 1;
        state.memory_bytes += size;
        state.entries.insert(
            key.to_string(),
            L1Entry {
                value,
                expires_at: now + ttl,
                seq,
            },
        );

        let mut outcome = self.enforce_locked(&mut state, limits, tracker, Some(key), now);
        outcome.stored = true;
        outcome
    }

    /// Bring the cache back within `limits` without inserting anything.
    pub fn enforce(&self, limits: L1Limits, tracker: &FrequencyTracker) -> L1Outcome {
        let mut state = self.state.lock();
        self.enforce_locked(&mut state, limits, tracker, None, Instant::now())
    }

    fn enforce_locked(
        &self,
        state: &mut L1State,
        limits: L1Limits,
        tracker: &FrequencyTracker,
        protect: Option<&str>,
        now: Instant,
    ) -> L1Outcome {
        let mut outcome = L1Outcome::default();
        if !state.over_budget(limits) {
            return outcome;
        }

        outcome.expired = state.remove_expired(now);
        self.expirations
            .fetch_add(outcome.expired as u64, Ordering::Relaxed);
        if !state.over_budget(limits) {
            return outcome;
        }

        let frequencies = tracker.frequencies(
            state
                .entries
                .keys()
                .map(String::as_str)
                .filter(|k| Some(*k) != protect),
        );
        let mut candidates: Vec<(u64, u64, String)> = frequencies
            .into_iter()
            .filter_map(|(key, freq)| state.entries.get(&key).map(|e| (freq, e.seq, key)))
            .collect();
        // Lowest frequency first, then oldest insertion.
        candidates.sort_unstable_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        for (freq, _, key) in candidates {
            if !state.over_budget(limits) {
                break;
            }
            trace!(key = %key, frequency = freq, "evicting L1 entry");
            state.remove(&key);
            outcome.evicted.push(key);
        }
        outcome
    }

    pub fn remove(&self, key: &str) -> bool {
        self.state.lock().remove(key).is_some()
    }

    /// Drop every entry; returns how many were held.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.entries.len();
        state.entries.clear();
        state.memory_bytes = 0;
        count
    }

    /// Remove expired entries; returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let removed = self.state.lock().remove_expired(Instant::now());
        self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memory_bytes(&self) -> usize {
        self.state.lock().memory_bytes
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Total expired entries removed since creation.
    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn limits(max_entries: usize) -> L1Limits {
        L1Limits {
            max_entries,
            max_memory_bytes: 1024 * 1024,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let cache = L1Cache::new();
        let tracker = FrequencyTracker::new(HOUR);
        let outcome = cache.insert("k", Bytes::from("v"), HOUR, limits(10), &tracker);
        assert!(outcome.stored);
        assert_eq!(cache.get("k"), Some(Bytes::from("v")));
        assert_eq!(cache.memory_bytes(), 2);
    }

    #[test]
    fn test_replace_updates_memory_accounting() {
        let cache = L1Cache::new();
        let tracker = FrequencyTracker::new(HOUR);
        cache.insert("k", Bytes::from("short"), HOUR, limits(10), &tracker);
        cache.insert("k", Bytes::from("a much longer value"), HOUR, limits(10), &tracker);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.memory_bytes(), 1 + "a much longer value".len());
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = L1Cache::new();
        let tracker = FrequencyTracker::new(HOUR);
        cache.insert("k", Bytes::from("v"), Duration::ZERO, limits(10), &tracker);
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
        assert_eq!(cache.expirations(), 1);
    }

    #[test]
    fn test_overflow_evicts_exactly_the_lowest_frequency_entry() {
        let cache = L1Cache::new();
        let tracker = FrequencyTracker::new(HOUR);
        let n = 4;
        for i in 0..n {
            cache.insert(&format!("k{i}"), Bytes::from("v"), HOUR, limits(n), &tracker);
        }
        // k2 is never read; everyone else is.
        for key in ["k0", "k1", "k3"] {
            tracker.record(key);
            tracker.record(key);
        }

        let outcome = cache.insert("k4", Bytes::from("v"), HOUR, limits(n), &tracker);
        assert!(outcome.stored);
        assert_eq!(outcome.evicted, vec!["k2".to_string()]);
        assert_eq!(cache.len(), n);
        assert!(!cache.contains("k2"));
        assert!(cache.contains("k4"));
    }

    #[test]
    fn test_frequency_ties_evict_oldest_insertion() {
        let cache = L1Cache::new();
        let tracker = FrequencyTracker::new(HOUR);
        cache.insert("first", Bytes::from("v"), HOUR, limits(2), &tracker);
        cache.insert("second", Bytes::from("v"), HOUR, limits(2), &tracker);
        let outcome = cache.insert("third", Bytes::from("v"), HOUR, limits(2), &tracker);
        assert_eq!(outcome.evicted, vec!["first".to_string()]);
    }

    #[test]
    fn test_memory_budget_evicts() {
        let cache = L1Cache::new();
        let tracker = FrequencyTracker::new(HOUR);
        let tight = L1Limits {
            max_entries: 100,
            max_memory_bytes: 20,
        };
        cache.insert("a", Bytes::from(vec![0u8; 9]), HOUR, tight, &tracker);
        tracker.record("a");
        cache.insert("b", Bytes::from(vec![0u8; 9]), HOUR, tight, &tracker);
        let outcome = cache.insert("c", Bytes::from(vec![0u8; 9]), HOUR, tight, &tracker);
        assert_eq!(outcome.evicted, vec!["b".to_string()]);
        assert!(cache.memory_bytes() <= 20);
    }

    #[test]
    fn test_value_larger_than_budget_is_not_stored() {
        let cache = L1Cache::new();
        let tracker = FrequencyTracker::new(HOUR);
        let tight = L1Limits {
            max_entries: 100,
            max_memory_bytes: 8,
        };
        cache.insert("k", Bytes::from("v"), HOUR, tight, &tracker);
        let outcome = cache.insert("k", Bytes::from(vec![0u8; 64]), HOUR, tight, &tracker);
        assert!(!outcome.stored);
        assert!(!cache.contains("k"));
        assert_eq!(cache.memory_bytes(), 0);
    }

    #[test]
    fn test_enforce_after_budget_shrinks() {
        let cache = L1Cache::new();
        let tracker = FrequencyTracker::new(HOUR);
        for i in 0..5 {
            cache.insert(&format!("k{i}"), Bytes::from("v"), HOUR, limits(10), &tracker);
        }
        let outcome = cache.enforce(limits(2), &tracker);
        assert_eq!(outcome.evicted.len(), 3);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cleanup_expired_and_clear() {
        let cache = L1Cache::new();
        let tracker = FrequencyTracker::new(HOUR);
        cache.insert("dead", Bytes::from("v"), Duration::ZERO, limits(10), &tracker);
        cache.insert("alive", Bytes::from("v"), HOUR, limits(10), &tracker);
        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.clear(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.memory_bytes(), 0);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let cache = L1Cache::new();
        let tracker = FrequencyTracker::new(HOUR);
        cache.insert("k", Bytes::from("v"), HOUR, limits(10), &tracker);
        assert!(cache.remove("k"));
        assert!(!cache.remove("k"));
    }
}
