//! Sliding-window access counter.
//!
//! Feeds two decisions in the cache manager: promotion of L2 hits into L1 and
//! the victim choice when L1 is over budget (lowest frequency goes first).

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Samples kept per key; older samples are dropped first.
const MAX_SAMPLES_PER_KEY: usize = 1024;

pub struct FrequencyTracker {
    window: RwLock<Duration>,
    samples: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl FrequencyTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window: RwLock::new(window),
            samples: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        *self.window.read()
    }

    pub fn set_window(&self, window: Duration) {
        *self.window.write() = window;
    }

    /// Record one access and return the access count within the window.
    pub fn record(&self, key: &str) -> u64 {
        self.record_at(key, Instant::now())
    }

    pub(crate) fn record_at(&self, key: &str, now: Instant) -> u64 {
        let window = self.window();
        let mut samples = self.samples.lock();
        let entry = samples.entry(key.to_string()).or_default();
        Self::trim(entry, now, window);
        if entry.len() >= MAX_SAMPLES_PER_KEY {
            entry.pop_front();
        }
        entry.push_back(now);
        entry.len() as u64
    }

    /// Access count of `key` within the window.
    pub fn frequency(&self, key: &str) -> u64 {
        self.frequency_at(key, Instant::now())
    }

    pub(crate) fn frequency_at(&self, key: &str, now: Instant) -> u64 {
        let window = self.window();
        let samples = self.samples.lock();
        samples
            .get(key)
            .map(|s| Self::count_within(s, now, window))
            .unwrap_or(0)
    }

    /// Snapshot of the frequencies of many keys under a single lock.
    pub fn frequencies<'a, I>(&self, keys: I) -> HashMap<String, u64>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let now = Instant::now();
        let window = self.window();
        let samples = self.samples.lock();
        keys.into_iter()
            .map(|k| {
                let count = samples
                    .get(k)
                    .map(|s| Self::count_within(s, now, window))
                    .unwrap_or(0);
                (k.to_string(), count)
            })
            .collect()
    }

    pub fn forget(&self, key: &str) {
        self.samples.lock().remove(key);
    }

    pub fn clear(&self) {
        self.samples.lock().clear();
    }

    /// Drop samples outside the window and keys left without samples.
    /// Returns the number of keys removed.
    pub fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }

    pub(crate) fn prune_at(&self, now: Instant) -> usize {
        let window = self.window();
        let mut samples = self.samples.lock();
        let before = samples.len();
        samples.retain(|_, s| {
            Self::trim(s, now, window);
            !s.is_empty()
        });
        before - samples.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.samples.lock().len()
    }

    fn trim(samples: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(oldest) = samples.front() {
            if now.saturating_duration_since(*oldest) > window {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn count_within(samples: &VecDeque<Instant>, now: Instant, window: Duration) -> u64 {
        samples
            .iter()
            .rev()
            .take_while(|t| now.saturating_duration_since(**t) <= window)
            .count() as u64
    }
}
