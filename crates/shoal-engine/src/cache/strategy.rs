//! Runtime-tunable cache strategy shared by every tier.

use super::keys::{classify, KeyClass};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheStrategy {
    /// Maximum number of entries held in L1
    pub l1_max_entries: usize,
    /// Maximum bytes (keys + values) held in L1
    pub l1_max_memory_bytes: usize,
    /// Period of the background expiry/eviction sweep
    pub l1_cleanup_interval: Duration,
    /// Sliding window used by the frequency tracker
    pub access_freq_window: Duration,
    /// Accesses within the window at which an L2 hit is promoted into L1
    pub promotion_threshold: u64,
    pub rule_ttl: Duration,
    pub project_rules_ttl: Duration,
    pub enabled_rules_ttl: Duration,
    pub default_ttl: Duration,
    /// How long L2 is bypassed after a backend failure
    pub l2_retry_interval: Duration,
}

impl Default for CacheStrategy {
    fn default() -> Self {
        Self {
            l1_max_entries: 10_000,
            l1_max_memory_bytes: 64 * 1024 * 1024,
            l1_cleanup_interval: Duration::from_secs(60),
            access_freq_window: Duration::from_secs(300),
            promotion_threshold: 3,
            rule_ttl: Duration::from_secs(30 * 60),
            project_rules_ttl: Duration::from_secs(10 * 60),
            enabled_rules_ttl: Duration::from_secs(5 * 60),
            default_ttl: Duration::from_secs(5 * 60),
            l2_retry_interval: Duration::from_secs(5),
        }
    }
}

impl CacheStrategy {
    /// TTL for a key according to its class.
    pub fn ttl_for_key(&self, key: &str) -> Duration {
        match classify(key) {
            KeyClass::RuleById => self.rule_ttl,
            KeyClass::ProjectRules => self.project_rules_ttl,
            KeyClass::EnabledRules => self.enabled_rules_ttl,
            KeyClass::Other => self.default_ttl,
        }
    }

    /// Whether `accesses` within the window qualify an L2 hit for promotion.
    pub fn should_promote(&self, accesses: u64) -> bool {
        accesses >= self.promotion_threshold
    }
}
