//! Cache strategy and L2 backend configuration.

use crate::cache::CacheStrategy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// File representation of [`CacheStrategy`]; durations are plain numbers
/// with the unit in the field name.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub l1_max_entries: usize,
    pub l1_max_memory_bytes: usize,
    pub l1_cleanup_interval_secs: u64,
    pub access_freq_window_secs: u64,
    pub promotion_threshold: u64,
    pub rule_ttl_secs: u64,
    pub project_rules_ttl_secs: u64,
    pub enabled_rules_ttl_secs: u64,
    pub default_ttl_secs: u64,
    pub l2_retry_interval_ms: u64,
    /// Distributed L2; L1-only when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let strategy = CacheStrategy::default();
        Self {
            l1_max_entries: strategy.l1_max_entries,
            l1_max_memory_bytes: strategy.l1_max_memory_bytes,
            l1_cleanup_interval_secs: strategy.l1_cleanup_interval.as_secs(),
            access_freq_window_secs: strategy.access_freq_window.as_secs(),
            promotion_threshold: strategy.promotion_threshold,
            rule_ttl_secs: strategy.rule_ttl.as_secs(),
            project_rules_ttl_secs: strategy.project_rules_ttl.as_secs(),
            enabled_rules_ttl_secs: strategy.enabled_rules_ttl.as_secs(),
            default_ttl_secs: strategy.default_ttl.as_secs(),
            l2_retry_interval_ms: strategy.l2_retry_interval.as_millis() as u64,
            redis: None,
        }
    }
}

impl CacheConfig {
    pub fn strategy(&self) -> CacheStrategy {
        CacheStrategy {
            l1_max_entries: self.l1_max_entries,
            l1_max_memory_bytes: self.l1_max_memory_bytes,
            l1_cleanup_interval: Duration::from_secs(self.l1_cleanup_interval_secs),
            access_freq_window: Duration::from_secs(self.access_freq_window_secs),
            promotion_threshold: self.promotion_threshold,
            rule_ttl: Duration::from_secs(self.rule_ttl_secs),
            project_rules_ttl: Duration::from_secs(self.project_rules_ttl_secs),
            enabled_rules_ttl: Duration::from_secs(self.enabled_rules_ttl_secs),
            default_ttl: Duration::from_secs(self.default_ttl_secs),
            l2_retry_interval: Duration::from_millis(self.l2_retry_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_redis_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_redis_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_key_prefix() -> String {
    "shoal:".to_string()
}

fn default_redis_connection_timeout_ms() -> u64 {
    2_000
}

impl RedisConfig {
    pub fn has_valid_scheme(&self) -> bool {
        self.url.starts_with("redis://") || self.url.starts_with("rediss://")
    }
}
