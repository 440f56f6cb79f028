//! Three-level rule cache.
//!
//! - **L1 (hot)**: in-process, bounded by entries and bytes, LFU eviction
//! - **L2 (warm)**: shared across instances (Redis), optional
//! - **L3 (cold)**: the rule repository itself, reached by callers on miss
//!
//! [`CacheManager`] is the only entry point; the tiers are never used directly
//! by request handling code.

mod frequency;
pub mod keys;
mod l1;
mod l2;
mod manager;
#[cfg(feature = "redis-backend")]
mod redis;
mod strategy;

pub use frequency::FrequencyTracker;
pub use l1::{L1Cache, L1Limits, L1Outcome};
pub use l2::{InMemoryL2, L2Cache};
pub use manager::CacheManager;
#[cfg(feature = "redis-backend")]
pub use redis::RedisL2;
pub use strategy::CacheStrategy;

use serde::Serialize;
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache configuration error: {0}")]
    Config(String),

    #[error("L2 cache is not configured")]
    NotConfigured,
}

/// Cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheLevel {
    L1Hot,
    L2Warm,
    L3Cold,
}

impl CacheLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheLevel::L1Hot => "l1",
            CacheLevel::L2Warm => "l2",
            CacheLevel::L3Cold => "l3",
        }
    }
}

impl fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of cache activity since the manager was created.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub promotions: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub l2_errors: u64,
    pub l1_entries: usize,
    pub l1_memory_bytes: usize,
    /// `None` when no L2 is configured
    pub l2_healthy: Option<bool>,
    pub l2_backend: Option<&'static str>,
}

impl CacheStats {
    /// Fraction of lookups served by any tier.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.l1_hits + self.l1_misses;
        if lookups == 0 {
            0.0
        } else {
            (self.l1_hits + self.l2_hits) as f64 / lookups as f64
        }
    }
}
