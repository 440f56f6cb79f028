//! Configuration types for the shoal server.

mod cache;
mod listen;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub use cache::{CacheConfig, RedisConfig};
pub use listen::ListenConfig;

use crate::executor::{DelayConfig, ExecutorConfig};
use crate::model::Rule;
use crate::scripting::SandboxConfig;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub script: SandboxConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Rules seeded into the repository at startup
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// Additional YAML file holding a list of rules; relative paths resolve
    /// against the config file's directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules_file: Option<PathBuf>,
}

impl Config {
    /// Load, resolve `rules_file` and validate.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;

        if let Some(rules_file) = &config.rules_file {
            let rules_path = match path.parent() {
                Some(dir) if rules_file.is_relative() => dir.join(rules_file),
                _ => rules_file.clone(),
            };
            let extra = load_rules(&rules_path)?;
            config.rules.extend(extra);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.cache.l1_max_entries == 0 {
            anyhow::bail!("cache.l1_max_entries must be greater than zero");
        }
        if self.cache.l1_max_memory_bytes == 0 {
            anyhow::bail!("cache.l1_max_memory_bytes must be greater than zero");
        }
        if self.cache.l1_cleanup_interval_secs == 0 {
            anyhow::bail!("cache.l1_cleanup_interval_secs must be greater than zero");
        }
        if self.cache.access_freq_window_secs == 0 {
            anyhow::bail!("cache.access_freq_window_secs must be greater than zero");
        }

        if let Some(redis) = &self.cache.redis {
            if !redis.has_valid_scheme() {
                anyhow::bail!(
                    "Invalid cache.redis.url '{}': expected a redis:// or rediss:// URL",
                    redis.url
                );
            }
            if redis.pool_size == 0 {
                anyhow::bail!("cache.redis.pool_size must be greater than zero");
            }
            // clear() deletes every key under the prefix.
            if redis.key_prefix.is_empty() {
                anyhow::bail!("cache.redis.key_prefix must not be empty");
            }
        }

        if self.script.max_operations == 0 || self.script.timeout_ms == 0 {
            anyhow::bail!(
                "script.max_operations and script.timeout_ms must be greater than zero"
            );
        }

        let mut seen = HashSet::new();
        for rule in &self.rules {
            if !seen.insert(rule.id.as_str()) {
                anyhow::bail!("Duplicate rule id '{}'", rule.id);
            }
            rule.validate()
                .with_context(|| format!("invalid rule '{}'", rule.id))?;
            if let Some(delay) = &rule.response.delay {
                self.validate_delay(&rule.id, delay)?;
            }
        }

        Ok(())
    }

    fn validate_delay(&self, rule_id: &str, delay: &DelayConfig) -> Result<(), anyhow::Error> {
        let max = self.executor.max_delay_ms;
        match *delay {
            DelayConfig::Fixed { fixed } if fixed > max => {
                anyhow::bail!(
                    "Rule '{}': fixed delay {}ms exceeds executor.max_delay_ms ({}ms)",
                    rule_id,
                    fixed,
                    max
                )
            }
            DelayConfig::Random { min, max: upper } if min.max(upper) > max => {
                anyhow::bail!(
                    "Rule '{}': random delay bound {}ms exceeds executor.max_delay_ms ({}ms)",
                    rule_id,
                    min.max(upper),
                    max
                )
            }
            DelayConfig::Normal { mean, stddev }
                if !mean.is_finite() || !stddev.is_finite() || stddev < 0.0 =>
            {
                anyhow::bail!(
                    "Rule '{}': normal delay needs finite mean and non-negative stddev",
                    rule_id
                )
            }
            _ => Ok(()),
        }
    }
}

/// Read a YAML list of rules.
pub fn load_rules(path: &Path) -> Result<Vec<Rule>, anyhow::Error> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read rules file {}", path.display()))?;
    serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse rules file {}", path.display()))
}
