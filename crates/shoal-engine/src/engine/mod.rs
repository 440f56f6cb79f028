//! Match engine: selects at most one rule for a request.
//!
//! The enabled rule set of a project/environment is read through the cache
//! manager (`rules:enabled:<project>:<env>`) and loaded from the repository
//! on a miss. Rules are evaluated by descending priority; equal priorities
//! keep repository insertion order. The first enabled rule of the request's
//! protocol whose predicate holds wins.

pub mod predicate;

pub use predicate::{PredicateError, RegexCache};

use crate::cache::{keys, CacheManager};
use crate::metrics;
use crate::model::{MatchContext, Rule};
use crate::repository::{RepositoryError, RuleRepository};
use crate::scripting::ScriptSandbox;
use bytes::Bytes;
use std::cmp::Reverse;
use std::sync::Arc;
use tracing::{debug, warn};

const DEFAULT_REGEX_CACHE_SIZE: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error("rule repository error: {0}")]
    Repository(#[from] RepositoryError),
}

pub struct MatchEngine {
    cache: Arc<CacheManager>,
    repository: Arc<dyn RuleRepository>,
    sandbox: Arc<ScriptSandbox>,
    regexes: RegexCache,
}

impl MatchEngine {
    pub fn new(
        cache: Arc<CacheManager>,
        repository: Arc<dyn RuleRepository>,
        sandbox: Arc<ScriptSandbox>,
    ) -> Self {
        Self {
            cache,
            repository,
            sandbox,
            regexes: RegexCache::new(DEFAULT_REGEX_CACHE_SIZE),
        }
    }

    pub fn with_regex_cache_size(mut self, size: usize) -> Self {
        self.regexes = RegexCache::new(size);
        self
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// Best rule for `request` within its project/environment.
    ///
    /// Predicate failures skip the rule; only repository failures are
    /// returned as errors.
    pub async fn find_match(&self, request: &MatchContext) -> Result<Option<Rule>, MatchError> {
        let rules = match self
            .enabled_rules(&request.project_id, &request.environment_id)
            .await
        {
            Ok(rules) => rules,
            Err(e) => {
                metrics::record_match("error");
                return Err(e);
            }
        };

        for rule in rules {
            if !rule.enabled || rule.protocol != request.protocol {
                continue;
            }
            let outcome =
                predicate::evaluate(&rule.condition, request, &self.regexes, &self.sandbox).await;
            match outcome {
                Ok(true) => {
                    debug!(
                        request_id = %request.request_id,
                        rule_id = %rule.id,
                        priority = rule.priority,
                        "rule matched"
                    );
                    metrics::record_match("matched");
                    return Ok(Some(rule));
                }
                Ok(false) => {
                    debug!(
                        request_id = %request.request_id,
                        rule_id = %rule.id,
                        "rule did not match"
                    );
                }
                Err(e) => {
                    let kind = rule.match_type().as_str();
                    warn!("Skipping rule {} ({}): {}", rule.id, kind, e);
                    metrics::record_rule_eval_error(kind);
                }
            }
        }

        metrics::record_match("unmatched");
        Ok(None)
    }

    /// Enabled rules of a namespace in evaluation order.
    pub async fn enabled_rules(
        &self,
        project_id: &str,
        environment_id: &str,
    ) -> Result<Vec<Rule>, MatchError> {
        let key = keys::enabled_rules(project_id, environment_id);

        match self.cache.get(&key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<Vec<Rule>>(&bytes) {
                Ok(rules) => return Ok(rules),
                Err(e) => {
                    warn!("Dropping undecodable cache entry {}: {}", key, e);
                    if let Err(e) = self.cache.delete(&key).await {
                        warn!("Failed to delete cache entry {}: {}", key, e);
                    }
                }
            },
            Ok(None) => {}
            Err(e) => warn!("Cache read for {} failed, loading from repository: {}", key, e),
        }

        // Observed before the read so a concurrent invalidation wins.
        let generation = self.cache.generation();
        let mut rules = self
            .repository
            .find_enabled_by_environment(project_id, environment_id)
            .await?;
        rules.retain(|r| r.enabled);
        // Stable: equal priorities keep repository order.
        rules.sort_by_key(|r| Reverse(r.priority));

        match serde_json::to_vec(&rules) {
            Ok(encoded) => {
                let ttl = self.cache.strategy().enabled_rules_ttl;
                let stored = self
                    .cache
                    .set_if_unchanged(&key, Bytes::from(encoded), ttl, generation)
                    .await;
                if let Err(e) = stored {
                    warn!("Failed to cache {}: {}", key, e);
                }
            }
            Err(e) => warn!("Failed to encode rule set {}: {}", key, e),
        }

        debug!(
            "Loaded {} enabled rules for {}/{} from repository",
            rules.len(),
            project_id,
            environment_id
        );
        Ok(rules)
    }
}
