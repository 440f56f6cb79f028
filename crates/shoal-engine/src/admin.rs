//! Rule mutations with cache invalidation.
//!
//! Every successful mutation deletes all cache keys derived from the affected
//! rule. When a rule moves between namespaces both the old and the new
//! namespace keys are dropped.

use crate::cache::{keys, CacheError, CacheManager};
use crate::model::Rule;
use crate::repository::{InMemoryRuleRepository, RepositoryError};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("cache invalidation failed: {0}")]
    Cache(#[from] CacheError),
}

pub struct RuleAdmin {
    repository: Arc<InMemoryRuleRepository>,
    cache: Arc<CacheManager>,
}

impl RuleAdmin {
    pub fn new(repository: Arc<InMemoryRuleRepository>, cache: Arc<CacheManager>) -> Self {
        Self { repository, cache }
    }

    pub async fn create(&self, rule: Rule) -> Result<Rule, AdminError> {
        self.repository.insert(rule.clone())?;
        info!("Created rule {} in {}/{}", rule.id, rule.project_id, rule.environment_id);
        self.invalidate(&[&rule]).await?;
        Ok(rule)
    }

    /// Replace a rule; returns the stored version.
    pub async fn update(&self, rule: Rule) -> Result<Rule, AdminError> {
        let previous = self.repository.replace(rule.clone())?;
        info!("Updated rule {}", rule.id);
        self.invalidate(&[&previous, &rule]).await?;
        Ok(rule)
    }

    pub async fn delete(&self, id: &str) -> Result<Rule, AdminError> {
        let removed = self.repository.remove(id)?;
        info!("Deleted rule {}", id);
        self.invalidate(&[&removed]).await?;
        Ok(removed)
    }

    pub async fn enable(&self, id: &str) -> Result<Rule, AdminError> {
        self.set_enabled(id, true).await
    }

    pub async fn disable(&self, id: &str) -> Result<Rule, AdminError> {
        self.set_enabled(id, false).await
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<Rule, AdminError> {
        let rule = self.repository.set_enabled(id, enabled)?;
        info!("Rule {} enabled={}", id, enabled);
        self.invalidate(&[&rule]).await?;
        Ok(rule)
    }

    async fn invalidate(&self, rules: &[&Rule]) -> Result<(), AdminError> {
        let keys: BTreeSet<String> = rules
            .iter()
            .flat_map(|rule| keys::derived_keys(rule))
            .collect();
        for key in keys {
            debug!(key = %key, "invalidating cache key");
            self.cache.delete(&key).await?;
        }
        Ok(())
    }
}
