//! Rule repository: the system of record behind the cache.
//!
//! The engine only reads through [`RuleRepository`]; mutations go through
//! [`crate::admin::RuleAdmin`] so that cache invalidation is never skipped.

mod inmemory;

pub use inmemory::InMemoryRuleRepository;

use crate::model::{Protocol, Rule, RuleValidationError};
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("rule '{0}' not found")]
    NotFound(String),

    #[error("rule '{0}' already exists")]
    Conflict(String),

    #[error("invalid rule: {0}")]
    Invalid(#[from] RuleValidationError),

    #[error("repository backend error: {0}")]
    Backend(String),
}

/// Criteria for [`RuleRepository::list`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleFilter {
    pub project_id: Option<String>,
    pub environment_id: Option<String>,
    pub protocol: Option<Protocol>,
    pub enabled: Option<bool>,
    pub tag: Option<String>,
}

impl RuleFilter {
    pub fn matches(&self, rule: &Rule) -> bool {
        self.project_id
            .as_ref()
            .map_or(true, |p| *p == rule.project_id)
            && self
                .environment_id
                .as_ref()
                .map_or(true, |e| *e == rule.environment_id)
            && self.protocol.map_or(true, |p| p == rule.protocol)
            && self.enabled.map_or(true, |e| e == rule.enabled)
            && self.tag.as_ref().map_or(true, |t| rule.tags.contains(t))
    }
}

/// Read access to stored rules. Not-found is `Ok(None)` or an empty list.
#[async_trait]
pub trait RuleRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Rule>, RepositoryError>;

    /// Enabled rules of one environment, priority descending. Equal
    /// priorities keep insertion order.
    async fn find_enabled_by_environment(
        &self,
        project_id: &str,
        environment_id: &str,
    ) -> Result<Vec<Rule>, RepositoryError>;

    /// Rules matching `filter` in insertion order, after skipping `skip`.
    async fn list(
        &self,
        filter: &RuleFilter,
        skip: usize,
        limit: Option<usize>,
    ) -> Result<Vec<Rule>, RepositoryError>;
}
