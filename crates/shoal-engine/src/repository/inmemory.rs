use super::{RepositoryError, RuleFilter, RuleRepository};
use crate::model::Rule;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::cmp::Reverse;
use std::collections::HashMap;

#[derive(Default)]
struct Store {
    /// rule id -> (insertion sequence, rule)
    rules: HashMap<String, (u64, Rule)>,
    next_seq: u64,
}

impl Store {
    fn sorted(&self, filter: impl Fn(&Rule) -> bool) -> Vec<(u64, &Rule)> {
        let mut rules: Vec<(u64, &Rule)> = self
            .rules
            .values()
            .filter(|(_, r)| filter(r))
            .map(|(seq, r)| (*seq, r))
            .collect();
        rules.sort_by_key(|(seq, _)| *seq);
        rules
    }
}

/// In-memory implementation of RuleRepository
///
/// Rules keep the sequence number of their first insertion, so replacing a
/// rule does not change its position among equal priorities.
#[derive(Default)]
pub struct InMemoryRuleRepository {
    store: RwLock<Store>,
}

impl InMemoryRuleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a repository from seed rules, in order.
    pub fn from_rules(rules: impl IntoIterator<Item = Rule>) -> Result<Self, RepositoryError> {
        let repo = Self::new();
        for rule in rules {
            repo.insert(rule)?;
        }
        Ok(repo)
    }

    pub fn insert(&self, rule: Rule) -> Result<(), RepositoryError> {
        rule.validate()?;
        let mut store = self.store.write();
        if store.rules.contains_key(&rule.id) {
            return Err(RepositoryError::Conflict(rule.id));
        }
        let seq = store.next_seq;
        store.next_seq += 1;
        store.rules.insert(rule.id.clone(), (seq, rule));
        Ok(())
    }

    /// Replace an existing rule, returning the previous version.
    pub fn replace(&self, mut rule: Rule) -> Result<Rule, RepositoryError> {
        rule.validate()?;
        let mut store = self.store.write();
        let (_, slot) = store
            .rules
            .get_mut(&rule.id)
            .ok_or_else(|| RepositoryError::NotFound(rule.id.clone()))?;
        rule.created_at = slot.created_at;
        rule.updated_at = Utc::now();
        Ok(std::mem::replace(slot, rule))
    }

    pub fn remove(&self, id: &str) -> Result<Rule, RepositoryError> {
        self.store
            .write()
            .rules
            .remove(id)
            .map(|(_, rule)| rule)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))
    }

    /// Flip the enabled flag, returning the updated rule.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<Rule, RepositoryError> {
        let mut store = self.store.write();
        let (_, rule) = store
            .rules
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        if rule.enabled != enabled {
            rule.enabled = enabled;
            rule.updated_at = Utc::now();
        }
        Ok(rule.clone())
    }

    pub fn len(&self) -> usize {
        self.store.read().rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RuleRepository for InMemoryRuleRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<Rule>, RepositoryError> {
        Ok(self.store.read().rules.get(id).map(|(_, r)| r.clone()))
    }

    async fn find_enabled_by_environment(
        &self,
        project_id: &str,
        environment_id: &str,
    ) -> Result<Vec<Rule>, RepositoryError> {
        let store = self.store.read();
        let mut rules = store.sorted(|r| {
            r.enabled && r.project_id == project_id && r.environment_id == environment_id
        });
        // Stable sort keeps insertion order within a priority.
        rules.sort_by_key(|(_, r)| Reverse(r.priority));
        Ok(rules.into_iter().map(|(_, r)| r.clone()).collect())
    }

    async fn list(
        &self,
        filter: &RuleFilter,
        skip: usize,
        limit: Option<usize>,
    ) -> Result<Vec<Rule>, RepositoryError> {
        let store = self.store.read();
        Ok(store
            .sorted(|r| filter.matches(r))
            .into_iter()
            .skip(skip)
            .take(limit.unwrap_or(usize::MAX))
            .map(|(_, r)| r.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MatchCondition, SimpleCondition};

    fn rule(id: &str, env: &str, priority: i32) -> Rule {
        Rule {
            id: id.to_string(),
            name: id.to_string(),
            project_id: "p".to_string(),
            environment_id: env.to_string(),
            protocol: Default::default(),
            condition: MatchCondition::Simple(SimpleCondition::default()),
            priority,
            enabled: true,
            response: Default::default(),
            tags: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_find_enabled_sorted_by_priority_then_insertion() {
        let repo = InMemoryRuleRepository::from_rules([
            rule("low", "dev", 1),
            rule("first-high", "dev", 10),
            rule("second-high", "dev", 10),
            rule("other-env", "prod", 100),
        ])
        .unwrap();

        let ids: Vec<String> = repo
            .find_enabled_by_environment("p", "dev")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["first-high", "second-high", "low"]);
    }

    #[tokio::test]
    async fn test_disabled_rules_excluded() {
        let repo = InMemoryRuleRepository::from_rules([rule("a", "dev", 1)]).unwrap();
        repo.set_enabled("a", false).unwrap();
        assert!(repo
            .find_enabled_by_environment("p", "dev")
            .await
            .unwrap()
            .is_empty());
        assert!(repo.find_by_id("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_not_found_is_none_or_empty() {
        let repo = InMemoryRuleRepository::new();
        assert!(repo.find_by_id("missing").await.unwrap().is_none());
        assert!(repo
            .find_enabled_by_environment("p", "dev")
            .await
            .unwrap()
            .is_empty());
        assert!(matches!(
            repo.remove("missing"),
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_filter_skip_limit() {
        let mut tagged = rule("c", "dev", 0);
        tagged.tags = vec!["smoke".to_string()];
        let repo =
            InMemoryRuleRepository::from_rules([rule("a", "dev", 0), rule("b", "prod", 0), tagged])
                .unwrap();

        let all = repo.list(&RuleFilter::default(), 1, Some(1)).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "b");

        let filter = RuleFilter {
            tag: Some("smoke".to_string()),
            ..Default::default()
        };
        let smoke = repo.list(&filter, 0, None).await.unwrap();
        assert_eq!(smoke.len(), 1);
        assert_eq!(smoke[0].id, "c");
    }

    #[test]
    fn test_insert_rejects_duplicates_and_invalid_rules() {
        let repo = InMemoryRuleRepository::new();
        repo.insert(rule("a", "dev", 0)).unwrap();
        assert!(matches!(
            repo.insert(rule("a", "dev", 0)),
            Err(RepositoryError::Conflict(_))
        ));

        let mut bad = rule("b", "dev", 0);
        bad.response.content.status_code = 42;
        assert!(matches!(repo.insert(bad), Err(RepositoryError::Invalid(_))));
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn test_replace_keeps_insertion_position() {
        let repo =
            InMemoryRuleRepository::from_rules([rule("a", "dev", 5), rule("b", "dev", 5)]).unwrap();
        let mut updated = rule("a", "dev", 5);
        updated.name = "renamed".to_string();
        let old = repo.replace(updated).unwrap();
        assert_eq!(old.name, "a");

        let rules = repo.find_enabled_by_environment("p", "dev").await.unwrap();
        assert_eq!(rules[0].id, "a");
        assert_eq!(rules[0].name, "renamed");
    }
}
