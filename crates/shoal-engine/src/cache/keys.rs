//! Cache key namespace.
//!
//! Every key derived from rule data lives under one of three classes. The
//! admin mutation path relies on [`derived_keys`] to invalidate all of them.

use crate::model::Rule;

pub const RULE_BY_ID_PREFIX: &str = "rule:id:";
pub const PROJECT_RULES_PREFIX: &str = "rules:project:";
pub const ENABLED_RULES_PREFIX: &str = "rules:enabled:";

/// Class of a cache key, used to pick its TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyClass {
    RuleById,
    ProjectRules,
    EnabledRules,
    Other,
}

pub fn rule_by_id(rule_id: &str) -> String {
    format!("{RULE_BY_ID_PREFIX}{rule_id}")
}

pub fn project_rules(project_id: &str) -> String {
    format!("{PROJECT_RULES_PREFIX}{project_id}")
}

pub fn enabled_rules(project_id: &str, environment_id: &str) -> String {
    format!("{ENABLED_RULES_PREFIX}{project_id}:{environment_id}")
}

pub fn classify(key: &str) -> KeyClass {
    if key.starts_with(RULE_BY_ID_PREFIX) {
        KeyClass::RuleById
    } else if key.starts_with(PROJECT_RULES_PREFIX) {
        KeyClass::ProjectRules
    } else if key.starts_with(ENABLED_RULES_PREFIX) {
        KeyClass::EnabledRules
    } else {
        KeyClass::Other
    }
}

/// All keys whose cached value may contain `rule`.
pub fn derived_keys(rule: &Rule) -> [String; 3] {
    [
        rule_by_id(&rule.id),
        project_rules(&rule.project_id),
        enabled_rules(&rule.project_id, &rule.environment_id),
    ]
}
