//! Rule predicates: simple field equality, regular expressions and scripts.

use crate::executor::template::extract_path_params;
use crate::model::{MatchCondition, MatchContext, RegexCondition, SimpleCondition};
use crate::scripting::{ScriptError, ScriptSandbox};
use parking_lot::RwLock;
use regex::{Regex, RegexBuilder};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Compiled program size allowed for one pattern.
const REGEX_SIZE_LIMIT: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum PredicateError {
    #[error("invalid regex for {field}: {reason}")]
    InvalidRegex { field: String, reason: String },

    #[error("regex for {field} must be anchored with ^ and $: {pattern}")]
    UnanchoredRegex { field: String, pattern: String },

    #[error(transparent)]
    Script(#[from] ScriptError),
}

/// Bounded memo of compiled patterns. Compilation failures are cached as
/// well so a broken rule does not recompile on every request.
pub struct RegexCache {
    max_entries: usize,
    compiled: RwLock<HashMap<String, Result<Arc<Regex>, String>>>,
}

impl RegexCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            compiled: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, pattern: &str) -> Result<Arc<Regex>, String> {
        if let Some(entry) = self.compiled.read().get(pattern) {
            return entry.clone();
        }

        let entry = RegexBuilder::new(pattern)
            .size_limit(REGEX_SIZE_LIMIT)
            .build()
            .map(Arc::new)
            .map_err(|e| e.to_string());

        let mut compiled = self.compiled.write();
        if compiled.len() >= self.max_entries {
            debug!("Regex cache full ({} patterns), clearing", compiled.len());
            compiled.clear();
        }
        compiled.insert(pattern.to_string(), entry.clone());
        entry
    }

    pub fn len(&self) -> usize {
        self.compiled.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Evaluate one rule condition against a request.
pub async fn evaluate(
    condition: &MatchCondition,
    request: &MatchContext,
    regexes: &RegexCache,
    sandbox: &ScriptSandbox,
) -> Result<bool, PredicateError> {
    match condition {
        MatchCondition::Simple(simple) => Ok(matches_simple(simple, request)),
        MatchCondition::Regex(regex) => matches_regex(regex, request, regexes),
        MatchCondition::Script(script) => {
            Ok(sandbox.eval_predicate(&script.script, request).await?)
        }
    }
}

/// Every present field must match; absent fields match anything.
pub fn matches_simple(cond: &SimpleCondition, request: &MatchContext) -> bool {
    if let Some(method) = &cond.method {
        if !method.allows(&request.method) {
            return false;
        }
    }

    if let Some(path) = &cond.path {
        if extract_path_params(path, &request.path).is_none() {
            return false;
        }
    }

    let headers_match = cond
        .headers
        .iter()
        .all(|(name, expected)| request.header(name) == Some(expected.as_str()));
    if !headers_match {
        return false;
    }

    let query_match = cond
        .query
        .iter()
        .all(|(name, expected)| request.query.get(name) == Some(expected));
    if !query_match {
        return false;
    }

    match &cond.body {
        None => true,
        Some(expected) => match request.json_body() {
            Some(actual) => json_contains(&actual, expected),
            // Non-JSON bodies can only match a literal string.
            None => matches!(expected, Value::String(s) if *s == request.body_str()),
        },
    }
}

/// Whether `actual` contains `expected`: objects by key subset, arrays by
/// element containment, scalars by equality.
pub fn json_contains(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Object(actual), Value::Object(expected)) => expected
            .iter()
            .all(|(k, v)| actual.get(k).is_some_and(|a| json_contains(a, v))),
        (Value::Array(actual), Value::Array(expected)) => expected
            .iter()
            .all(|e| actual.iter().any(|a| json_contains(a, e))),
        _ => actual == expected,
    }
}

/// Whether `pattern` is pinned to both ends of the input.
pub fn is_anchored(pattern: &str) -> bool {
    let starts = pattern.starts_with('^') || pattern.starts_with(r"\A");
    let ends = pattern.ends_with(r"\z") || (pattern.ends_with('$') && !pattern.ends_with(r"\$"));
    starts && ends
}

/// Every pattern must be anchored (`^...$`) and match its field in full.
/// Unanchored or invalid patterns are errors, which the engine treats as
/// non-matching. A condition without patterns never matches.
pub fn matches_regex(
    cond: &RegexCondition,
    request: &MatchContext,
    regexes: &RegexCache,
) -> Result<bool, PredicateError> {
    if cond.is_empty() {
        return Ok(false);
    }

    let compile = |field: &str, pattern: &str| {
        if !is_anchored(pattern) {
            return Err(PredicateError::UnanchoredRegex {
                field: field.to_string(),
                pattern: pattern.to_string(),
            });
        }
        regexes
            .get(pattern)
            .map_err(|reason| PredicateError::InvalidRegex {
                field: field.to_string(),
                reason,
            })
    };

    if let Some(pattern) = &cond.path {
        if !compile("path", pattern)?.is_match(&request.path) {
            return Ok(false);
        }
    }

    if let Some(pattern) = &cond.body {
        if !compile("body", pattern)?.is_match(&request.body_str()) {
            return Ok(false);
        }
    }

    for (name, pattern) in &cond.headers {
        let re = compile(&format!("header '{name}'"), pattern)?;
        match request.header(name) {
            Some(value) if re.is_match(value) => {}
            _ => return Ok(false),
        }
    }

    Ok(true)
}
