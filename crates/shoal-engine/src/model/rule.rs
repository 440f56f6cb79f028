//! Rule definitions: the stored predicate + response pairing scoped to a
//! project/environment namespace.

use crate::executor::DelayConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Transport protocol a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    #[serde(alias = "ws")]
    WebSocket,
    Grpc,
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::WebSocket => "websocket",
            Protocol::Grpc => "grpc",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discriminant of [`MatchCondition`], used for logging and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Simple,
    Regex,
    Script,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Simple => "simple",
            MatchType::Regex => "regex",
            MatchType::Script => "script",
        }
    }
}

/// Predicate of a rule. The variant decides how the payload is evaluated.
///
/// ```yaml
/// match:
///   type: simple
///   method: [GET, HEAD]
///   path: /api/users/:id
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MatchCondition {
    Simple(SimpleCondition),
    Regex(RegexCondition),
    Script(ScriptCondition),
}

impl MatchCondition {
    pub fn match_type(&self) -> MatchType {
        match self {
            MatchCondition::Simple(_) => MatchType::Simple,
            MatchCondition::Regex(_) => MatchType::Regex,
            MatchCondition::Script(_) => MatchType::Script,
        }
    }
}

/// Field/value equality predicate. Every absent field is a wildcard.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SimpleCondition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<MethodMatch>,
    /// Exact path, or a pattern with `:name` / `{name}` segments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub query: HashMap<String, String>,
    /// JSON value the request body must contain (object subset semantics).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// A single method or a list of allowed methods.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MethodMatch {
    One(String),
    Any(Vec<String>),
}

impl MethodMatch {
    /// Case-insensitive membership test.
    pub fn allows(&self, method: &str) -> bool {
        match self {
            MethodMatch::One(m) => m.eq_ignore_ascii_case(method),
            MethodMatch::Any(ms) => ms.iter().any(|m| m.eq_ignore_ascii_case(method)),
        }
    }
}

/// Regular-expression predicate over designated request fields.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RegexCondition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Header name -> pattern
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

impl RegexCondition {
    pub fn is_empty(&self) -> bool {
        self.path.is_none() && self.body.is_none() && self.headers.is_empty()
    }
}

/// Sandboxed expression evaluated against the request; must yield a bool.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScriptCondition {
    pub script: String,
}

/// How the response body is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    #[default]
    Static,
    Dynamic,
    Proxy,
    Script,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Static => "static",
            ResponseType::Dynamic => "dynamic",
            ResponseType::Proxy => "proxy",
            ResponseType::Script => "script",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct ResponseSpec {
    #[serde(rename = "type", default)]
    pub kind: ResponseType,
    #[serde(default)]
    pub content: ResponseContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<DelayConfig>,
}

/// Response payload. Which fields are meaningful depends on [`ResponseType`]:
/// `body` is a literal (static) or template (dynamic), `target` is the upstream
/// for proxy responses and `script` the expression for script responses.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ResponseContent {
    #[serde(default = "default_status_code")]
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    /// Upstream timeout for proxy responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_status_code() -> u16 {
    200
}

impl Default for ResponseContent {
    fn default() -> Self {
        Self {
            status_code: default_status_code(),
            headers: HashMap::new(),
            body: None,
            content_type: None,
            target: None,
            script: None,
            timeout_ms: None,
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// A matching + response unit.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Rule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub project_id: String,
    pub environment_id: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(rename = "match")]
    pub condition: MatchCondition,
    /// Higher values are evaluated first
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub response: ResponseSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    pub fn match_type(&self) -> MatchType {
        self.condition.match_type()
    }

    /// Structural checks performed before a rule is stored.
    pub fn validate(&self) -> Result<(), RuleValidationError> {
        if self.id.trim().is_empty() {
            return Err(RuleValidationError::MissingField("id"));
        }
        if self.project_id.trim().is_empty() {
            return Err(RuleValidationError::MissingField("project_id"));
        }
        if self.environment_id.trim().is_empty() {
            return Err(RuleValidationError::MissingField("environment_id"));
        }
        if !(100..=599).contains(&self.response.content.status_code) {
            return Err(RuleValidationError::InvalidStatus(
                self.response.content.status_code,
            ));
        }
        match self.response.kind {
            ResponseType::Proxy if self.response.content.target.is_none() => {
                return Err(RuleValidationError::MissingField("response.content.target"));
            }
            ResponseType::Script if self.response.content.script.is_none() => {
                return Err(RuleValidationError::MissingField("response.content.script"));
            }
            _ => {}
        }
        if let MatchCondition::Script(ScriptCondition { script }) = &self.condition {
            if script.trim().is_empty() {
                return Err(RuleValidationError::MissingField("match.script"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RuleValidationError {
    #[error("rule is missing required field '{0}'")]
    MissingField(&'static str),
    #[error("invalid status code {0}")]
    InvalidStatus(u16),
}
