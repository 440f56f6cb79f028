//! Placeholder substitution for dynamic responses.
//!
//! # Supported placeholders
//!
//! - `${request.method}`, `${request.path}`, `${request.body}`
//! - `${request.query.<name>}`
//! - `${request.headers.<name>}` (case-insensitive)
//! - `${request.pathParams.<name>}` from a `:name` / `{name}` route pattern
//! - `${request.body.<a.b.0>}` - a field of the JSON request body
//! - `${env.<NAME>}` - variable configured for the request's environment
//! - `${uuid}`, `${now}` (RFC 3339), `${timestamp}` (unix millis)
//!
//! Unknown or unresolved placeholders render as an empty string.
//!
//! # Example
//!
//! ```yaml
//! response:
//!   type: dynamic
//!   content:
//!     body:
//!       echo: "${request.query.message}"
//!       user: "${request.pathParams.id}"
//! ```

use crate::model::MatchContext;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Matches `${name}` and `${name.part.part}`.
static TEMPLATE_REGEX: OnceLock<Regex> = OnceLock::new();

fn get_template_regex() -> &'static Regex {
    TEMPLATE_REGEX.get_or_init(|| {
        Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z0-9_-]+)*)\}")
            .expect("template regex is valid")
    })
}

/// Values visible to templates for one request.
pub struct TemplateContext<'a> {
    request: &'a MatchContext,
    path_params: HashMap<String, String>,
    env: &'a HashMap<String, String>,
    json_body: OnceLock<Option<Value>>,
}

impl<'a> TemplateContext<'a> {
    pub fn new(
        request: &'a MatchContext,
        path_params: HashMap<String, String>,
        env: &'a HashMap<String, String>,
    ) -> Self {
        Self {
            request,
            path_params,
            env,
            json_body: OnceLock::new(),
        }
    }

    pub fn path_params(&self) -> &HashMap<String, String> {
        &self.path_params
    }

    /// Value of a placeholder name such as `request.query.page`.
    pub fn get(&self, name: &str) -> Option<String> {
        let (head, rest) = name.split_once('.').unwrap_or((name, ""));
        match (head, rest) {
            ("uuid", "") => Some(uuid::Uuid::new_v4().to_string()),
            ("now", "") => Some(chrono::Utc::now().to_rfc3339()),
            ("timestamp", "") => Some(chrono::Utc::now().timestamp_millis().to_string()),
            ("env", var) if !var.is_empty() => self.env.get(var).cloned(),
            ("request", field) => self.request_field(field),
            _ => None,
        }
    }

    fn request_field(&self, field: &str) -> Option<String> {
        let parts: Vec<&str> = field.splitn(2, '.').collect();
        match parts.as_slice() {
            ["method"] => Some(self.request.method.clone()),
            ["path"] => Some(self.request.path.clone()),
            ["body"] => Some(self.request.body_str().into_owned()),
            ["query", name] => self.request.query.get(*name).cloned(),
            ["headers", name] => self.request.header(name).map(str::to_string),
            ["pathParams", name] | ["path_params", name] => self.path_params.get(*name).cloned(),
            ["body", path] => {
                let body = self
                    .json_body
                    .get_or_init(|| self.request.json_body())
                    .as_ref()?;
                lookup_json(body, path).map(json_to_text)
            }
            _ => None,
        }
    }
}

fn lookup_json<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn json_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Substitute every placeholder in `template`.
pub fn process_template(template: &str, ctx: &TemplateContext<'_>) -> String {
    get_template_regex()
        .replace_all(template, |caps: &regex::Captures| {
            ctx.get(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

/// Substitute placeholders in every string leaf of a JSON value.
pub fn render_value(value: &Value, ctx: &TemplateContext<'_>) -> Value {
    match value {
        Value::String(s) if has_template_variables(s) => Value::String(process_template(s, ctx)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Check if a string contains template variables
pub fn has_template_variables(s: &str) -> bool {
    get_template_regex().is_match(s)
}

/// Match `path` against a route pattern, returning the captured parameters.
///
/// Segments written `:name` or `{name}` capture one path segment. A pattern
/// without parameters must equal the path. A trailing slash is ignored on
/// both sides.
pub fn extract_path_params(pattern: &str, path: &str) -> Option<HashMap<String, String>> {
    let pattern = trim_trailing_slash(pattern);
    let path = trim_trailing_slash(path);
    let mut params = HashMap::new();

    let pattern_parts: Vec<&str> = pattern.split('/').collect();
    let path_parts: Vec<&str> = path.split('/').collect();
    if pattern_parts.len() != path_parts.len() {
        return None;
    }

    for (pattern_part, path_part) in pattern_parts.iter().zip(path_parts.iter()) {
        let param_name = pattern_part.strip_prefix(':').or_else(|| {
            pattern_part
                .strip_prefix('{')
                .and_then(|p| p.strip_suffix('}'))
        });
        match param_name {
            Some(name) if !name.is_empty() && !path_part.is_empty() => {
                params.insert(name.to_string(), path_part.to_string());
            }
            _ if pattern_part == path_part => {}
            _ => return None,
        }
    }

    Some(params)
}

fn trim_trailing_slash(s: &str) -> &str {
    if s.len() > 1 {
        s.strip_suffix('/').unwrap_or(s)
    } else {
        s
    }
}
