//! Canonical response produced by the executor and written by adapters.

use bytes::Bytes;

#[derive(Debug, Clone, PartialEq)]
pub struct MockResponse {
    pub status_code: u16,
    /// Ordered header list; duplicates are allowed (e.g. relayed `set-cookie`).
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Rule that produced the response; `None` for the default response.
    pub rule_id: Option<String>,
    /// Simulated latency applied before the response was produced
    pub delay_ms: u64,
}

impl MockResponse {
    pub fn new(status_code: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status_code,
            headers: Vec::new(),
            body: body.into(),
            rule_id: None,
            delay_ms: 0,
        }
    }

    /// JSON response with `application/json` content type.
    pub fn json(status_code: u16, value: &serde_json::Value) -> Self {
        let mut response = Self::new(status_code, value.to_string());
        response.set_header("content-type", "application/json");
        response
    }

    /// First value of a header, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace every existing value of `name` with a single value.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_ascii_lowercase(), value.into()));
    }

    pub fn append_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
    }

    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}
