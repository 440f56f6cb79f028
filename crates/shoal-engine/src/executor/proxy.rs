//! Upstream forwarding for proxy responses.

use crate::model::{MatchContext, MockResponse};
use bytes::Bytes;
use std::time::{Duration, Instant};
use tracing::debug;

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_forwardable(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name != "host" && name != "content-length" && !HOP_BY_HOP.contains(&name.as_str())
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid proxy request: {0}")]
    InvalidRequest(String),

    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("failed to read upstream body: {0}")]
    Body(String),
}

pub struct ProxyForwarder {
    client: reqwest::Client,
}

impl Default for ProxyForwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyForwarder {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    /// Target URL for a request: target base + request path + query.
    pub fn target_url(target: &str, request: &MatchContext) -> String {
        let mut url = format!("{}{}", target.trim_end_matches('/'), request.path);
        if !request.query.is_empty() {
            let mut pairs: Vec<(&String, &String)> = request.query.iter().collect();
            pairs.sort();
            let query = pairs
                .into_iter()
                .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            url.push('?');
            url.push_str(&query);
        }
        url
    }

    pub async fn forward(
        &self,
        request: &MatchContext,
        target: &str,
        timeout: Duration,
    ) -> Result<MockResponse, ProxyError> {
        let url = Self::target_url(target, request);
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| ProxyError::InvalidRequest(format!("method {}: {e}", request.method)))?;

        let mut builder = self.client.request(method, &url).timeout(timeout);
        for (name, value) in &request.headers {
            if is_forwardable(name) {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let start = Instant::now();
        let response = builder.send().await.map_err(|e| classify(e, timeout))?;

        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter(|(k, _)| is_forwardable(k.as_str()))
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body: Bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                ProxyError::Timeout(timeout)
            } else {
                ProxyError::Body(e.to_string())
            }
        })?;

        debug!(
            "Proxied {} {} -> {} in {}ms",
            request.method,
            url,
            status,
            start.elapsed().as_millis()
        );

        let mut mock = MockResponse::new(status, body);
        mock.headers = headers;
        Ok(mock)
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> ProxyError {
    if err.is_timeout() {
        ProxyError::Timeout(timeout)
    } else if err.is_builder() {
        ProxyError::InvalidRequest(err.to_string())
    } else {
        ProxyError::Upstream(err.to_string())
    }
}
