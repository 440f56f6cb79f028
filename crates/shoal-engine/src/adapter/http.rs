//! HTTP/1.1 adapter on hyper.
//!
//! Request targets are `/<project>/<environment>/<path...>`; the match context
//! sees `/<path...>` (or `/` when nothing follows the environment).

use super::{AdapterError, ProtocolAdapter};
use crate::model::{parse_query_string, MatchContext, MockResponse, Protocol};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue};
use hyper::http::request::Parts;
use hyper::{Request, Response, StatusCode};
use tracing::warn;

/// Reserved prefix; never routed to rules.
pub const RESERVED_PREFIX: &str = "/_/";
pub const HEALTH_PATH: &str = "/_/health";
pub const METRICS_PATH: &str = "/_/metrics";

#[derive(Debug, Clone, Copy, Default)]
pub struct HttpAdapter;

impl HttpAdapter {
    pub fn new() -> Self {
        Self
    }

    /// Build a match context from request head and collected body.
    pub fn parse_parts(&self, parts: &Parts, body: Bytes) -> Result<MatchContext, AdapterError> {
        let raw_path = parts.uri.path();
        let (project, environment, path) = split_target(raw_path)
            .ok_or_else(|| AdapterError::InvalidTarget(raw_path.to_string()))?;

        let mut ctx = MatchContext::new(Protocol::Http, project, environment)
            .with_method(parts.method.as_str())
            .with_path(path)
            .with_body(body);
        ctx.query = parse_query_string(parts.uri.query());

        for (name, value) in parts.headers.iter() {
            match value.to_str() {
                // Repeated headers are joined the way HTTP allows.
                Ok(v) => {
                    ctx.headers
                        .entry(name.as_str().to_string())
                        .and_modify(|existing| {
                            existing.push_str(", ");
                            existing.push_str(v);
                        })
                        .or_insert_with(|| v.to_string());
                }
                Err(_) => warn!("Ignoring non-ASCII value of header {}", name),
            }
        }

        Ok(ctx)
    }

    /// Plain error response for requests that never reach the engine.
    pub fn error_response(
        &self,
        status: StatusCode,
        error: &str,
        message: &str,
    ) -> Response<Full<Bytes>> {
        let body = serde_json::json!({"error": error, "message": message});
        self.write_response(MockResponse::json(status.as_u16(), &body))
    }
}

/// Split `/<project>/<environment>/<rest>` into its parts.
fn split_target(path: &str) -> Option<(&str, &str, String)> {
    let trimmed = path.strip_prefix('/')?;
    let mut segments = trimmed.splitn(3, '/');
    let project = segments.next().filter(|s| !s.is_empty())?;
    let environment = segments.next().filter(|s| !s.is_empty())?;
    let rest = segments.next().unwrap_or("");
    Some((project, environment, format!("/{rest}")))
}

#[async_trait]
impl ProtocolAdapter for HttpAdapter {
    type Request = Request<Incoming>;
    type Response = Response<Full<Bytes>>;

    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    async fn parse(&self, request: Self::Request) -> Result<MatchContext, AdapterError> {
        let (parts, body) = request.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| AdapterError::Body(e.to_string()))?
            .to_bytes();
        self.parse_parts(&parts, body)
    }

    fn write_response(&self, response: MockResponse) -> Self::Response {
        let status = StatusCode::from_u16(response.status_code).unwrap_or_else(|_| {
            warn!("Replacing invalid status {} with 500", response.status_code);
            StatusCode::INTERNAL_SERVER_ERROR
        });

        let mut out = Response::new(Full::new(response.body));
        *out.status_mut() = status;
        let headers = out.headers_mut();
        for (name, value) in &response.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => warn!("Dropping invalid response header {}", name),
            }
        }
        if let Some(rule_id) = response.rule_id.as_deref() {
            if let Ok(value) = HeaderValue::from_str(rule_id) {
                headers.insert("x-shoal-rule-id", value);
            }
        }
        out
    }
}
