//! Response executor: turns a matched rule into a concrete response.
//!
//! Order of work for one rule:
//! 1. validate the response configuration
//! 2. sleep for the resolved delay (cancellable, no lock held)
//! 3. generate status, headers and body for the response type
//! 4. settle the content type
//!
//! Configuration defects surface as [`ExecutorError`]; runtime failures of
//! proxy and script responses are turned into 502 / 500 diagnostic bodies.

mod delay;
mod proxy;
pub mod template;

pub use delay::DelayConfig;
pub use proxy::{ProxyError, ProxyForwarder};

use crate::metrics;
use crate::model::{MatchCondition, MatchContext, MockResponse, ResponseType, Rule};
use crate::scripting::ScriptSandbox;
use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use template::{extract_path_params, process_template, render_value, TemplateContext};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ExecutorError {
    #[error("invalid status code {0}")]
    InvalidStatus(u16),

    #[error("invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("proxy response of rule '{0}' has no target")]
    MissingProxyTarget(String),

    #[error("script response of rule '{0}' has no script")]
    MissingScript(String),

    #[error("request cancelled")]
    Cancelled,
}

/// Response returned when no rule matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultResponseConfig {
    pub status_code: u16,
    pub body: Value,
}

impl Default for DefaultResponseConfig {
    fn default() -> Self {
        Self {
            status_code: 404,
            body: json!({
                "error": "no_matching_rule",
                "message": "No enabled rule matched the request"
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Upper bound for any resolved delay
    pub max_delay_ms: u64,
    /// Upstream timeout for proxy responses without their own `timeout_ms`
    pub proxy_timeout_ms: u64,
    pub default_response: DefaultResponseConfig,
    /// environment id -> variables exposed as `${env.NAME}`
    pub environments: HashMap<String, HashMap<String, String>>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_delay_ms: 60_000,
            proxy_timeout_ms: 30_000,
            default_response: DefaultResponseConfig::default(),
            environments: HashMap::new(),
        }
    }
}

pub struct ResponseExecutor {
    config: ExecutorConfig,
    sandbox: Arc<ScriptSandbox>,
    proxy: ProxyForwarder,
    no_env: HashMap<String, String>,
}

impl ResponseExecutor {
    pub fn new(config: ExecutorConfig, sandbox: Arc<ScriptSandbox>) -> Self {
        Self {
            config,
            sandbox,
            proxy: ProxyForwarder::new(),
            no_env: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Stable response for requests no rule matched.
    pub fn default_response(&self) -> MockResponse {
        let default = &self.config.default_response;
        MockResponse::json(default.status_code, &default.body)
    }

    pub async fn execute(
        &self,
        request: &MatchContext,
        rule: &Rule,
    ) -> Result<MockResponse, ExecutorError> {
        self.execute_cancellable(request, rule, &CancellationToken::new())
            .await
    }

    /// Execute `rule`, abandoning the delay, proxy call or script once
    /// `cancel` fires.
    pub async fn execute_cancellable(
        &self,
        request: &MatchContext,
        rule: &Rule,
        cancel: &CancellationToken,
    ) -> Result<MockResponse, ExecutorError> {
        let content = &rule.response.content;
        if !(100..=599).contains(&content.status_code) {
            return Err(ExecutorError::InvalidStatus(content.status_code));
        }

        let delay_ms = rule
            .response
            .delay
            .as_ref()
            .map(|d| d.resolve_ms(self.config.max_delay_ms))
            .unwrap_or(0);
        if delay_ms > 0 {
            debug!(rule_id = %rule.id, delay_ms, "applying response delay");
            metrics::record_delay(delay_ms);
            tokio::select! {
                _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            }
        }

        let path_params = match &rule.condition {
            MatchCondition::Simple(simple) => simple
                .path
                .as_deref()
                .and_then(|pattern| extract_path_params(pattern, &request.path))
                .unwrap_or_default(),
            _ => HashMap::new(),
        };
        let env = self
            .config
            .environments
            .get(&request.environment_id)
            .unwrap_or(&self.no_env);

        let mut response = match rule.response.kind {
            ResponseType::Static => {
                let mut response = Self::build(content.status_code, content.body.as_ref());
                for (name, value) in &content.headers {
                    response.set_header(
                        &valid_header_name(name)?,
                        valid_header_value(name, value)?,
                    );
                }
                Self::settle_content_type(
                    &mut response,
                    content.content_type.as_deref(),
                    content.body.as_ref(),
                );
                response
            }
            ResponseType::Dynamic => {
                let ctx = TemplateContext::new(request, path_params, env);
                let body = content.body.as_ref().map(|b| render_value(b, &ctx));
                let mut response = Self::build(content.status_code, body.as_ref());
                for (name, value) in &content.headers {
                    let rendered = process_template(value, &ctx);
                    response.set_header(
                        &valid_header_name(name)?,
                        valid_header_value(name, &rendered)?,
                    );
                }
                Self::settle_content_type(
                    &mut response,
                    content.content_type.as_deref(),
                    body.as_ref(),
                );
                response
            }
            ResponseType::Proxy => {
                let target = content
                    .target
                    .as_deref()
                    .ok_or_else(|| ExecutorError::MissingProxyTarget(rule.id.clone()))?;
                let timeout = Duration::from_millis(
                    content.timeout_ms.unwrap_or(self.config.proxy_timeout_ms),
                );
                let result = tokio::select! {
                    _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
                    result = self.proxy.forward(request, target, timeout) => result,
                };
                match result {
                    Ok(response) => response,
                    Err(e) => {
                        warn!("Proxy rule {} failed for {}: {}", rule.id, target, e);
                        metrics::record_proxy_failure();
                        MockResponse::json(
                            502,
                            &json!({
                                "error": "upstream_failure",
                                "message": e.to_string(),
                                "target": target,
                            }),
                        )
                    }
                }
            }
            ResponseType::Script => {
                let script = content
                    .script
                    .as_deref()
                    .ok_or_else(|| ExecutorError::MissingScript(rule.id.clone()))?;
                let evaluation = self.sandbox.eval_response(script, request, &path_params, env);
                let result = tokio::select! {
                    _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
                    result = evaluation => result,
                };
                match result {
                    Ok(result) => {
                        let status = result.status_code.unwrap_or(content.status_code);
                        if !(100..=599).contains(&status) {
                            Self::script_failure(&rule.id, &format!("invalid status code {status}"))
                        } else {
                            let body = (!result.body.is_null()).then_some(result.body);
                            let mut response = Self::build(status, body.as_ref());
                            for (name, value) in content.headers.iter().chain(
                                result.headers.iter().map(|(k, v)| (k, v)),
                            ) {
                                response.set_header(
                                    &valid_header_name(name)?,
                                    valid_header_value(name, value)?,
                                );
                            }
                            Self::settle_content_type(
                                &mut response,
                                content.content_type.as_deref(),
                                body.as_ref(),
                            );
                            response
                        }
                    }
                    Err(e) => Self::script_failure(&rule.id, &e.to_string()),
                }
            }
        };

        response.rule_id = Some(rule.id.clone());
        response.delay_ms = delay_ms;
        metrics::record_response(rule.response.kind.as_str(), response.status_code);
        Ok(response)
    }

    fn script_failure(rule_id: &str, message: &str) -> MockResponse {
        warn!("Script response of rule {} failed: {}", rule_id, message);
        metrics::record_rule_eval_error("script");
        MockResponse::json(
            500,
            &json!({
                "error": "script_failure",
                "message": message,
                "rule_id": rule_id,
            }),
        )
    }

    /// Strings are sent verbatim; other JSON values are serialized.
    fn build(status_code: u16, body: Option<&Value>) -> MockResponse {
        let bytes = match body {
            None | Some(Value::Null) => Bytes::new(),
            Some(Value::String(s)) => Bytes::from(s.clone()),
            Some(other) => Bytes::from(other.to_string()),
        };
        MockResponse::new(status_code, bytes)
    }

    /// Explicit `content_type` wins, then a declared header, then a type
    /// inferred from the body.
    fn settle_content_type(
        response: &mut MockResponse,
        explicit: Option<&str>,
        body: Option<&Value>,
    ) {
        if let Some(content_type) = explicit {
            response.set_header("content-type", content_type);
            return;
        }
        if response.header("content-type").is_some() {
            return;
        }
        match body {
            None | Some(Value::Null) => {}
            Some(Value::String(_)) => {
                response.set_header("content-type", "text/plain; charset=utf-8")
            }
            Some(_) => response.set_header("content-type", "application/json"),
        }
    }
}

fn valid_header_name(name: &str) -> Result<String, ExecutorError> {
    HeaderName::from_bytes(name.as_bytes())
        .map(|n| n.as_str().to_string())
        .map_err(|e| ExecutorError::InvalidHeader {
            name: name.to_string(),
            reason: e.to_string(),
        })
}

fn valid_header_value(name: &str, value: &str) -> Result<String, ExecutorError> {
    HeaderValue::from_str(value)
        .map(|_| value.to_string())
        .map_err(|e| ExecutorError::InvalidHeader {
            name: name.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Protocol, ResponseContent, ResponseSpec, SimpleCondition};
    use crate::scripting::SandboxConfig;
    use chrono::Utc;
    use http_body_util::{BodyExt, Full};
    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::Request;
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::time::Instant;
    use tokio::net::TcpListener;

    fn executor() -> ResponseExecutor {
        let config = ExecutorConfig {
            environments: HashMap::from([(
                "dev".to_string(),
                HashMap::from([("REGION".to_string(), "eu-west".to_string())]),
            )]),
            ..Default::default()
        };
        ResponseExecutor::new(config, Arc::new(ScriptSandbox::new(SandboxConfig::default())))
    }

    fn rule(kind: ResponseType, content: ResponseContent) -> Rule {
        Rule {
            id: "r1".to_string(),
            name: String::new(),
            project_id: "shop".to_string(),
            environment_id: "dev".to_string(),
            protocol: Protocol::Http,
            condition: MatchCondition::Simple(SimpleCondition {
                path: Some("/users/:id".to_string()),
                ..Default::default()
            }),
            priority: 0,
            enabled: true,
            response: ResponseSpec {
                kind,
                content,
                delay: None,
            },
            tags: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn request() -> MatchContext {
        MatchContext::new(Protocol::Http, "shop", "dev")
            .with_method("GET")
            .with_path("/users/42")
            .with_query("verbose", "1")
    }

    #[tokio::test]
    async fn test_static_text_body() {
        let r = rule(
            ResponseType::Static,
            ResponseContent {
                body: Some(json!("ok")),
                ..Default::default()
            },
        );
        let start = Instant::now();
        let resp = executor().execute(&request(), &r).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.body_str(), "ok");
        assert_eq!(resp.header("content-type"), Some("text/plain; charset=utf-8"));
        assert_eq!(resp.rule_id.as_deref(), Some("r1"));
        assert_eq!(resp.delay_ms, 0);
    }

    #[tokio::test]
    async fn test_static_json_body_and_content_type_precedence() {
        let mut content = ResponseContent {
            status_code: 201,
            body: Some(json!({"id": 1})),
            ..Default::default()
        };
        let resp = executor()
            .execute(&request(), &rule(ResponseType::Static, content.clone()))
            .await
            .unwrap();
        assert_eq!(resp.status_code, 201);
        assert_eq!(resp.body_str(), r#"{"id":1}"#);
        assert_eq!(resp.header("content-type"), Some("application/json"));

        content
            .headers
            .insert("Content-Type".to_string(), "application/vnd.api+json".to_string());
        let resp = executor()
            .execute(&request(), &rule(ResponseType::Static, content.clone()))
            .await
            .unwrap();
        assert_eq!(resp.header("content-type"), Some("application/vnd.api+json"));

        content.content_type = Some("application/hal+json".to_string());
        let resp = executor()
            .execute(&request(), &rule(ResponseType::Static, content))
            .await
            .unwrap();
        assert_eq!(resp.header("content-type"), Some("application/hal+json"));
    }

    #[tokio::test]
    async fn test_dynamic_body_and_headers() {
        let content = ResponseContent {
            headers: HashMap::from([(
                "x-user".to_string(),
                "${request.pathParams.id}".to_string(),
            )]),
            body: Some(json!({
                "id": "${request.pathParams.id}",
                "verbose": "${request.query.verbose}",
                "region": "${env.REGION}"
            })),
            ..Default::default()
        };
        let resp = executor()
            .execute(&request(), &rule(ResponseType::Dynamic, content))
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(body, json!({"id": "42", "verbose": "1", "region": "eu-west"}));
        assert_eq!(resp.header("x-user"), Some("42"));
    }

    #[tokio::test]
    async fn test_script_response() {
        let content = ResponseContent {
            script: Some(
                r#"#{ status_code: 202, headers: #{ "x-id": request.pathParams.id }, body: #{ ok: true } }"#
                    .to_string(),
            ),
            ..Default::default()
        };
        let resp = executor()
            .execute(&request(), &rule(ResponseType::Script, content))
            .await
            .unwrap();
        assert_eq!(resp.status_code, 202);
        assert_eq!(resp.header("x-id"), Some("42"));
        assert_eq!(resp.body_str(), r#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn test_script_failure_degrades_to_500() {
        let content = ResponseContent {
            script: Some("throw \"boom\"".to_string()),
            ..Default::default()
        };
        let resp = executor()
            .execute(&request(), &rule(ResponseType::Script, content))
            .await
            .unwrap();
        assert_eq!(resp.status_code, 500);
        assert!(resp.body_str().contains("script_failure"));
    }

    #[tokio::test]
    async fn test_configuration_defects_are_errors() {
        let exec = executor();
        let bad_status = rule(
            ResponseType::Static,
            ResponseContent {
                status_code: 999,
                ..Default::default()
            },
        );
        assert_eq!(
            exec.execute(&request(), &bad_status).await.unwrap_err(),
            ExecutorError::InvalidStatus(999)
        );

        let no_target = rule(ResponseType::Proxy, ResponseContent::default());
        assert!(matches!(
            exec.execute(&request(), &no_target).await,
            Err(ExecutorError::MissingProxyTarget(_))
        ));

        let no_script = rule(ResponseType::Script, ResponseContent::default());
        assert!(matches!(
            exec.execute(&request(), &no_script).await,
            Err(ExecutorError::MissingScript(_))
        ));

        let bad_header = rule(
            ResponseType::Static,
            ResponseContent {
                headers: HashMap::from([("bad header".to_string(), "v".to_string())]),
                ..Default::default()
            },
        );
        assert!(matches!(
            exec.execute(&request(), &bad_header).await,
            Err(ExecutorError::InvalidHeader { .. })
        ));
    }

    #[tokio::test]
    async fn test_fixed_delay_applied() {
        let mut r = rule(ResponseType::Static, ResponseContent::default());
        r.response.delay = Some(DelayConfig::Fixed { fixed: 60 });
        let start = Instant::now();
        let resp = executor().execute(&request(), &r).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(60));
        assert_eq!(resp.delay_ms, 60);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_delay() {
        let mut r = rule(ResponseType::Static, ResponseContent::default());
        r.response.delay = Some(DelayConfig::Fixed { fixed: 10_000 });
        let exec = executor();
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let result = exec.execute_cancellable(&request(), &r, &token).await;
        assert_eq!(result.unwrap_err(), ExecutorError::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_proxy_call() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accepts connections and never answers.
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let r = rule(
            ResponseType::Proxy,
            ResponseContent {
                target: Some(format!("http://{addr}")),
                timeout_ms: Some(10_000),
                ..Default::default()
            },
        );
        let exec = executor();
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let result = exec.execute_cancellable(&request(), &r, &token).await;
        assert_eq!(result.unwrap_err(), ExecutorError::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_concurrent_executions_are_independent() {
        let exec = Arc::new(executor());
        let mut slow = rule(
            ResponseType::Static,
            ResponseContent {
                body: Some(json!("slow")),
                ..Default::default()
            },
        );
        slow.response.delay = Some(DelayConfig::Fixed { fixed: 100 });
        let fast = rule(
            ResponseType::Dynamic,
            ResponseContent {
                body: Some(json!({"id": "${request.pathParams.id}"})),
                ..Default::default()
            },
        );

        let start = Instant::now();
        let mut tasks = Vec::new();
        for i in 0..32 {
            let exec = Arc::clone(&exec);
            let r = if i % 2 == 0 { slow.clone() } else { fast.clone() };
            tasks.push(tokio::spawn(async move {
                let req = MatchContext::new(Protocol::Http, "shop", "dev")
                    .with_method("GET")
                    .with_path(format!("/users/{i}"));
                (i, exec.execute(&req, &r).await.unwrap())
            }));
        }
        for task in tasks {
            let (i, resp) = task.await.unwrap();
            if i % 2 == 0 {
                assert_eq!(resp.body_str(), "slow");
                assert_eq!(resp.delay_ms, 100);
            } else {
                let body: Value = serde_json::from_slice(&resp.body).unwrap();
                assert_eq!(body["id"], i.to_string());
            }
        }
        // Delays overlap instead of queueing behind each other.
        assert!(start.elapsed() < Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_default_response() {
        let resp = executor().default_response();
        assert_eq!(resp.status_code, 404);
        assert_eq!(resp.header("content-type"), Some("application/json"));
        assert!(resp.rule_id.is_none());
    }

    async fn spawn_upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let path = req.uri().path_and_query().map(|p| p.to_string());
                        let tenant = req
                            .headers()
                            .get("x-tenant")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("")
                            .to_string();
                        let body = req.into_body().collect().await.unwrap().to_bytes();
                        let reply = json!({
                            "path": path,
                            "tenant": tenant,
                            "body": String::from_utf8_lossy(&body),
                        });
                        Ok::<_, Infallible>(
                            hyper::Response::builder()
                                .status(207)
                                .header("x-upstream", "yes")
                                .body(Full::new(Bytes::from(reply.to_string())))
                                .unwrap(),
                        )
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_proxy_relays_upstream_response() {
        let target = spawn_upstream().await;
        let r = rule(
            ResponseType::Proxy,
            ResponseContent {
                target: Some(target),
                ..Default::default()
            },
        );
        let req = MatchContext::new(Protocol::Http, "shop", "dev")
            .with_method("POST")
            .with_path("/orders")
            .with_query("page", "2")
            .with_header("X-Tenant", "acme")
            .with_body("payload");

        let resp = executor().execute(&req, &r).await.unwrap();
        assert_eq!(resp.status_code, 207);
        assert_eq!(resp.header("x-upstream"), Some("yes"));
        let body: Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(body["path"], "/orders?page=2");
        assert_eq!(body["tenant"], "acme");
        assert_eq!(body["body"], "payload");
    }

    #[tokio::test]
    async fn test_proxy_failure_yields_502() {
        let r = rule(
            ResponseType::Proxy,
            ResponseContent {
                target: Some("http://127.0.0.1:1".to_string()),
                timeout_ms: Some(1_000),
                ..Default::default()
            },
        );
        let resp = executor().execute(&request(), &r).await.unwrap();
        assert_eq!(resp.status_code, 502);
        assert!(resp.body_str().contains("upstream_failure"));
    }
}
