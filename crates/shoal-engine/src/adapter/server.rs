//! HTTP accept loop serving the mock service.

use super::http::{HttpAdapter, HEALTH_PATH, METRICS_PATH, RESERVED_PREFIX};
use super::{AdapterError, ProtocolAdapter};
use crate::metrics::collect_metrics;
use crate::model::MockResponse;
use crate::service::MockService;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Status written when the request was abandoned before a response existed.
const CLIENT_CLOSED_REQUEST: u16 = 499;

pub struct HttpServer {
    service: Arc<MockService>,
    adapter: HttpAdapter,
}

impl HttpServer {
    pub fn new(service: Arc<MockService>) -> Self {
        Self {
            service,
            adapter: HttpAdapter::new(),
        }
    }

    /// Accept connections until `shutdown` fires. Open connections are asked
    /// to finish their in-flight request and close.
    pub async fn run(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), anyhow::Error> {
        info!("Listening on http://{}", listener.local_addr()?);
        let server = Arc::new(self);

        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, no longer accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let server = Arc::clone(&server);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                server.serve_connection(stream, remote_addr, shutdown).await;
            });
        }
    }

    async fn serve_connection(
        self: Arc<Self>,
        stream: tokio::net::TcpStream,
        remote_addr: SocketAddr,
        shutdown: CancellationToken,
    ) {
        let io = TokioIo::new(stream);
        let server = Arc::clone(&self);
        let service = service_fn(move |req| {
            let server = Arc::clone(&server);
            async move { server.handle_request(req).await }
        });

        let conn = http1::Builder::new().serve_connection(io, service);
        tokio::pin!(conn);
        let mut draining = false;
        loop {
            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(err) = result {
                        error!("Error serving HTTP connection from {}: {}", remote_addr, err);
                    }
                    break;
                }
                _ = shutdown.cancelled(), if !draining => {
                    draining = true;
                    conn.as_mut().graceful_shutdown();
                }
            }
        }
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let path = req.uri().path();
        if path.starts_with(RESERVED_PREFIX) {
            return Ok(self.handle_reserved(req.method(), path).await);
        }

        let ctx = match self.adapter.parse(req).await {
            Ok(ctx) => ctx,
            Err(e @ AdapterError::InvalidTarget(_)) => {
                return Ok(self.adapter.error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_target",
                    &e.to_string(),
                ));
            }
            Err(e @ AdapterError::Body(_)) => {
                return Ok(self.adapter.error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_body",
                    &e.to_string(),
                ));
            }
        };

        // Fires if hyper drops this future, i.e. the client went away.
        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();
        let response = match self.service.handle_cancellable(&ctx, &cancel).await {
            Ok(response) => response,
            Err(e) => {
                debug!(request_id = %ctx.request_id, "request abandoned: {}", e);
                MockResponse::new(CLIENT_CLOSED_REQUEST, Bytes::new())
            }
        };
        guard.disarm();

        debug!(
            request_id = %ctx.request_id,
            status = response.status_code,
            rule_id = response.rule_id.as_deref().unwrap_or("-"),
            "{} {}/{}{}",
            ctx.method,
            ctx.project_id,
            ctx.environment_id,
            ctx.path
        );
        Ok(self.adapter.write_response(response))
    }

    async fn handle_reserved(&self, method: &Method, path: &str) -> Response<Full<Bytes>> {
        if method != Method::GET {
            return self.adapter.error_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "method_not_allowed",
                "reserved endpoints only accept GET",
            );
        }
        match path {
            HEALTH_PATH => {
                let stats = self.service.engine().cache().stats().await;
                let body = json!({
                    "status": "ok",
                    "hit_rate": stats.hit_rate(),
                    "cache": stats,
                });
                self.adapter.write_response(MockResponse::json(200, &body))
            }
            METRICS_PATH => {
                let mut response = MockResponse::new(200, collect_metrics());
                response.set_header("content-type", "text/plain; version=0.0.4");
                self.adapter.write_response(response)
            }
            _ => self.adapter.error_response(
                StatusCode::NOT_FOUND,
                "unknown_endpoint",
                &format!("no reserved endpoint at {path}"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheManager, CacheStrategy};
    use crate::engine::MatchEngine;
    use crate::executor::{ExecutorConfig, ResponseExecutor};
    use crate::repository::InMemoryRuleRepository;
    use crate::scripting::{SandboxConfig, ScriptSandbox};

    const RULES: &str = r#"
- id: hello
  project_id: shop
  environment_id: dev
  match:
    type: simple
    method: GET
    path: /hello/:name
  response:
    type: dynamic
    content:
      body:
        greeting: "hi ${request.pathParams.name}"
"#;

    async fn start() -> (SocketAddr, CancellationToken) {
        let rules: Vec<crate::model::Rule> = serde_yaml::from_str(RULES).unwrap();
        let repo = Arc::new(InMemoryRuleRepository::from_rules(rules).unwrap());
        let cache = Arc::new(CacheManager::new(CacheStrategy::default()));
        let sandbox = Arc::new(ScriptSandbox::new(SandboxConfig::default()));
        let engine = Arc::new(MatchEngine::new(cache, repo, sandbox.clone()));
        let executor = Arc::new(ResponseExecutor::new(ExecutorConfig::default(), sandbox));
        let service = Arc::new(MockService::new(engine, executor));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move { HttpServer::new(service).run(listener, token).await });
        (addr, shutdown)
    }

    #[tokio::test]
    async fn test_serves_matching_rule_and_default() {
        let (addr, shutdown) = start().await;
        let client = reqwest::Client::new();

        let resp = client
            .get(format!("http://{addr}/shop/dev/hello/ada"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()["x-shoal-rule-id"], "hello");
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["greeting"], "hi ada");

        let resp = client
            .get(format!("http://{addr}/shop/dev/nothing"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let resp = client
            .get(format!("http://{addr}/shop"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_reserved_endpoints() {
        let (addr, shutdown) = start().await;
        let client = reqwest::Client::new();

        client
            .get(format!("http://{addr}/shop/dev/hello/x"))
            .send()
            .await
            .unwrap();

        let health: serde_json::Value = client
            .get(format!("http://{addr}/_/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
        assert!(health["cache"]["l1_entries"].as_u64().unwrap() >= 1);
        assert!(health.get("hit_rate").is_some());

        let metrics = client
            .get(format!("http://{addr}/_/metrics"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(metrics.contains("shoal_match_total"));

        let resp = client
            .get(format!("http://{addr}/_/other"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        shutdown.cancel();
    }
}
