//! Match + execute, shared by every protocol adapter.

use crate::engine::{MatchEngine, MatchError};
use crate::executor::{ExecutorError, ResponseExecutor};
use crate::metrics;
use crate::model::{MatchContext, MockResponse};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub struct MockService {
    engine: Arc<MatchEngine>,
    executor: Arc<ResponseExecutor>,
}

impl MockService {
    pub fn new(engine: Arc<MatchEngine>, executor: Arc<ResponseExecutor>) -> Self {
        Self { engine, executor }
    }

    pub fn engine(&self) -> &Arc<MatchEngine> {
        &self.engine
    }

    pub async fn handle(&self, request: &MatchContext) -> MockResponse {
        self.handle_cancellable(request, &CancellationToken::new())
            .await
            .unwrap_or_else(|_| self.cancelled_response())
    }

    /// Produce the response for `request`.
    ///
    /// Returns `Err(ExecutorError::Cancelled)` only when `cancel` fired; every
    /// other failure is folded into a response.
    pub async fn handle_cancellable(
        &self,
        request: &MatchContext,
        cancel: &CancellationToken,
    ) -> Result<MockResponse, ExecutorError> {
        let rule = match self.engine.find_match(request).await {
            Ok(rule) => rule,
            Err(MatchError::Repository(e)) => {
                error!(
                    "Rule lookup failed for {}/{} (request {}): {}",
                    request.project_id, request.environment_id, request.request_id, e
                );
                metrics::record_response("error", 500);
                return Ok(MockResponse::json(
                    500,
                    &json!({
                        "error": "rule_lookup_failed",
                        "message": e.to_string(),
                    }),
                ));
            }
        };

        let Some(rule) = rule else {
            debug!(
                "No rule matched {} {} in {}/{}",
                request.method, request.path, request.project_id, request.environment_id
            );
            let response = self.executor.default_response();
            metrics::record_response("default", response.status_code);
            return Ok(response);
        };

        match self.executor.execute_cancellable(request, &rule, cancel).await {
            Ok(response) => Ok(response),
            Err(ExecutorError::Cancelled) => Err(ExecutorError::Cancelled),
            Err(e) => {
                warn!("Rule {} has an unusable response: {}", rule.id, e);
                metrics::record_response("degraded", 500);
                let mut response = MockResponse::json(
                    500,
                    &json!({
                        "error": "invalid_rule_response",
                        "message": e.to_string(),
                        "rule_id": rule.id,
                    }),
                );
                response.rule_id = Some(rule.id);
                Ok(response)
            }
        }
    }

    fn cancelled_response(&self) -> MockResponse {
        MockResponse::json(499, &json!({"error": "request_cancelled"}))
    }
}
