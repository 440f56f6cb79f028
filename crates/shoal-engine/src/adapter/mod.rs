//! Protocol adapters translate transport requests into [`MatchContext`] and
//! write [`MockResponse`] back to the transport.

mod http;
mod server;

pub use http::{HttpAdapter, HEALTH_PATH, METRICS_PATH};
pub use server::HttpServer;

use crate::model::{MatchContext, MockResponse, Protocol};
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// The request does not address a project/environment namespace.
    #[error("invalid request target '{0}': expected /<project>/<environment>/<path>")]
    InvalidTarget(String),

    #[error("failed to read request body: {0}")]
    Body(String),
}

#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    type Request: Send;
    type Response;

    fn protocol(&self) -> Protocol;

    async fn parse(&self, request: Self::Request) -> Result<MatchContext, AdapterError>;

    fn write_response(&self, response: MockResponse) -> Self::Response;
}
