//! Sandboxed Rhai evaluation for script predicates and script responses.
//!
//! Scripts see a read-only `request` map (method, path, headers, query,
//! pathParams, body, project, environment) and an `env` map with the
//! variables configured for the request's environment. They cannot load
//! modules, perform I/O or run past the operation and wall-clock budgets.

mod sandbox;

pub use sandbox::{dynamic_to_json, json_to_dynamic, ScriptResponse, ScriptSandbox};

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ScriptError {
    #[error("script compilation failed: {0}")]
    Compile(String),

    #[error("script execution failed: {0}")]
    Runtime(String),

    #[error("script exceeded its time budget of {0:?}")]
    Timeout(Duration),

    #[error("script exceeded its operation budget")]
    OperationLimit,

    #[error("script returned {0}, expected {1}")]
    InvalidReturn(String, &'static str),
}

impl ScriptError {
    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ScriptError::Compile(_) => "compile",
            ScriptError::Runtime(_) => "runtime",
            ScriptError::Timeout(_) => "timeout",
            ScriptError::OperationLimit => "operations",
            ScriptError::InvalidReturn(..) => "return_type",
        }
    }
}

/// Resource limits applied to every evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub max_operations: u64,
    pub timeout_ms: u64,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
    pub max_call_levels: usize,
    pub max_expr_depth: usize,
    /// Compiled scripts kept in memory
    pub ast_cache_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_operations: 100_000,
            timeout_ms: 250,
            max_string_size: 1024 * 1024,
            max_array_size: 10_000,
            max_map_size: 10_000,
            max_call_levels: 32,
            max_expr_depth: 64,
            ast_cache_size: 512,
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
