use super::{SandboxConfig, ScriptError};
use crate::model::MatchContext;
use parking_lot::Mutex;
use rhai::module_resolvers::DummyModuleResolver;
use rhai::packages::{Package, StandardPackage};
use rhai::{Dynamic, Engine, EvalAltResult, Map, Scope, AST};
use serde_json::Value;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

thread_local! {
    /// Wall-clock deadline of the evaluation running on this blocking thread
    static DEADLINE: Cell<Option<Instant>> = const { Cell::new(None) };
}

/// Installs a deadline for the current thread and restores the previous
/// one on drop, so nested evaluations stay correct.
struct DeadlineGuard(Option<Instant>);

impl DeadlineGuard {
    fn install(deadline: Instant) -> Self {
        Self(DEADLINE.with(|d| d.replace(Some(deadline))))
    }
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        DEADLINE.with(|d| d.set(self.0));
    }
}

/// Result of a script response.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptResponse {
    pub status_code: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

/// Rhai engine plus AST cache.
///
/// Evaluations run on tokio's blocking pool: a script spinning until its
/// wall-clock budget runs out never occupies an async worker.
pub struct ScriptSandbox {
    engine: Arc<Engine>,
    config: SandboxConfig,
    asts: Mutex<HashMap<String, Arc<AST>>>,
}

impl ScriptSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            engine: Arc::new(Self::create_engine(&config)),
            config,
            asts: Mutex::new(HashMap::new()),
        }
    }

    fn create_engine(config: &SandboxConfig) -> Engine {
        let mut engine = Engine::new_raw();
        engine.register_global_module(StandardPackage::new().as_shared_module());
        engine.set_module_resolver(DummyModuleResolver::new());
        engine.disable_symbol("eval");

        engine.set_max_operations(config.max_operations);
        engine.set_max_call_levels(config.max_call_levels);
        engine.set_max_string_size(config.max_string_size);
        engine.set_max_array_size(config.max_array_size);
        engine.set_max_map_size(config.max_map_size);
        engine.set_max_expr_depths(config.max_expr_depth, config.max_expr_depth);

        engine.on_progress(|ops| {
            if ops % 128 != 0 {
                return None;
            }
            match DEADLINE.with(|d| d.get()) {
                Some(deadline) if Instant::now() >= deadline => Some(Dynamic::UNIT),
                _ => None,
            }
        });

        engine.register_fn("uuid", || uuid::Uuid::new_v4().to_string());
        engine.register_fn("now", || chrono::Utc::now().to_rfc3339());

        engine
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Compile `source`, reusing a cached AST when available.
    pub fn compile(&self, source: &str) -> Result<Arc<AST>, ScriptError> {
        if let Some(ast) = self.asts.lock().get(source) {
            return Ok(Arc::clone(ast));
        }

        let ast = Arc::new(
            self.engine
                .compile(source)
                .map_err(|e| ScriptError::Compile(e.to_string()))?,
        );

        let mut asts = self.asts.lock();
        if asts.len() >= self.config.ast_cache_size {
            debug!("Script AST cache full ({} entries), clearing", asts.len());
            asts.clear();
        }
        asts.insert(source.to_string(), Arc::clone(&ast));
        Ok(ast)
    }

    /// Evaluate `source` against a request.
    pub async fn eval(
        &self,
        source: &str,
        request: &MatchContext,
        path_params: &HashMap<String, String>,
        env: &HashMap<String, String>,
    ) -> Result<Dynamic, ScriptError> {
        let ast = self.compile(source)?;
        let request = request_map(request, path_params);
        let env = string_map(env);
        let engine = Arc::clone(&self.engine);
        let timeout = self.config.timeout();

        tokio::task::spawn_blocking(move || {
            let mut scope = Scope::new();
            scope.push_constant("request", request);
            scope.push_constant("env", env);

            let _deadline = DeadlineGuard::install(Instant::now() + timeout);
            engine
                .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
                .map_err(|e| map_eval_error(e, timeout))
        })
        .await
        .map_err(|e| ScriptError::Runtime(format!("script task failed: {e}")))?
    }

    /// Evaluate a match script. Anything but a boolean is an error.
    pub async fn eval_predicate(
        &self,
        source: &str,
        request: &MatchContext,
    ) -> Result<bool, ScriptError> {
        let result = self
            .eval(source, request, &HashMap::new(), &HashMap::new())
            .await?;
        result
            .as_bool()
            .map_err(|type_name| ScriptError::InvalidReturn(type_name.to_string(), "bool"))
    }

    /// Evaluate a response script.
    ///
    /// A string becomes the body. A map with any of `status_code`, `headers`
    /// or `body` describes the whole response; any other value is the JSON
    /// body.
    pub async fn eval_response(
        &self,
        source: &str,
        request: &MatchContext,
        path_params: &HashMap<String, String>,
        env: &HashMap<String, String>,
    ) -> Result<ScriptResponse, ScriptError> {
        let result = self.eval(source, request, path_params, env).await?;
        if result.is_unit() {
            return Err(ScriptError::InvalidReturn("()".to_string(), "string or map"));
        }

        if let Some(map) = result.clone().try_cast::<Map>() {
            let is_descriptor = ["status_code", "headers", "body"]
                .iter()
                .any(|k| map.contains_key(*k));
            if is_descriptor {
                return parse_response_map(map);
            }
        }

        Ok(ScriptResponse {
            status_code: None,
            headers: Vec::new(),
            body: dynamic_to_json(result),
        })
    }
}

fn parse_response_map(map: Map) -> Result<ScriptResponse, ScriptError> {
    let status_code = match map.get("status_code") {
        Some(v) => {
            let code = v
                .as_int()
                .map_err(|t| ScriptError::InvalidReturn(t.to_string(), "integer status_code"))?;
            Some(u16::try_from(code).map_err(|_| {
                ScriptError::InvalidReturn(code.to_string(), "status_code within u16")
            })?)
        }
        None => None,
    };

    let mut headers = Vec::new();
    if let Some(value) = map.get("headers") {
        let header_map = value.clone().try_cast::<Map>().ok_or_else(|| {
            ScriptError::InvalidReturn(value.type_name().to_string(), "headers map")
        })?;
        for (name, value) in header_map {
            let value = match value.clone().try_cast::<String>() {
                Some(s) => s,
                None => format!("{value}"),
            };
            headers.push((name.to_string(), value));
        }
    }

    let body = map
        .get("body")
        .cloned()
        .map(dynamic_to_json)
        .unwrap_or(Value::Null);

    Ok(ScriptResponse {
        status_code,
        headers,
        body,
    })
}

fn map_eval_error(err: Box<EvalAltResult>, timeout: Duration) -> ScriptError {
    match *err {
        EvalAltResult::ErrorTerminated(..) => ScriptError::Timeout(timeout),
        EvalAltResult::ErrorTooManyOperations(..) => ScriptError::OperationLimit,
        other => ScriptError::Runtime(other.to_string()),
    }
}

fn string_map(values: &HashMap<String, String>) -> Map {
    values
        .iter()
        .map(|(k, v)| (k.as_str().into(), Dynamic::from(v.clone())))
        .collect()
}

fn request_map(request: &MatchContext, path_params: &HashMap<String, String>) -> Map {
    let body = if request.body.is_empty() {
        Dynamic::UNIT
    } else {
        match request.json_body() {
            Some(json) => json_to_dynamic(json),
            None => Dynamic::from(request.body_str().into_owned()),
        }
    };

    let mut map = Map::new();
    map.insert("method".into(), Dynamic::from(request.method.clone()));
    map.insert("path".into(), Dynamic::from(request.path.clone()));
    map.insert("headers".into(), Dynamic::from(string_map(&request.headers)));
    map.insert("query".into(), Dynamic::from(string_map(&request.query)));
    map.insert("pathParams".into(), Dynamic::from(string_map(path_params)));
    map.insert("body".into(), body);
    map.insert("project".into(), Dynamic::from(request.project_id.clone()));
    map.insert(
        "environment".into(),
        Dynamic::from(request.environment_id.clone()),
    );
    map
}

// Conversions between Rhai Dynamic and serde_json::Value

pub fn json_to_dynamic(value: Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::UNIT
            }
        }
        Value::String(s) => Dynamic::from(s),
        Value::Array(arr) => {
            Dynamic::from(arr.into_iter().map(json_to_dynamic).collect::<Vec<_>>())
        }
        Value::Object(obj) => Dynamic::from(
            obj.into_iter()
                .map(|(k, v)| (k.into(), json_to_dynamic(v)))
                .collect::<Map>(),
        ),
    }
}

pub fn dynamic_to_json(value: Dynamic) -> Value {
    if value.is_unit() {
        Value::Null
    } else if let Ok(b) = value.as_bool() {
        Value::Bool(b)
    } else if let Ok(i) = value.as_int() {
        Value::Number(i.into())
    } else if let Ok(f) = value.as_float() {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    } else if value.is_string() {
        Value::String(value.into_string().unwrap_or_default())
    } else if let Some(arr) = value.clone().try_cast::<rhai::Array>() {
        Value::Array(arr.into_iter().map(dynamic_to_json).collect())
    } else if let Some(map) = value.clone().try_cast::<Map>() {
        Value::Object(
            map.into_iter()
                .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
                .collect(),
        )
    } else {
        Value::String(value.to_string())
    }
}
