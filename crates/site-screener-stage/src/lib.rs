#![forbid(unsafe_code)]

//! The stage boundary: the `Stage` trait, the context slice a stage sees,
//! built-in adapters and the registry that binds stage definitions.

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use site_screener_domain::{hash_json, value_at_path, DateTimeUtc, RunId};
use site_screener_phase::StageDefinition;

pub trait Stage: Send + Sync {
    /// Produce this stage's payload. A returned error is recorded on the
    /// run, never propagated past the runner.
    #[allow(clippy::missing_errors_doc)]
    fn run(&self, context: &StageContext) -> Result<Value>;
}

/// Everything a stage may observe: its projected input, the payloads of the
/// earlier stages it declared, the phase's named assumptions and its
/// adapter parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct StageContext {
    pub run_id: RunId,
    pub phase_tag: String,
    pub stage_id: String,
    pub as_of: DateTimeUtc,
    pub input: Value,
    pub upstream: BTreeMap<String, Value>,
    pub assumptions: BTreeMap<String, f64>,
    pub params: Value,
    pub input_hash: String,
    pub attempt: u32,
}

impl StageContext {
    #[must_use]
    pub fn upstream(&self, stage_id: &str) -> Option<&Value> {
        self.upstream.get(stage_id).filter(|value| !value.is_null())
    }

    #[must_use]
    pub fn upstream_or(&self, stage_id: &str, default: Value) -> Value {
        self.upstream(stage_id).cloned().unwrap_or(default)
    }

    /// Field of an upstream payload, falling back to `default` when the
    /// stage, the field or a value of the right shape is missing.
    #[must_use]
    pub fn upstream_field_or<T: DeserializeOwned>(
        &self,
        stage_id: &str,
        path: &[&str],
        default: T,
    ) -> T {
        self.upstream(stage_id)
            .and_then(|payload| value_at_path(payload, path))
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or(default)
    }

    #[must_use]
    pub fn input_field_or<T: DeserializeOwned>(&self, path: &[&str], default: T) -> T {
        value_at_path(&self.input, path)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or(default)
    }

    #[must_use]
    pub fn assumption_or(&self, name: &str, default: f64) -> f64 {
        self.assumptions.get(name).copied().unwrap_or(default)
    }

    /// Wire form sent to remote workers.
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "run_id": self.run_id.to_string(),
            "phase_tag": self.phase_tag,
            "stage_id": self.stage_id,
            "as_of": site_screener_domain::format_rfc3339(self.as_of).ok(),
            "input": self.input,
            "upstream": self.upstream,
            "assumptions": self.assumptions,
            "params": self.params,
            "input_hash": self.input_hash,
            "attempt": self.attempt,
        })
    }
}

/// Project the phase input to the declared keys; `"*"` keeps everything.
/// Non-object inputs are passed through unchanged when every key is
/// selected and dropped otherwise.
#[must_use]
pub fn project_input(input: &Value, definition: &StageDefinition) -> Value {
    if definition.reads_all_input() {
        return input.clone();
    }
    let Some(object) = input.as_object() else {
        return Value::Object(Map::new());
    };
    let projected: Map<String, Value> = definition
        .input_keys
        .iter()
        .filter_map(|key| object.get(key).map(|value| (key.clone(), value.clone())))
        .collect();
    Value::Object(projected)
}

/// Idempotency key of a stage invocation. Retries of the same stage with the
/// same slice share the key. The run id is not part of the key, so identical
/// input across runs hashes the same.
///
/// # Errors
/// Returns an error when the slice cannot be hashed.
pub fn stage_input_hash(
    phase_tag: &str,
    stage_id: &str,
    input: &Value,
    upstream: &BTreeMap<String, Value>,
    assumptions: &BTreeMap<String, f64>,
    params: &Value,
) -> Result<String> {
    hash_json(&json!({
        "phase_tag": phase_tag,
        "stage_id": stage_id,
        "input": input,
        "upstream": upstream,
        "assumptions": assumptions,
        "params": params,
    }))
}

/// Wraps a closure as a stage.
pub struct FnStage<F>(pub F);

impl<F> FnStage<F>
where
    F: Fn(&StageContext) -> Result<Value> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Stage for FnStage<F>
where
    F: Fn(&StageContext) -> Result<Value> + Send + Sync,
{
    fn run(&self, context: &StageContext) -> Result<Value> {
        (self.0)(context)
    }
}

impl<F> Debug for FnStage<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnStage")
    }
}

/// Returns a configured payload, or fails with a configured message.
/// Used for fixtures and dry runs.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticStage {
    payload: Value,
    error: Option<String>,
}

impl StaticStage {
    #[must_use]
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            error: None,
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            payload: Value::Null,
            error: Some(message.into()),
        }
    }

    /// `params.payload` (default `null`) and optional `params.error`.
    ///
    /// # Errors
    /// Returns an error when `params.error` is not a string.
    pub fn from_params(params: &Value) -> Result<Self> {
        let payload = params.get("payload").cloned().unwrap_or(Value::Null);
        let error = match params.get("error") {
            None | Some(Value::Null) => None,
            Some(Value::String(message)) => Some(message.clone()),
            Some(_) => return Err(anyhow!("static adapter params.error must be a string")),
        };
        Ok(Self { payload, error })
    }
}

impl Stage for StaticStage {
    fn run(&self, _context: &StageContext) -> Result<Value> {
        match &self.error {
            Some(message) => Err(anyhow!("{message}")),
            None => Ok(self.payload.clone()),
        }
    }
}

/// Returns the stage's projected input. Pairs with `input_keys` to carry
/// intake fields into the record unchanged; an empty projection is `null`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EchoStage;

impl Stage for EchoStage {
    fn run(&self, context: &StageContext) -> Result<Value> {
        let empty = context.input.as_object().is_some_and(Map::is_empty);
        Ok(if empty {
            Value::Null
        } else {
            context.input.clone()
        })
    }
}

/// POSTs the stage context to a worker and returns the response body.
#[derive(Debug, Clone)]
pub struct HttpJsonStage {
    url: String,
    timeout_ms: u64,
    headers: BTreeMap<String, String>,
    auth_bearer_token: Option<String>,
}

impl HttpJsonStage {
    /// # Errors
    /// Returns an error when `params.url` is missing, the method is not
    /// POST, headers are malformed or the bearer env var is unset.
    pub fn from_params(params: &Value) -> Result<Self> {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("http_json adapter requires params.url"))?
            .to_string();

        let method = params
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("POST")
            .to_ascii_uppercase();
        if method != "POST" {
            return Err(anyhow!("http_json adapter only supports POST, got '{method}'"));
        }

        let timeout_ms = params
            .get("timeout_ms")
            .and_then(Value::as_u64)
            .unwrap_or(30_000);

        let mut headers = BTreeMap::new();
        if let Some(raw_headers) = params.get("headers") {
            let obj = raw_headers
                .as_object()
                .ok_or_else(|| anyhow!("params.headers must be an object"))?;
            for (key, value) in obj {
                let str_value = value
                    .as_str()
                    .ok_or_else(|| anyhow!("params.headers values must be strings, key='{key}'"))?;
                headers.insert(key.clone(), str_value.to_string());
            }
        }

        let auth_bearer_token =
            if let Some(env_name) = params.get("auth_bearer_env").and_then(Value::as_str) {
                Some(std::env::var(env_name).map_err(|_| {
                    anyhow!("missing env var '{env_name}' required by params.auth_bearer_env")
                })?)
            } else {
                None
            };

        Ok(Self {
            url,
            timeout_ms,
            headers,
            auth_bearer_token,
        })
    }
}

impl Stage for HttpJsonStage {
    fn run(&self, context: &StageContext) -> Result<Value> {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.timeout_ms))
            .build();

        let mut req = agent
            .request("POST", &self.url)
            .set("content-type", "application/json")
            .set("idempotency-key", &context.input_hash);
        for (header, value) in &self.headers {
            req = req.set(header, value);
        }
        if let Some(token) = &self.auth_bearer_token {
            req = req.set("authorization", &format!("Bearer {token}"));
        }

        match req.send_json(context.to_json()) {
            Ok(response) => Ok(response.into_json()?),
            Err(ureq::Error::Status(code, response)) => {
                let detail = response.into_string().unwrap_or_default();
                let detail = detail.trim();
                if detail.is_empty() {
                    Err(anyhow!("http status {code}"))
                } else {
                    Err(anyhow!("http status {code}: {detail}"))
                }
            }
            Err(ureq::Error::Transport(err)) => Err(anyhow!("http transport failure: {err}")),
        }
    }
}

pub type AdapterFactory = Arc<dyn Fn(&Value) -> Result<Arc<dyn Stage>> + Send + Sync>;

/// Binds stage definitions to implementations: an explicit binding for the
/// stage id wins, otherwise the adapter kind's factory builds one from the
/// definition's params.
#[derive(Clone)]
pub struct StageRegistry {
    stages: BTreeMap<String, Arc<dyn Stage>>,
    adapters: BTreeMap<String, AdapterFactory>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::with_builtin_adapters()
    }
}

impl Debug for StageRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("stages", &self.stages.keys().collect::<Vec<_>>())
            .field("adapters", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StageRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            stages: BTreeMap::new(),
            adapters: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_builtin_adapters() -> Self {
        let mut registry = Self::empty();
        registry.register_adapter("static", Arc::new(build_static));
        registry.register_adapter("echo", Arc::new(build_echo));
        registry.register_adapter("http_json", Arc::new(build_http_json));
        registry
    }

    pub fn register(&mut self, stage_id: impl Into<String>, stage: Arc<dyn Stage>) {
        self.stages.insert(stage_id.into(), stage);
    }

    #[must_use]
    pub fn with_stage(mut self, stage_id: impl Into<String>, stage: Arc<dyn Stage>) -> Self {
        self.register(stage_id, stage);
        self
    }

    pub fn register_adapter(&mut self, kind: impl Into<String>, factory: AdapterFactory) {
        self.adapters.insert(kind.into(), factory);
    }

    /// # Errors
    /// Returns an error when nothing is bound for the stage or its adapter
    /// rejects the params.
    pub fn resolve(&self, definition: &StageDefinition) -> Result<Arc<dyn Stage>> {
        if let Some(stage) = self.stages.get(&definition.stage_id) {
            return Ok(Arc::clone(stage));
        }
        let factory = self.adapters.get(&definition.adapter.kind).ok_or_else(|| {
            anyhow!(
                "no stage bound for {} and unknown adapter kind {}",
                definition.stage_id,
                definition.adapter.kind
            )
        })?;
        factory(&definition.adapter.params).map_err(|err| {
            anyhow!(
                "adapter {} rejected params for stage {}: {err}",
                definition.adapter.kind,
                definition.stage_id
            )
        })
    }
}

fn build_static(params: &Value) -> Result<Arc<dyn Stage>> {
    Ok(Arc::new(StaticStage::from_params(params)?))
}

fn build_echo(_params: &Value) -> Result<Arc<dyn Stage>> {
    Ok(Arc::new(EchoStage))
}

fn build_http_json(params: &Value) -> Result<Arc<dyn Stage>> {
    Ok(Arc::new(HttpJsonStage::from_params(params)?))
}
