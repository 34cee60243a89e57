use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, instrument, warn};

use mindstream_core::errors::ExecutorError;
use mindstream_core::event::{Event, StructuredFields};
use mindstream_core::ids::SessionId;
use mindstream_core::tools::{BlockingExecutor, Executor};

use crate::error::panic_message;

const DEFAULT_PLUGIN_TIMEOUT: Duration = Duration::from_secs(120);

/// A named action the model can invoke through the plugin executor.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;

    async fn call(&self, args: Value) -> Result<Value, PluginError>;

    fn to_definition(&self) -> PluginDefinition {
        PluginDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

/// Plugin description for prompt building.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PluginDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Executor for `plugin` tool calls. Reads `action = {"name", "parameters"}`
/// from the call event and runs the named plugin.
///
/// Every plugin-level failure (unknown name, bad action, plugin error,
/// timeout, panic) comes back as a result event whose content starts with
/// `[error]`, so the model sees it and can recover.
pub struct PluginExecutor {
    plugins: HashMap<String, Arc<dyn Plugin>>,
    timeout: Duration,
}

impl PluginExecutor {
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
            timeout: DEFAULT_PLUGIN_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.register(plugin);
        self
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.insert(plugin.name().to_string(), plugin);
    }

    pub fn definitions(&self) -> Vec<PluginDefinition> {
        let mut defs: Vec<PluginDefinition> =
            self.plugins.values().map(|p| p.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    #[instrument(skip(self, call, session_id), fields(session_id = %session_id))]
    async fn dispatch(&self, call: &Event, session_id: &SessionId) -> Event {
        let (name, params) = match parse_action(call) {
            Ok(parsed) => parsed,
            Err(msg) => return error_result("plugin", &msg, session_id),
        };
        let Some(plugin) = self.plugins.get(&name).map(Arc::clone) else {
            return error_result(&name, &format!("unknown plugin: {name}"), session_id);
        };

        let start = Instant::now();
        let outcome = tokio::time::timeout(
            self.timeout,
            std::panic::AssertUnwindSafe(plugin.call(params)).catch_unwind(),
        )
        .await;

        match outcome {
            Ok(Ok(Ok(value))) => {
                debug!(
                    plugin = %name,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "plugin returned"
                );
                let content = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                Event::new(name.clone(), content, session_id.clone())
                    .with_fields(result_fields(&name, false))
            }
            Ok(Ok(Err(e))) => error_result(&name, &e.to_string(), session_id),
            Ok(Err(panic)) => {
                error!(plugin = %name, panic = %panic_message(&panic), "plugin panicked");
                error_result(&name, "plugin crashed", session_id)
            }
            Err(_) => {
                warn!(
                    plugin = %name,
                    timeout_secs = self.timeout.as_secs(),
                    "plugin timed out"
                );
                error_result(
                    &name,
                    &format!("plugin timed out after {}s", self.timeout.as_secs()),
                    session_id,
                )
            }
        }
    }
}

impl Default for PluginExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for PluginExecutor {
    fn name(&self) -> &str {
        "plugin"
    }

    async fn execute(&self, call: &Event, session_id: &SessionId) -> Result<Event, ExecutorError> {
        Ok(self.dispatch(call, session_id).await)
    }
}

/// Drives the async plugins on a private current-thread runtime. Must not be
/// called from inside an async task.
impl BlockingExecutor for PluginExecutor {
    fn name(&self) -> &str {
        "plugin"
    }

    fn execute(&self, call: &Event, session_id: &SessionId) -> Result<Event, ExecutorError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ExecutorError::ExecutionFailed(format!("plugin runtime: {e}")))?;
        Ok(runtime.block_on(self.dispatch(call, session_id)))
    }
}

fn parse_action(call: &Event) -> Result<(String, Value), String> {
    let action = call
        .field("action")
        .ok_or_else(|| "tool call has no action".to_string())?;
    let action = match action {
        Value::String(raw) => serde_json::from_str::<Value>(raw)
            .map_err(|e| format!("action is not valid JSON: {e}"))?,
        other => other.clone(),
    };
    let name = action
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| "action has no plugin name".to_string())?
        .to_string();
    let params = action
        .get("parameters")
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));
    Ok((name, params))
}

fn result_fields(plugin: &str, is_error: bool) -> StructuredFields {
    StructuredFields::new()
        .with("plugin", plugin)
        .with("is_error", is_error)
}

fn error_result(plugin: &str, msg: &str, session_id: &SessionId) -> Event {
    Event::new(plugin, format!("[error] {msg}"), session_id.clone())
        .with_fields(result_fields(plugin, true))
}
