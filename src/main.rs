//! mindstream demo: runs one tool-using session and prints every event as a
//! JSON line on stdout. Logs go to stderr.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{info, warn};

use mindstream_core::event::{Event, ToolType};
use mindstream_core::ids::SessionId;
use mindstream_core::model::{BlockingModelClient, ModelClient};
use mindstream_engine::{
    ActionParser, AgentBuilder, BlockingOrchestrator, EngineConfig, Orchestrator, Plugin,
    PluginError, PluginExecutor,
};
use mindstream_llm::{OpenAiClient, OpenAiConfig, ScriptedModel, ScriptedResponse};
use mindstream_telemetry::{init_telemetry, LogFormat, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(
    name = "mindstream",
    version,
    about = "Run one streaming agent session and print its events as JSON lines"
)]
struct Args {
    /// User message that starts the session
    #[arg(long, default_value = "What time is it?")]
    prompt: String,

    /// Overrides `max_turns` from the config file
    #[arg(long)]
    max_turns: Option<u32>,

    /// Use the blocking orchestrator instead of the async one
    #[arg(long)]
    blocking: bool,

    /// Engine config (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log format on stderr (json, pretty, compact)
    #[arg(long, default_value = "compact")]
    log_format: LogFormat,

    #[arg(long, value_enum, default_value_t = ModelChoice::Scripted)]
    model: ModelChoice,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ModelChoice {
    /// Offline script that calls the clock plugin once, then answers
    Scripted,
    /// OpenAI-compatible endpoint configured through OPENAI_* env vars
    Openai,
}

/// Reports the current wall-clock time.
struct Clock;

#[async_trait]
impl Plugin for Clock {
    fn name(&self) -> &str {
        "clock"
    }

    fn description(&self) -> &str {
        "Returns the current time as seconds since the Unix epoch."
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn call(&self, _args: Value) -> Result<Value, PluginError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| PluginError::ExecutionFailed(e.to_string()))?;
        Ok(json!({ "unix_seconds": now.as_secs() }))
    }
}

fn demo_script() -> Vec<ScriptedResponse> {
    vec![
        ScriptedResponse::text(
            r#"I should look at the clock first. <|action_start|><|plugin|>{"name": "clock", "parameters": {}}<|action_end|>"#,
        ),
        ScriptedResponse::text("The clock plugin reported the current Unix time above."),
    ]
}

fn plugins(config: &EngineConfig) -> Arc<PluginExecutor> {
    Arc::new(
        PluginExecutor::new()
            .with_timeout(config.plugin_timeout())
            .with_plugin(Arc::new(Clock)),
    )
}

fn emit(event: &Event) -> anyhow::Result<()> {
    let line = serde_json::to_string(event).context("failed to serialize event")?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}")?;
    stdout.flush()?;
    Ok(())
}

async fn run_async(args: &Args, config: EngineConfig, message: Event, session_id: SessionId) -> anyhow::Result<()> {
    let model: Arc<dyn ModelClient> = match args.model {
        ModelChoice::Scripted => Arc::new(ScriptedModel::new(demo_script())),
        ModelChoice::Openai => Arc::new(OpenAiClient::new(OpenAiConfig::from_env()?)?),
    };
    let plugins = plugins(&config);
    let agent = AgentBuilder::from_config(config.clone())
        .parser(Arc::new(
            ActionParser::new(&[ToolType::Plugin]).with_plugins(&plugins.definitions()),
        ))
        .build(model)?;
    let orchestrator = Orchestrator::builder(agent)
        .config(&config)
        .executor(ToolType::Plugin, plugins)
        .build()?;

    let mut events = orchestrator.run(message, session_id);
    let mut count = 0usize;
    while let Some(item) = events.next().await {
        emit(&item?)?;
        count += 1;
    }
    info!(events = count, "session complete");
    Ok(())
}

fn run_blocking(args: &Args, config: EngineConfig, message: Event, session_id: SessionId) -> anyhow::Result<()> {
    let model: Arc<dyn BlockingModelClient> = match args.model {
        ModelChoice::Scripted => Arc::new(ScriptedModel::new(demo_script())),
        ModelChoice::Openai => bail!("the openai client has no blocking mode; drop --blocking"),
    };
    let plugins = plugins(&config);
    let agent = AgentBuilder::from_config(config.clone())
        .parser(Arc::new(
            ActionParser::new(&[ToolType::Plugin]).with_plugins(&plugins.definitions()),
        ))
        .build_blocking(model)?;
    let orchestrator = BlockingOrchestrator::builder(agent)
        .config(&config)
        .executor(ToolType::Plugin, plugins)
        .build()?;

    let mut count = 0usize;
    for item in orchestrator.run(message, session_id) {
        emit(&item?)?;
        count += 1;
    }
    info!(events = count, "session complete");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _telemetry = init_telemetry(&TelemetryConfig {
        format: args.log_format,
        ..TelemetryConfig::default()
    })?;

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_path(path)?,
        None => EngineConfig::default(),
    };
    if let Some(max_turns) = args.max_turns {
        config.max_turns = max_turns;
    }
    config.validate()?;

    let session_id = SessionId::new();
    let message = Event::user(args.prompt.clone(), session_id.clone());
    info!(
        session_id = %session_id,
        model = ?args.model,
        blocking = args.blocking,
        max_turns = config.max_turns,
        "starting session"
    );

    let result = if args.blocking {
        // The blocking plugin executor drives its own runtime, so no tokio
        // runtime may be active on this thread.
        run_blocking(&args, config, message, session_id)
    } else {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to start tokio runtime")?;
        runtime.block_on(run_async(&args, config, message, session_id))
    };

    if let Err(e) = &result {
        warn!(error = %e, "session failed");
    }
    result
}
