//! # mindstream-engine
//!
//! Streaming agent turns and the multi-turn tool loop built on top of them.
//!
//! - **Agent**: memory + aggregator + model + parser + hooks. One call to
//!   `forward` is one model turn, streamed as events.
//! - **Orchestrator**: drives turns, classifies statuses, dispatches tool
//!   calls to executors and stops on the finish condition or the turn limit.
//! - **Plugins**: name-addressed actions behind the `plugin` tool type.
//!
//! Every piece comes in an async flavour and a blocking flavour with
//! identical event sequences.
//!
//! ## Crate Position
//!
//! Depends on: mindstream-core. Depended on by: the `mindstream` binary.

#![deny(unsafe_code)]

pub mod agent;
pub mod aggregator;
pub mod config;
pub mod error;
pub mod hooks;
pub mod memory;
pub mod orchestrator;
pub mod parser;
pub mod plugin;
pub mod registry;

pub use agent::{AgentBuilder, AgentCore, BlockingStreamingAgent, BlockingTurn, StreamingAgent};
pub use aggregator::DefaultAggregator;
pub use config::{EngineConfig, RetentionPolicy};
pub use error::EngineError;
pub use hooks::HookChain;
pub use memory::MemoryStore;
pub use orchestrator::{
    BlockingOrchestrator, BlockingRun, Decision, EventStream, Orchestrator, OrchestratorBuilder,
    TurnMachine,
};
pub use parser::ActionParser;
pub use plugin::{Plugin, PluginDefinition, PluginError, PluginExecutor};
pub use registry::{BlockingExecutors, ExecutorRegistry, Executors};
