pub mod openai;
pub mod sse;

pub mod mock;

pub use mock::{ScriptedModel, ScriptedResponse};
pub use openai::{OpenAiClient, OpenAiConfig};
