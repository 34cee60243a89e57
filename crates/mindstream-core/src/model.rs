use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::errors::ModelError;
use crate::ids::SessionId;
use crate::status::ModelStatus;

/// One increment of a model response. `text` is cumulative: the full text
/// generated so far for this call, not a delta.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelChunk {
    pub status: ModelStatus,
    pub text: String,
}

impl ModelChunk {
    pub fn streaming(text: impl Into<String>) -> Self {
        Self {
            status: ModelStatus::Streaming,
            text: text.into(),
        }
    }

    pub fn end(text: impl Into<String>) -> Self {
        Self {
            status: ModelStatus::End,
            text: text.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Tool output fed back to the model.
    Environment,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Producer name for environment messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Model-ready input produced by an aggregator.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedInput {
    pub messages: Vec<ChatMessage>,
}

impl FormattedInput {
    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelChunk, ModelError>> + Send>>;
pub type BlockingModelStream = Box<dyn Iterator<Item = Result<ModelChunk, ModelError>> + Send>;

/// Streaming language model client. The last chunk of a successful response
/// has `ModelStatus::End`.
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn name(&self) -> &str;

    async fn stream(
        &self,
        input: &FormattedInput,
        session_id: &SessionId,
    ) -> Result<ModelStream, ModelError>;
}

/// Blocking counterpart of [`ModelClient`]; the returned iterator blocks the
/// calling thread on each `next()`.
pub trait BlockingModelClient: Send + Sync {
    fn name(&self) -> &str;

    fn stream(
        &self,
        input: &FormattedInput,
        session_id: &SessionId,
    ) -> Result<BlockingModelStream, ModelError>;
}
