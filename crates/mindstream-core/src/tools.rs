use async_trait::async_trait;

use crate::errors::ExecutorError;
use crate::event::Event;
use crate::ids::SessionId;

/// Performs the effect of a tool call and returns the result as an event.
#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, call: &Event, session_id: &SessionId) -> Result<Event, ExecutorError>;
}

/// Blocking counterpart of [`Executor`].
pub trait BlockingExecutor: Send + Sync {
    fn name(&self) -> &str;

    fn execute(&self, call: &Event, session_id: &SessionId) -> Result<Event, ExecutorError>;
}

/// Decides whether a session's goal has been reached, given a turn's final event.
pub trait FinishCondition: Send + Sync {
    fn is_finished(&self, event: &Event) -> bool;
}

impl<F> FinishCondition for F
where
    F: Fn(&Event) -> bool + Send + Sync,
{
    fn is_finished(&self, event: &Event) -> bool {
        self(event)
    }
}

/// Finished once the model answers without requesting a tool.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoToolCall;

impl FinishCondition for NoToolCall {
    fn is_finished(&self, event: &Event) -> bool {
        event.requested_tool().is_none()
    }
}
