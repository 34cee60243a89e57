use mindstream_core::errors::{ExecutorError, ModelError};
use mindstream_core::event::{ToolType, UnknownToolType};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("{tool_type} executor failed: {source}")]
    Executor {
        tool_type: ToolType,
        source: ExecutorError,
    },

    #[error("unknown tool type: {0}")]
    UnknownToolType(String),

    #[error("no executor registered for tool_type {0}")]
    MissingExecutor(ToolType),

    #[error("run cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Configuration errors cannot be fixed by retrying the same run.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnknownToolType(_) | Self::MissingExecutor(_) | Self::Config(_)
        )
    }
}

impl From<UnknownToolType> for EngineError {
    fn from(e: UnknownToolType) -> Self {
        Self::UnknownToolType(e.0)
    }
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_executor_message() {
        let err = EngineError::MissingExecutor(ToolType::Plugin);
        assert_eq!(err.to_string(), "no executor registered for tool_type plugin");
        assert!(err.is_configuration());
    }

    #[test]
    fn executor_error_keeps_source() {
        let err = EngineError::Executor {
            tool_type: ToolType::Interpreter,
            source: ExecutorError::ExecutionFailed("segfault".into()),
        };
        assert_eq!(
            err.to_string(),
            "interpreter executor failed: execution failed: segfault"
        );
        assert!(std::error::Error::source(&err).is_some());
        assert!(!err.is_configuration());
    }

    #[test]
    fn unknown_tool_type_converts() {
        let err: EngineError = "browser".parse::<ToolType>().unwrap_err().into();
        assert!(matches!(err, EngineError::UnknownToolType(ref t) if t == "browser"));
    }

    #[test]
    fn model_error_converts() {
        let err: EngineError = ModelError::ProviderOverloaded.into();
        assert!(matches!(err, EngineError::Model(ModelError::ProviderOverloaded)));
    }

    #[test]
    fn panic_message_extracts_payload() {
        let p: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&p), "boom");
        let p: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&p), "bang");
        let p: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(&p), "unknown panic");
    }
}
