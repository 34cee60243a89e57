use std::time::Duration;

/// Failure of a model stream client, either before the stream opens or
/// while it is being read. The orchestrator surfaces these unchanged.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ModelError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    /// The provider rejected the prompt as too long. Carries its message.
    #[error("context length exceeded: {0}")]
    ContextLengthExceeded(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("provider overloaded")]
    ProviderOverloaded,
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    /// No data arrived on an open stream for this long.
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl ModelError {
    /// Map a non-success HTTP status to an error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 | 404 | 422 => Self::InvalidRequest(body),
            429 => Self::RateLimited(body),
            503 | 529 => Self::ProviderOverloaded,
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

/// Failure raised by a tool executor.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("invalid tool call: {0}")]
    InvalidCall(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_status_mapping() {
        assert!(matches!(
            ModelError::from_status(401, "unauthorized".into()),
            ModelError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            ModelError::from_status(404, "no such model".into()),
            ModelError::InvalidRequest(_)
        ));
        assert!(matches!(
            ModelError::from_status(429, "slow down".into()),
            ModelError::RateLimited(body) if body == "slow down"
        ));
        assert!(matches!(
            ModelError::from_status(503, "busy".into()),
            ModelError::ProviderOverloaded
        ));
        assert!(matches!(
            ModelError::from_status(502, "bad gateway".into()),
            ModelError::ServerError { status: 502, .. }
        ));
        assert!(matches!(
            ModelError::from_status(302, "moved".into()),
            ModelError::InvalidRequest(msg) if msg.contains("302")
        ));
    }

    #[test]
    fn context_length_keeps_provider_message() {
        let err = ModelError::ContextLengthExceeded("maximum context length is 8192 tokens".into());
        assert_eq!(
            err.to_string(),
            "context length exceeded: maximum context length is 8192 tokens"
        );
    }

    #[test]
    fn executor_error_display() {
        let err = ExecutorError::InvalidCall("missing action".into());
        assert_eq!(err.to_string(), "invalid tool call: missing action");
        assert!(ExecutorError::Timeout(Duration::from_secs(5)).to_string().contains('5'));
    }
}
