use serde::Deserialize;

use mindstream_core::errors::ModelError;
use mindstream_core::model::ModelChunk;

/// State machine turning chat-completion SSE payloads into cumulative chunks.
#[derive(Default)]
pub struct ChatDeltaParser {
    text: String,
    done: bool,
}

impl ChatDeltaParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once an end chunk (or an error) has been produced.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Parse one `data:` payload and return zero or more chunks.
    pub fn parse_data(&mut self, data: &str) -> Vec<Result<ModelChunk, ModelError>> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }

        if data.trim() == "[DONE]" {
            self.done = true;
            out.push(Ok(ModelChunk::end(self.text.clone())));
            return out;
        }

        let payload: CompletionChunk = match serde_json::from_str(data) {
            Ok(p) => p,
            Err(e) => {
                self.done = true;
                out.push(Err(ModelError::StreamInterrupted(format!(
                    "malformed stream payload: {e}"
                ))));
                return out;
            }
        };

        if let Some(err) = payload.error {
            self.done = true;
            out.push(Err(classify_error(&err)));
            return out;
        }

        for choice in payload.choices.into_iter().filter(|c| c.index == 0) {
            if let Some(delta) = choice.delta.content.filter(|d| !d.is_empty()) {
                self.text.push_str(&delta);
                out.push(Ok(ModelChunk::streaming(self.text.clone())));
            }
            if choice.finish_reason.is_some() {
                self.done = true;
                out.push(Ok(ModelChunk::end(self.text.clone())));
                break;
            }
        }

        out
    }

    /// Called when the byte stream closes. Closing before a terminator is an error.
    pub fn finish(&mut self) -> Option<Result<ModelChunk, ModelError>> {
        if self.done {
            return None;
        }
        self.done = true;
        Some(Err(ModelError::StreamInterrupted(
            "stream closed before completion".into(),
        )))
    }
}

/// `code` is checked before `type`: providers send e.g.
/// `type: invalid_request_error` with `code: context_length_exceeded`.
fn classify_error(err: &ErrorPayload) -> ModelError {
    [err.code.as_deref(), err.error_type.as_deref()]
        .into_iter()
        .flatten()
        .find_map(|kind| classify_kind(kind, &err.message))
        .unwrap_or_else(|| ModelError::ServerError {
            status: 500,
            body: err.message.clone(),
        })
}

fn classify_kind(kind: &str, message: &str) -> Option<ModelError> {
    let err = match kind {
        "rate_limit_exceeded" | "rate_limit_error" => ModelError::RateLimited(message.to_string()),
        "invalid_api_key" | "authentication_error" => {
            ModelError::AuthenticationFailed(message.to_string())
        }
        "context_length_exceeded" => ModelError::ContextLengthExceeded(message.to_string()),
        "invalid_request_error" => ModelError::InvalidRequest(message.to_string()),
        "server_error" | "overloaded_error" => ModelError::ProviderOverloaded,
        _ => return None,
    };
    Some(err)
}

/// Parse raw SSE text into `data` payloads. Multi-line data fields are joined
/// with newlines; comment lines (leading `:`) are skipped.
pub fn parse_sse_data(raw: &str) -> Vec<String> {
    let mut payloads = Vec::new();
    let mut current: Option<String> = None;

    for line in raw.lines() {
        if line.is_empty() {
            if let Some(data) = current.take() {
                payloads.push(data);
            }
            continue;
        }
        if line.starts_with(':') {
            continue;
        }
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.strip_prefix(' ').unwrap_or(data);
            match current.as_mut() {
                Some(buf) => {
                    buf.push('\n');
                    buf.push_str(data);
                }
                None => current = Some(data.to_string()),
            }
        }
    }

    // Handle trailing event without blank line
    if let Some(data) = current {
        payloads.push(data);
    }

    payloads
}

// --- Deserialization types for chat-completion stream payloads ---

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<Choice>,
    error: Option<ErrorPayload>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    delta: Delta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct Delta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorPayload {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
    code: Option<String>,
}
