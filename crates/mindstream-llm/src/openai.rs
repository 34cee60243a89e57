use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Future, Stream};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use mindstream_core::errors::ModelError;
use mindstream_core::ids::SessionId;
use mindstream_core::model::{FormattedInput, ModelChunk, ModelClient, ModelStream, Role};

use crate::sse::{self, ChatDeltaParser};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Connection settings for an OpenAI-compatible chat-completions endpoint.
#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: SecretString,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            model: DEFAULT_MODEL.into(),
            api_key: SecretString::from(api_key.into()),
            temperature: None,
            max_tokens: None,
            connect_timeout: CONNECT_TIMEOUT,
            idle_timeout: SSE_IDLE_TIMEOUT,
        }
    }

    /// Reads `OPENAI_API_KEY` (required), `OPENAI_BASE_URL` and `OPENAI_MODEL`.
    pub fn from_env() -> Result<Self, ModelError> {
        let key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ModelError::AuthenticationFailed("OPENAI_API_KEY is not set".into()))?;
        let mut config = Self::new(key);
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            config.base_url = url;
        }
        if let Ok(model) = std::env::var("OPENAI_MODEL") {
            config.model = model;
        }
        Ok(config)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

pub struct OpenAiClient {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, ModelError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ModelError::NetworkError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn build_body(&self, input: &FormattedInput) -> Value {
        let messages: Vec<Value> = input
            .messages
            .iter()
            .map(|m| {
                let mut msg = json!({
                    "role": wire_role(m.role),
                    "content": m.content,
                });
                if let Some(name) = m.name.as_deref().map(sanitize_name).filter(|n| !n.is_empty()) {
                    msg["name"] = Value::String(name);
                }
                msg
            })
            .collect();

        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
            "stream": true,
        });
        if let Some(t) = self.config.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(max) = self.config.max_tokens {
            body["max_tokens"] = json!(max);
        }
        body
    }
}

/// Environment messages have no wire role of their own; they go out as user
/// messages carrying the producer's name.
fn wire_role(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User | Role::Environment => "user",
        Role::Assistant => "assistant",
    }
}

/// Names must match `[a-zA-Z0-9_-]{1,64}`.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .take(64)
        .collect()
}

#[async_trait]
impl ModelClient for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    #[instrument(skip(self, input, session_id), fields(model = %self.config.model, session_id = %session_id, messages = input.len()))]
    async fn stream(
        &self,
        input: &FormattedInput,
        session_id: &SessionId,
    ) -> Result<ModelStream, ModelError> {
        let body = self.build_body(input);

        let resp = self
            .client
            .post(self.config.endpoint())
            .bearer_auth(self.config.api_key.expose_secret())
            .header("accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::NetworkError(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ModelError::from_status(status, body));
        }
        debug!("response stream opened");

        let stream = SseStream::with_idle_timeout(resp.bytes_stream(), self.config.idle_timeout);
        Ok(Box::pin(stream))
    }
}

/// Decodes a chat-completions byte stream into cumulative chunks. Emits an
/// error if no bytes arrive within `idle_duration`.
struct SseStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    parser: ChatDeltaParser,
    buffer: String,
    pending: VecDeque<Result<ModelChunk, ModelError>>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    finished: bool,
}

impl SseStream {
    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            parser: ChatDeltaParser::new(),
            buffer: String::new(),
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            finished: false,
        }
    }

    fn drain_frames(&mut self) {
        while let Some(pos) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..pos + 2).collect();
            for data in sse::parse_sse_data(&frame) {
                self.pending.extend(self.parser.parse_data(&data));
            }
        }
    }

    fn next_pending(&mut self) -> Option<Result<ModelChunk, ModelError>> {
        let item = self.pending.pop_front()?;
        if self.parser.is_done() && self.pending.is_empty() {
            self.finished = true;
        }
        Some(item)
    }
}

impl Stream for SseStream {
    type Item = Result<ModelChunk, ModelError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(item) = self.next_pending() {
            return Poll::Ready(Some(item));
        }
        if self.finished {
            return Poll::Ready(None);
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(deadline);

                    let text = String::from_utf8_lossy(&bytes).replace("\r\n", "\n");
                    self.buffer.push_str(&text);
                    self.drain_frames();

                    if let Some(item) = self.next_pending() {
                        return Poll::Ready(Some(item));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(ModelError::StreamInterrupted(e.to_string()))));
                }
                Poll::Ready(None) => {
                    if !self.buffer.is_empty() {
                        let rest = std::mem::take(&mut self.buffer);
                        for data in sse::parse_sse_data(&rest) {
                            let parsed = self.parser.parse_data(&data);
                            self.pending.extend(parsed);
                        }
                    }
                    if let Some(tail) = self.parser.finish() {
                        self.pending.push_back(tail);
                    }
                    self.finished = true;
                    return Poll::Ready(self.pending.pop_front());
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.finished = true;
                        return Poll::Ready(Some(Err(ModelError::Timeout(self.idle_duration))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use mindstream_core::model::ChatMessage;
    use mindstream_core::status::ModelStatus;

    fn client() -> OpenAiClient {
        OpenAiClient::new(OpenAiConfig::new("test-key").with_model("gpt-test")).unwrap()
    }

    fn frame(content: &str) -> bytes::Bytes {
        bytes::Bytes::from(format!(
            "data: {{\"choices\":[{{\"index\":0,\"delta\":{{\"content\":\"{content}\"}}}}]}}\n\n"
        ))
    }

    #[test]
    fn request_body_maps_roles() {
        let mut input = FormattedInput::default();
        input.push(ChatMessage::new(Role::System, "be brief"));
        input.push(ChatMessage::new(Role::User, "time?"));
        input.push(ChatMessage::new(Role::Assistant, "checking"));
        input.push(ChatMessage::new(Role::Environment, "12:00").named("clock plugin"));

        let body = client().build_body(&input);
        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["stream"], true);
        assert!(body.get("temperature").is_none());

        let roles: Vec<&str> = body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, ["system", "user", "assistant", "user"]);
        assert_eq!(body["messages"][3]["name"], "clock_plugin");
        assert!(body["messages"][1].get("name").is_none());
    }

    #[test]
    fn request_body_includes_sampling_options() {
        let mut config = OpenAiConfig::new("k");
        config.temperature = Some(0.0);
        config.max_tokens = Some(256);
        let client = OpenAiClient::new(config).unwrap();
        let body = client.build_body(&FormattedInput::default());
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["max_tokens"], 256);
    }

    #[test]
    fn endpoint_trims_trailing_slash() {
        let config = OpenAiConfig::new("k").with_base_url("http://localhost:8000/v1/");
        assert_eq!(config.endpoint(), "http://localhost:8000/v1/chat/completions");
    }

    #[test]
    fn sanitize_name_limits_charset_and_length() {
        assert_eq!(sanitize_name("web.search"), "web_search");
        assert_eq!(sanitize_name(&"x".repeat(80)).len(), 64);
    }

    #[test]
    fn api_key_is_redacted_in_debug() {
        let config = OpenAiConfig::new("sk-very-secret");
        assert!(!format!("{config:?}").contains("sk-very-secret"));
    }

    #[tokio::test]
    async fn sse_stream_yields_cumulative_chunks_then_end() {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<bytes::Bytes, reqwest::Error>>(16);
        let mut stream = Box::pin(SseStream::with_idle_timeout(
            tokio_stream::wrappers::ReceiverStream::new(rx),
            Duration::from_secs(5),
        ));

        tx.send(Ok(frame("Hel"))).await.unwrap();
        tx.send(Ok(frame("lo"))).await.unwrap();
        tx.send(Ok(bytes::Bytes::from("data: [DONE]\r\n\r\n"))).await.unwrap();
        drop(tx);

        let chunks: Vec<_> = stream.by_ref().collect().await;
        let chunks: Vec<ModelChunk> = chunks.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            chunks,
            vec![
                ModelChunk::streaming("Hel"),
                ModelChunk::streaming("Hello"),
                ModelChunk::end("Hello"),
            ]
        );
    }

    #[tokio::test]
    async fn sse_stream_split_frames_are_reassembled() {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<bytes::Bytes, reqwest::Error>>(16);
        let mut stream = Box::pin(SseStream::with_idle_timeout(
            tokio_stream::wrappers::ReceiverStream::new(rx),
            Duration::from_secs(5),
        ));

        let whole = frame("abc");
        let (a, b) = whole.split_at(10);
        tx.send(Ok(bytes::Bytes::copy_from_slice(a))).await.unwrap();
        tx.send(Ok(bytes::Bytes::copy_from_slice(b))).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, ModelChunk::streaming("abc"));
    }

    #[tokio::test]
    async fn sse_stream_close_without_done_is_interrupted() {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<bytes::Bytes, reqwest::Error>>(16);
        let mut stream = Box::pin(SseStream::with_idle_timeout(
            tokio_stream::wrappers::ReceiverStream::new(rx),
            Duration::from_secs(5),
        ));
        tx.send(Ok(frame("partial"))).await.unwrap();
        drop(tx);

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.status, ModelStatus::Streaming);
        assert!(matches!(
            stream.next().await,
            Some(Err(ModelError::StreamInterrupted(_)))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn sse_stream_idle_timeout_fires_when_no_data() {
        tokio::time::pause();

        let byte_stream = futures::stream::pending::<Result<bytes::Bytes, reqwest::Error>>();
        let mut stream = Box::pin(SseStream::with_idle_timeout(byte_stream, Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(6)).await;

        let event = stream.next().await;
        assert!(
            matches!(&event, Some(Err(ModelError::Timeout(d))) if *d == Duration::from_secs(5)),
            "expected idle timeout error, got: {event:?}"
        );
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn sse_stream_idle_timeout_resets_on_data() {
        tokio::time::pause();

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<bytes::Bytes, reqwest::Error>>(16);
        let mut stream = Box::pin(SseStream::with_idle_timeout(
            tokio_stream::wrappers::ReceiverStream::new(rx),
            Duration::from_secs(5),
        ));

        tx.send(Ok(frame("a"))).await.unwrap();
        let _ = stream.next().await;

        tokio::time::advance(Duration::from_secs(4)).await;

        tx.send(Ok(frame("b"))).await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.text, "ab");

        tx.send(Ok(bytes::Bytes::from("data: [DONE]\n\n"))).await.unwrap();
        let end = stream.next().await.unwrap().unwrap();
        assert_eq!(end.status, ModelStatus::End);
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn timeout_constants() {
        assert_eq!(CONNECT_TIMEOUT, Duration::from_secs(30));
        assert_eq!(SSE_IDLE_TIMEOUT, Duration::from_secs(90));
    }

    #[cfg(feature = "integration")]
    #[tokio::test]
    async fn live_completion_streams_to_end() {
        let client = OpenAiClient::new(OpenAiConfig::from_env().unwrap()).unwrap();
        let mut input = FormattedInput::default();
        input.push(ChatMessage::new(Role::User, "Reply with the single word: pong"));
        let chunks: Vec<_> = client
            .stream(&input, &SessionId::new())
            .await
            .unwrap()
            .collect()
            .await;
        let last = chunks.last().unwrap().as_ref().unwrap();
        assert_eq!(last.status, ModelStatus::End);
    }
}
