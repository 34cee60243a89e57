use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use parking_lot::Mutex;

use mindstream_core::errors::ModelError;
use mindstream_core::ids::SessionId;
use mindstream_core::model::{
    BlockingModelClient, BlockingModelStream, FormattedInput, ModelChunk, ModelClient, ModelStream,
};

/// Pre-programmed responses for deterministic runs without API calls.
#[derive(Clone, Debug)]
pub enum ScriptedResponse {
    /// Yield these items in order.
    Chunks(Vec<Result<ModelChunk, ModelError>>),
    /// Yield these items with a pause before each one.
    Paced(Duration, Vec<Result<ModelChunk, ModelError>>),
    /// Fail the `stream()` call itself.
    Error(ModelError),
    /// Wait, then resolve the inner response.
    Delay(Duration, Box<ScriptedResponse>),
}

impl ScriptedResponse {
    /// Stream `text` as cumulative word prefixes, then an end chunk.
    pub fn text(text: &str) -> Self {
        let mut acc = String::new();
        let mut items: Vec<Result<ModelChunk, ModelError>> = text
            .split_inclusive(' ')
            .map(|word| {
                acc.push_str(word);
                Ok(ModelChunk::streaming(acc.clone()))
            })
            .collect();
        items.push(Ok(ModelChunk::end(text)));
        Self::Chunks(items)
    }

    pub fn chunks(chunks: Vec<ModelChunk>) -> Self {
        Self::Chunks(chunks.into_iter().map(Ok).collect())
    }

    /// Stream the given chunks, then fail mid-stream.
    pub fn stream_error(chunks: Vec<ModelChunk>, error: ModelError) -> Self {
        let mut items: Vec<_> = chunks.into_iter().map(Ok).collect();
        items.push(Err(error));
        Self::Chunks(items)
    }

    pub fn paced(interval: Duration, chunks: Vec<ModelChunk>) -> Self {
        Self::Paced(interval, chunks.into_iter().map(Ok).collect())
    }

    pub fn delayed(delay: Duration, inner: ScriptedResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Model client that replays a script, one response per call.
pub struct ScriptedModel {
    responses: Vec<ScriptedResponse>,
    call_count: AtomicUsize,
    inputs: Mutex<Vec<FormattedInput>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses,
            call_count: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Every input this model has been called with, in call order.
    pub fn inputs(&self) -> Vec<FormattedInput> {
        self.inputs.lock().clone()
    }

    fn next_response(&self, input: &FormattedInput) -> Result<ScriptedResponse, ModelError> {
        let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().push(input.clone());
        self.responses.get(idx).cloned().ok_or_else(|| {
            ModelError::InvalidRequest(format!("ScriptedModel: no response configured for call {idx}"))
        })
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(
        &self,
        input: &FormattedInput,
        _session_id: &SessionId,
    ) -> Result<ModelStream, ModelError> {
        let mut current = self.next_response(input)?;
        // Nested delays are unrolled iteratively.
        loop {
            match current {
                ScriptedResponse::Chunks(items) => return Ok(Box::pin(stream::iter(items))),
                ScriptedResponse::Paced(interval, items) => {
                    let paced = stream::iter(items).then(move |item| async move {
                        tokio::time::sleep(interval).await;
                        item
                    });
                    return Ok(Box::pin(paced));
                }
                ScriptedResponse::Error(e) => return Err(e),
                ScriptedResponse::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    current = *inner;
                }
            }
        }
    }
}

impl BlockingModelClient for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    fn stream(
        &self,
        input: &FormattedInput,
        _session_id: &SessionId,
    ) -> Result<BlockingModelStream, ModelError> {
        let mut current = self.next_response(input)?;
        loop {
            match current {
                ScriptedResponse::Chunks(items) => return Ok(Box::new(items.into_iter())),
                ScriptedResponse::Paced(interval, items) => {
                    return Ok(Box::new(items.into_iter().inspect(move |_| {
                        std::thread::sleep(interval);
                    })));
                }
                ScriptedResponse::Error(e) => return Err(e),
                ScriptedResponse::Delay(duration, inner) => {
                    std::thread::sleep(duration);
                    current = *inner;
                }
            }
        }
    }
}
