use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use pin_project_lite::pin_project;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use mindstream_core::errors::ExecutorError;
use mindstream_core::event::{Event, ToolType};
use mindstream_core::ids::{RunId, SessionId};
use mindstream_core::status::StatusCode;
use mindstream_core::tools::{BlockingExecutor, Executor, FinishCondition, NoToolCall};

use crate::agent::{BlockingStreamingAgent, BlockingTurn, StreamingAgent};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::registry::ExecutorRegistry;

/// What to do once a turn's model stream is exhausted.
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    /// Goal reached: yield this `End` event and stop.
    Finish(Event),
    /// Run the executor for `tool_type` on `call`.
    Dispatch { tool_type: ToolType, call: Event },
    /// No tool and not finished: yield this event and feed it back in.
    Continue(Event),
}

/// Status bookkeeping shared by both orchestrator variants. Performs no I/O,
/// so the blocking and async event sequences cannot diverge.
#[derive(Debug)]
pub struct TurnMachine {
    max_turns: u32,
    turn: u32,
    last_status: StatusCode,
}

impl TurnMachine {
    pub fn new(max_turns: u32) -> Self {
        Self {
            max_turns,
            turn: 0,
            last_status: StatusCode::SessionReady,
        }
    }

    /// Start the next turn. `false` once the turn limit is used up.
    pub fn begin_turn(&mut self) -> bool {
        if self.turn >= self.max_turns {
            return false;
        }
        self.turn += 1;
        self.last_status = StatusCode::SessionReady;
        true
    }

    pub fn turn(&self) -> u32 {
        self.turn
    }

    pub fn last_status(&self) -> StatusCode {
        self.last_status
    }

    /// Assign a caller-facing status to an agent event.
    pub fn classify(&mut self, mut event: Event) -> Event {
        let status = match event.requested_tool() {
            Some(_) if event.is_generation_end() => {
                if self.last_status.is_tool_in_progress() {
                    self.last_status.successor().unwrap_or(self.last_status)
                } else if self.last_status == StatusCode::SessionReady {
                    StatusCode::StreamIng
                } else {
                    self.last_status
                }
            }
            Some(tool) if tool == ToolType::Plugin.as_str() => StatusCode::PluginStart,
            Some(_) => StatusCode::Coding,
            None => StatusCode::StreamIng,
        };
        debug!(turn = self.turn, status = %status, "classified event");
        self.last_status = status;
        event.status = status;
        event
    }

    pub fn decide(
        &self,
        final_event: &Event,
        finish: &dyn FinishCondition,
    ) -> Result<Decision, EngineError> {
        if finish.is_finished(final_event) {
            return Ok(Decision::Finish(final_event.clone().with_status(StatusCode::End)));
        }
        match final_event.requested_tool() {
            Some(tool) => Ok(Decision::Dispatch {
                tool_type: tool.parse()?,
                call: final_event.clone(),
            }),
            None => Ok(Decision::Continue(
                final_event.clone().with_status(StatusCode::StreamIng),
            )),
        }
    }

    /// Stamp a tool result as delivered: one step past the turn's last
    /// status, or the tool type's return code when there is no next step.
    pub fn stamp_result(&mut self, tool_type: ToolType, result: Event) -> Event {
        let status = self
            .last_status
            .successor()
            .unwrap_or(StatusCode::returned(tool_type));
        self.last_status = status;
        result.with_status(status)
    }

    /// Terminal event reported when an executor fails.
    pub fn failure_event(tool_type: ToolType, error: &ExecutorError, session_id: &SessionId) -> Event {
        Event::new(tool_type.as_str(), error.to_string(), session_id.clone())
            .with_status(StatusCode::ServerErr)
    }
}

/// Assembles an orchestrator from an agent, executors and limits.
pub struct OrchestratorBuilder<A, E: ?Sized> {
    agent: A,
    executors: ExecutorRegistry<E>,
    finish: Arc<dyn FinishCondition>,
    max_turns: u32,
    channel_capacity: usize,
}

impl<A, E: ?Sized> OrchestratorBuilder<A, E> {
    fn new(agent: A) -> Self {
        let config = EngineConfig::default();
        Self {
            agent,
            executors: ExecutorRegistry::new(),
            finish: Arc::new(NoToolCall),
            max_turns: config.max_turns,
            channel_capacity: config.channel_capacity,
        }
    }

    pub fn config(mut self, config: &EngineConfig) -> Self {
        self.max_turns = config.max_turns;
        self.channel_capacity = config.channel_capacity;
        self
    }

    pub fn executor(mut self, tool_type: ToolType, executor: Arc<E>) -> Self {
        self.executors.register(tool_type, executor);
        self
    }

    pub fn executors(mut self, executors: ExecutorRegistry<E>) -> Self {
        self.executors = executors;
        self
    }

    pub fn finish_condition(mut self, finish: Arc<dyn FinishCondition>) -> Self {
        self.finish = finish;
        self
    }

    pub fn max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    fn validate(&self, parser_tool_types: &[ToolType]) -> Result<(), EngineError> {
        if self.max_turns == 0 {
            return Err(EngineError::Config("max_turns must be at least 1".into()));
        }
        if self.channel_capacity == 0 {
            return Err(EngineError::Config("channel_capacity must be at least 1".into()));
        }
        self.executors.validate(parser_tool_types)
    }
}

impl OrchestratorBuilder<StreamingAgent, dyn Executor> {
    pub fn build(self) -> Result<Orchestrator, EngineError> {
        self.validate(self.agent.core().tool_types())?;
        Ok(Orchestrator {
            inner: Arc::new(Inner {
                agent: self.agent,
                executors: self.executors,
                finish: self.finish,
                max_turns: self.max_turns,
            }),
            channel_capacity: self.channel_capacity,
        })
    }
}

impl OrchestratorBuilder<BlockingStreamingAgent, dyn BlockingExecutor> {
    pub fn build(self) -> Result<BlockingOrchestrator, EngineError> {
        self.validate(self.agent.core().tool_types())?;
        Ok(BlockingOrchestrator {
            agent: self.agent,
            executors: self.executors,
            finish: self.finish,
            max_turns: self.max_turns,
        })
    }
}

struct Inner {
    agent: StreamingAgent,
    executors: ExecutorRegistry<dyn Executor>,
    finish: Arc<dyn FinishCondition>,
    max_turns: u32,
}

/// Runs sessions on the tokio scheduler, one producer task per run.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
    channel_capacity: usize,
}

impl Orchestrator {
    pub fn builder(agent: StreamingAgent) -> OrchestratorBuilder<StreamingAgent, dyn Executor> {
        OrchestratorBuilder::new(agent)
    }

    pub fn agent(&self) -> &StreamingAgent {
        &self.inner.agent
    }

    pub fn max_turns(&self) -> u32 {
        self.inner.max_turns
    }

    /// Run a session with the configured turn limit. Must be called from
    /// within a tokio runtime.
    pub fn run(&self, message: Event, session_id: SessionId) -> EventStream {
        self.run_with_limit(message, session_id, self.inner.max_turns)
    }

    pub fn run_with_limit(&self, message: Event, session_id: SessionId, max_turns: u32) -> EventStream {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let cancel = CancellationToken::new();
        let run_id = RunId::new();
        let span = info_span!("orchestrator_run", run_id = %run_id, session_id = %session_id, max_turns);

        let inner = Arc::clone(&self.inner);
        let emitter = Emitter {
            tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(
            async move {
                match inner.drive(message, &session_id, max_turns, &emitter).await {
                    Ok(()) => {}
                    Err(EngineError::Cancelled) => debug!("run cancelled"),
                    Err(e) => {
                        // The receiver may already be gone; nothing else to report to.
                        let _ = emitter.send(Err(e)).await;
                    }
                }
            }
            .instrument(span),
        );

        EventStream::new(rx, cancel)
    }
}

struct Emitter {
    tx: mpsc::Sender<Result<Event, EngineError>>,
    cancel: CancellationToken,
}

impl Emitter {
    /// Wait for room in the channel. Model and tool calls hold a permit while
    /// they run, so none starts before the caller has taken the previous event.
    async fn reserve(&self) -> Result<mpsc::Permit<'_, Result<Event, EngineError>>, EngineError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(EngineError::Cancelled),
            permit = self.tx.reserve() => permit.map_err(|_| {
                warn!("event receiver dropped, stopping run");
                EngineError::Cancelled
            }),
        }
    }

    async fn send(&self, item: Result<Event, EngineError>) -> Result<(), EngineError> {
        self.reserve().await?.send(item);
        Ok(())
    }
}

impl Inner {
    async fn drive(
        &self,
        message: Event,
        session_id: &SessionId,
        max_turns: u32,
        emitter: &Emitter,
    ) -> Result<(), EngineError> {
        let cancel = &emitter.cancel;
        let mut machine = TurnMachine::new(max_turns);
        let mut message = message;

        while machine.begin_turn() {
            let mut permit = Some(emitter.reserve().await?);
            let mut turn = self.agent.forward(vec![message], session_id.clone());
            let mut final_event = None;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                    next = turn.next() => next,
                };
                let Some(item) = next else { break };
                let event = machine.classify(item?);
                final_event = Some(event.clone());
                match permit.take() {
                    Some(permit) => permit.send(Ok(event)),
                    None => emitter.send(Ok(event)).await?,
                }
            }
            drop(turn);

            let final_event = final_event
                .ok_or_else(|| EngineError::Internal("agent turn produced no events".into()))?;

            message = match machine.decide(&final_event, self.finish.as_ref())? {
                Decision::Finish(end) => {
                    info!(turn = machine.turn(), "session finished");
                    emitter.send(Ok(end)).await?;
                    return Ok(());
                }
                Decision::Continue(event) => {
                    emitter.send(Ok(event.clone())).await?;
                    event
                }
                Decision::Dispatch { tool_type, call } => {
                    let executor = self.executors.require(tool_type)?;
                    let permit = emitter.reserve().await?;
                    info!(turn = machine.turn(), tool_type = %tool_type, executor = executor.name(), "dispatching tool call");
                    let outcome = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                        outcome = executor.execute(&call, session_id) => outcome,
                    };
                    match outcome {
                        Ok(result) => {
                            let result = machine.stamp_result(tool_type, result);
                            permit.send(Ok(result.clone()));
                            result
                        }
                        Err(source) => {
                            error!(tool_type = %tool_type, error = %source, "executor failed");
                            let failure = TurnMachine::failure_event(tool_type, &source, session_id);
                            permit.send(Ok(failure));
                            return Err(EngineError::Executor { tool_type, source });
                        }
                    }
                }
            };
        }

        warn!(max_turns, "turn limit reached without finishing");
        Ok(())
    }
}

pin_project! {
    /// Live events of one run. Dropping it, or calling [`EventStream::cancel`],
    /// stops the producer at its next suspension point. A caller that simply
    /// stops polling stalls the producer after at most one further model or
    /// tool call.
    pub struct EventStream {
        #[pin]
        inner: ReceiverStream<Result<Event, EngineError>>,
        cancel: CancellationToken,
        _guard: DropGuard,
    }
}

impl EventStream {
    fn new(rx: mpsc::Receiver<Result<Event, EngineError>>, cancel: CancellationToken) -> Self {
        Self {
            inner: ReceiverStream::new(rx),
            _guard: cancel.clone().drop_guard(),
            cancel,
        }
    }

    /// Stop the run. Events not yet received are discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Stream for EventStream {
    type Item = Result<Event, EngineError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if this.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        this.inner.poll_next(cx)
    }
}

/// Runs sessions on the calling thread through a pull-based iterator.
pub struct BlockingOrchestrator {
    agent: BlockingStreamingAgent,
    executors: ExecutorRegistry<dyn BlockingExecutor>,
    finish: Arc<dyn FinishCondition>,
    max_turns: u32,
}

impl BlockingOrchestrator {
    pub fn builder(
        agent: BlockingStreamingAgent,
    ) -> OrchestratorBuilder<BlockingStreamingAgent, dyn BlockingExecutor> {
        OrchestratorBuilder::new(agent)
    }

    pub fn agent(&self) -> &BlockingStreamingAgent {
        &self.agent
    }

    pub fn max_turns(&self) -> u32 {
        self.max_turns
    }

    pub fn run(&self, message: Event, session_id: SessionId) -> BlockingRun<'_> {
        self.run_with_limit(message, session_id, self.max_turns)
    }

    pub fn run_with_limit(&self, message: Event, session_id: SessionId, max_turns: u32) -> BlockingRun<'_> {
        let span = info_span!(
            "orchestrator_run",
            run_id = %RunId::new(),
            session_id = %session_id,
            max_turns
        );
        BlockingRun {
            orchestrator: self,
            session_id,
            machine: TurnMachine::new(max_turns),
            message: Some(message),
            current: None,
            final_event: None,
            queue: VecDeque::new(),
            done: false,
            span,
        }
    }
}

/// Lazy event sequence of one blocking run. No model or tool call is made
/// until `next()` needs it.
pub struct BlockingRun<'a> {
    orchestrator: &'a BlockingOrchestrator,
    session_id: SessionId,
    machine: TurnMachine,
    message: Option<Event>,
    current: Option<BlockingTurn<'a>>,
    final_event: Option<Event>,
    queue: VecDeque<Result<Event, EngineError>>,
    done: bool,
    span: Span,
}

impl BlockingRun<'_> {
    fn fail(&mut self, error: EngineError) {
        self.queue.push_back(Err(error));
        self.done = true;
    }

    /// Everything that happens between turns: finish check and dispatch.
    fn after_turn(&mut self) {
        let Some(final_event) = self.final_event.take() else {
            self.fail(EngineError::Internal("agent turn produced no events".into()));
            return;
        };
        let decision = match self
            .machine
            .decide(&final_event, self.orchestrator.finish.as_ref())
        {
            Ok(decision) => decision,
            Err(e) => return self.fail(e),
        };

        match decision {
            Decision::Finish(end) => {
                info!(turn = self.machine.turn(), "session finished");
                self.queue.push_back(Ok(end));
                self.done = true;
            }
            Decision::Continue(event) => {
                self.queue.push_back(Ok(event.clone()));
                self.message = Some(event);
            }
            Decision::Dispatch { tool_type, call } => {
                let executor = match self.orchestrator.executors.require(tool_type) {
                    Ok(executor) => executor,
                    Err(e) => return self.fail(e),
                };
                info!(turn = self.machine.turn(), tool_type = %tool_type, executor = executor.name(), "dispatching tool call");
                match executor.execute(&call, &self.session_id) {
                    Ok(result) => {
                        let result = self.machine.stamp_result(tool_type, result);
                        self.queue.push_back(Ok(result.clone()));
                        self.message = Some(result);
                    }
                    Err(source) => {
                        error!(tool_type = %tool_type, error = %source, "executor failed");
                        let failure = TurnMachine::failure_event(tool_type, &source, &self.session_id);
                        self.queue.push_back(Ok(failure));
                        self.fail(EngineError::Executor { tool_type, source });
                    }
                }
            }
        }
    }
}

impl<'a> Iterator for BlockingRun<'a> {
    type Item = Result<Event, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        let span = self.span.clone();
        let _enter = span.enter();
        loop {
            if let Some(item) = self.queue.pop_front() {
                return Some(item);
            }
            if self.done {
                return None;
            }

            if let Some(turn) = self.current.as_mut() {
                match turn.next() {
                    Some(Ok(event)) => {
                        let event = self.machine.classify(event);
                        self.final_event = Some(event.clone());
                        return Some(Ok(event));
                    }
                    Some(Err(e)) => {
                        self.current = None;
                        self.done = true;
                        return Some(Err(e.into()));
                    }
                    None => {
                        self.current = None;
                        self.after_turn();
                        continue;
                    }
                }
            }

            match self.message.take() {
                Some(message) if self.machine.begin_turn() => {
                    let orchestrator: &'a BlockingOrchestrator = self.orchestrator;
                    let turn = orchestrator.agent.forward(vec![message], self.session_id.clone());
                    self.current = Some(turn);
                }
                _ => {
                    warn!(max_turns = self.machine.max_turns, "turn limit reached without finishing");
                    self.done = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mindstream_core::event::StructuredFields;
    use mindstream_core::status::ModelStatus;

    fn sid() -> SessionId {
        SessionId::from_raw("s1")
    }

    fn agent_event(tool: Option<&str>, model_status: ModelStatus) -> Event {
        let mut event = Event::new("agent", "x", sid()).with_model_status(model_status);
        if let Some(tool) = tool {
            event = event.with_fields(StructuredFields::new().with_tool_type(tool));
        }
        event
    }

    #[test]
    fn turn_limit() {
        let mut machine = TurnMachine::new(2);
        assert!(machine.begin_turn());
        assert!(machine.begin_turn());
        assert!(!machine.begin_turn());
        assert_eq!(machine.turn(), 2);
    }

    #[test]
    fn plain_text_streams() {
        let mut machine = TurnMachine::new(1);
        machine.begin_turn();
        let e = machine.classify(agent_event(None, ModelStatus::Streaming));
        assert_eq!(e.status, StatusCode::StreamIng);
        let e = machine.classify(agent_event(None, ModelStatus::End));
        assert_eq!(e.status, StatusCode::StreamIng);
    }

    #[test]
    fn plugin_chain() {
        let mut machine = TurnMachine::new(1);
        machine.begin_turn();
        let statuses: Vec<StatusCode> = [
            agent_event(None, ModelStatus::Streaming),
            agent_event(Some("plugin"), ModelStatus::Streaming),
            agent_event(Some("plugin"), ModelStatus::Streaming),
            agent_event(Some("plugin"), ModelStatus::End),
        ]
        .into_iter()
        .map(|e| machine.classify(e).status)
        .collect();
        assert_eq!(
            statuses,
            [
                StatusCode::StreamIng,
                StatusCode::PluginStart,
                StatusCode::PluginStart,
                StatusCode::PluginEnd
            ]
        );

        let result = machine.stamp_result(ToolType::Plugin, Event::new("clock", "12:00", sid()));
        assert_eq!(result.status, StatusCode::PluginReturn);
    }

    #[test]
    fn interpreter_chain() {
        let mut machine = TurnMachine::new(1);
        machine.begin_turn();
        assert_eq!(
            machine.classify(agent_event(Some("interpreter"), ModelStatus::Streaming)).status,
            StatusCode::Coding
        );
        assert_eq!(
            machine.classify(agent_event(Some("interpreter"), ModelStatus::End)).status,
            StatusCode::CodeEnd
        );
        let result = machine.stamp_result(ToolType::Interpreter, Event::new("python", "2", sid()));
        assert_eq!(result.status, StatusCode::CodeReturn);
    }

    #[test]
    fn tool_call_in_single_end_chunk_never_yields_session_ready() {
        let mut machine = TurnMachine::new(1);
        machine.begin_turn();
        let e = machine.classify(agent_event(Some("plugin"), ModelStatus::End));
        assert_eq!(e.status, StatusCode::StreamIng);

        // No successor from STREAM_ING, so the result gets the plugin return code.
        let result = machine.stamp_result(ToolType::Plugin, Event::new("clock", "", sid()));
        assert_eq!(result.status, StatusCode::PluginReturn);
    }

    #[test]
    fn end_after_end_carries_over() {
        let mut machine = TurnMachine::new(1);
        machine.begin_turn();
        machine.classify(agent_event(Some("plugin"), ModelStatus::Streaming));
        machine.classify(agent_event(Some("plugin"), ModelStatus::End));
        let again = machine.classify(agent_event(Some("plugin"), ModelStatus::End));
        assert_eq!(again.status, StatusCode::PluginEnd);
    }

    #[test]
    fn begin_turn_resets_status() {
        let mut machine = TurnMachine::new(2);
        machine.begin_turn();
        machine.classify(agent_event(Some("plugin"), ModelStatus::Streaming));
        assert_eq!(machine.last_status(), StatusCode::PluginStart);
        machine.begin_turn();
        assert_eq!(machine.last_status(), StatusCode::SessionReady);
    }

    #[test]
    fn decide_finish_dispatch_continue() {
        let machine = TurnMachine::new(1);

        let answer = agent_event(None, ModelStatus::End);
        match machine.decide(&answer, &NoToolCall).unwrap() {
            Decision::Finish(end) => assert_eq!(end.status, StatusCode::End),
            other => panic!("expected finish, got {other:?}"),
        }

        let call = agent_event(Some("plugin"), ModelStatus::End);
        assert!(matches!(
            machine.decide(&call, &NoToolCall).unwrap(),
            Decision::Dispatch { tool_type: ToolType::Plugin, .. }
        ));

        let never = |_: &Event| false;
        match machine.decide(&answer, &never).unwrap() {
            Decision::Continue(event) => assert_eq!(event.status, StatusCode::StreamIng),
            other => panic!("expected continue, got {other:?}"),
        }
    }

    #[test]
    fn decide_unknown_tool_type_is_fatal() {
        let machine = TurnMachine::new(1);
        let call = agent_event(Some("browser"), ModelStatus::End);
        assert!(matches!(
            machine.decide(&call, &NoToolCall),
            Err(EngineError::UnknownToolType(t)) if t == "browser"
        ));
    }

    #[test]
    fn failure_event_shape() {
        let event = TurnMachine::failure_event(
            ToolType::Interpreter,
            &ExecutorError::ExecutionFailed("boom".into()),
            &sid(),
        );
        assert_eq!(event.status, StatusCode::ServerErr);
        assert_eq!(event.sender, "interpreter");
        assert_eq!(event.content, "execution failed: boom");
    }
}
