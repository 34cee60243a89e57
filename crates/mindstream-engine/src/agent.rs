use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tracing::{debug, info_span, Instrument, Span};

use mindstream_core::errors::ModelError;
use mindstream_core::event::{Event, StructuredFields, ToolType};
use mindstream_core::format::{Aggregator, OutputParser};
use mindstream_core::hooks::{AgentHook, HookContext};
use mindstream_core::ids::SessionId;
use mindstream_core::model::{
    BlockingModelClient, BlockingModelStream, FormattedInput, ModelChunk, ModelClient, ModelStream,
};

use crate::aggregator::DefaultAggregator;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::hooks::HookChain;
use crate::memory::MemoryStore;

/// Everything about a single model call that does not touch I/O.
pub struct AgentCore {
    name: String,
    template: Option<String>,
    memory: Arc<MemoryStore>,
    aggregator: Arc<dyn Aggregator>,
    parser: Option<Arc<dyn OutputParser>>,
    hooks: HookChain,
}

impl AgentCore {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    /// Tool types the configured parser can emit.
    pub fn tool_types(&self) -> &[ToolType] {
        match self.parser.as_deref() {
            Some(parser) => parser.tool_types(),
            None => &[],
        }
    }

    fn hook_ctx<'a>(&'a self, session_id: &'a SessionId) -> HookContext<'a> {
        HookContext {
            agent_name: &self.name,
            session_id,
        }
    }

    /// Run `before` hooks and render memory plus the pending input.
    fn prepare(&self, input: Vec<Event>, session_id: &SessionId) -> (Vec<Event>, FormattedInput) {
        let input = self.hooks.run_before(self.hook_ctx(session_id), input);

        let mut history = self.memory.snapshot(session_id);
        history.extend(input.iter().cloned());

        let schema = self.parser.as_deref().and_then(|p| p.instructions());
        let formatted =
            self.aggregator
                .format(&history, &self.name, schema, self.template.as_deref());
        (input, formatted)
    }

    fn chunk_event(&self, chunk: ModelChunk, session_id: &SessionId) -> Event {
        let fields = self.parse(&chunk.text);
        let mut event =
            Event::new(self.name.as_str(), chunk.text, session_id.clone()).with_model_status(chunk.status);
        event.structured_fields = fields;
        event
    }

    fn parse(&self, text: &str) -> Option<StructuredFields> {
        self.parser.as_deref().and_then(|p| p.parse(text))
    }

    /// Commit input and final event in one step, then run `after` hooks.
    fn complete(&self, input: Vec<Event>, last: Option<Event>, session_id: &SessionId) -> Event {
        let final_event = last.unwrap_or_else(|| {
            debug!("empty model response");
            self.chunk_event(ModelChunk::end(""), session_id)
        });

        let mut commit = input;
        commit.push(final_event.clone());
        self.memory.commit(session_id, commit);

        self.hooks.run_after(self.hook_ctx(session_id), final_event)
    }
}

/// Holds back one event so the last one can be finalized before it is yielded.
#[derive(Debug, Default)]
pub(crate) struct TurnAssembler {
    pending: Option<Event>,
}

impl TurnAssembler {
    /// Buffer `event`, returning the previously buffered one.
    pub(crate) fn push(&mut self, event: Event) -> Option<Event> {
        self.pending.replace(event)
    }

    /// The last event pushed, if any.
    pub(crate) fn finish(self) -> Option<Event> {
        self.pending
    }
}

enum TurnState<S> {
    Start(Vec<Event>),
    Streaming {
        input: Vec<Event>,
        stream: S,
        assembler: TurnAssembler,
    },
    Done,
}

/// Drives one streaming model call and relays each chunk as an event.
///
/// The final event is committed to memory together with the turn's input,
/// passed through the `after` hooks, and yielded last. A model error is
/// yielded as the last item and leaves memory untouched.
pub struct StreamingAgent {
    core: AgentCore,
    model: Arc<dyn ModelClient>,
}

impl StreamingAgent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    pub fn core(&self) -> &AgentCore {
        &self.core
    }

    pub fn forward(
        &self,
        input: Vec<Event>,
        session_id: SessionId,
    ) -> BoxStream<'_, Result<Event, ModelError>> {
        let span = info_span!("agent_turn", agent = %self.core.name, session_id = %session_id);
        let core = &self.core;
        let model = &self.model;

        stream::unfold(TurnState::<ModelStream>::Start(input), move |state| {
            let session_id = session_id.clone();
            let span = span.clone();
            async move {
                let mut state = state;
                loop {
                    state = match state {
                        TurnState::Done => return None,
                        TurnState::Start(input) => {
                            let (input, formatted) = core.prepare(input, &session_id);
                            debug!(messages = formatted.len(), model = model.name(), "calling model");
                            match model.stream(&formatted, &session_id).await {
                                Ok(stream) => TurnState::Streaming {
                                    input,
                                    stream,
                                    assembler: TurnAssembler::default(),
                                },
                                Err(e) => return Some((Err(e), TurnState::Done)),
                            }
                        }
                        TurnState::Streaming {
                            input,
                            mut stream,
                            mut assembler,
                        } => match stream.next().await {
                            Some(Ok(chunk)) => {
                                let event = core.chunk_event(chunk, &session_id);
                                let ready = assembler.push(event);
                                let next = TurnState::Streaming {
                                    input,
                                    stream,
                                    assembler,
                                };
                                match ready {
                                    Some(event) => return Some((Ok(event), next)),
                                    None => next,
                                }
                            }
                            Some(Err(e)) => return Some((Err(e), TurnState::Done)),
                            None => {
                                let last = core.complete(input, assembler.finish(), &session_id);
                                return Some((Ok(last), TurnState::Done));
                            }
                        },
                    };
                }
            }
            .instrument(span)
        })
        .boxed()
    }
}

/// Blocking counterpart of [`StreamingAgent`]. Nothing happens until the
/// returned iterator is pulled.
pub struct BlockingStreamingAgent {
    core: AgentCore,
    model: Arc<dyn BlockingModelClient>,
}

impl BlockingStreamingAgent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    pub fn core(&self) -> &AgentCore {
        &self.core
    }

    pub fn forward(&self, input: Vec<Event>, session_id: SessionId) -> BlockingTurn<'_> {
        let span = info_span!("agent_turn", agent = %self.core.name, session_id = %session_id);
        BlockingTurn {
            agent: self,
            session_id,
            state: TurnState::Start(input),
            span,
        }
    }
}

pub struct BlockingTurn<'a> {
    agent: &'a BlockingStreamingAgent,
    session_id: SessionId,
    state: TurnState<BlockingModelStream>,
    span: Span,
}

impl Iterator for BlockingTurn<'_> {
    type Item = Result<Event, ModelError>;

    fn next(&mut self) -> Option<Self::Item> {
        let _enter = self.span.enter();
        let core = &self.agent.core;
        loop {
            self.state = match std::mem::replace(&mut self.state, TurnState::Done) {
                TurnState::Done => return None,
                TurnState::Start(input) => {
                    let (input, formatted) = core.prepare(input, &self.session_id);
                    debug!(
                        messages = formatted.len(),
                        model = self.agent.model.name(),
                        "calling model"
                    );
                    match self.agent.model.stream(&formatted, &self.session_id) {
                        Ok(stream) => TurnState::Streaming {
                            input,
                            stream,
                            assembler: TurnAssembler::default(),
                        },
                        Err(e) => return Some(Err(e)),
                    }
                }
                TurnState::Streaming {
                    input,
                    mut stream,
                    mut assembler,
                } => match stream.next() {
                    Some(Ok(chunk)) => {
                        let event = core.chunk_event(chunk, &self.session_id);
                        let ready = assembler.push(event);
                        self.state = TurnState::Streaming {
                            input,
                            stream,
                            assembler,
                        };
                        match ready {
                            Some(event) => return Some(Ok(event)),
                            None => continue,
                        }
                    }
                    Some(Err(e)) => return Some(Err(e)),
                    None => {
                        let last = core.complete(input, assembler.finish(), &self.session_id);
                        return Some(Ok(last));
                    }
                },
            };
        }
    }
}

/// Assembles an [`AgentCore`] and wraps it around a model client.
pub struct AgentBuilder {
    name: String,
    template: Option<String>,
    memory: Option<Arc<MemoryStore>>,
    config: EngineConfig,
    aggregator: Arc<dyn Aggregator>,
    parser: Option<Arc<dyn OutputParser>>,
    hooks: HookChain,
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self::from_config(EngineConfig::default())
    }

    /// Name, template and memory retention come from `config`.
    pub fn from_config(config: EngineConfig) -> Self {
        Self {
            name: config.agent_name.clone(),
            template: config.template().map(str::to_string),
            memory: None,
            config,
            aggregator: Arc::new(DefaultAggregator),
            parser: None,
            hooks: HookChain::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into()).filter(|t| !t.trim().is_empty());
        self
    }

    /// Share an existing memory store instead of creating one.
    pub fn memory(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn aggregator(mut self, aggregator: Arc<dyn Aggregator>) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn parser(mut self, parser: Arc<dyn OutputParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn hook(mut self, hook: Arc<dyn AgentHook>) -> Self {
        self.hooks.register(hook);
        self
    }

    fn build_core(self) -> Result<AgentCore, EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Config("agent name must not be empty".into()));
        }
        let memory = self
            .memory
            .unwrap_or_else(|| Arc::new(MemoryStore::new(self.config.memory)));
        Ok(AgentCore {
            name: self.name,
            template: self.template,
            memory,
            aggregator: self.aggregator,
            parser: self.parser,
            hooks: self.hooks,
        })
    }

    pub fn build(self, model: Arc<dyn ModelClient>) -> Result<StreamingAgent, EngineError> {
        Ok(StreamingAgent {
            core: self.build_core()?,
            model,
        })
    }

    pub fn build_blocking(
        self,
        model: Arc<dyn BlockingModelClient>,
    ) -> Result<BlockingStreamingAgent, EngineError> {
        Ok(BlockingStreamingAgent {
            core: self.build_core()?,
            model,
        })
    }
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ActionParser;
    use mindstream_core::model::Role;
    use mindstream_core::status::ModelStatus;
    use mindstream_llm::{ScriptedModel, ScriptedResponse};

    fn sid() -> SessionId {
        SessionId::from_raw("s1")
    }

    struct Shout;
    impl AgentHook for Shout {
        fn name(&self) -> &str {
            "shout"
        }
        fn before(&self, _ctx: HookContext<'_>, input: Vec<Event>) -> Option<Vec<Event>> {
            Some(
                input
                    .into_iter()
                    .map(|mut e| {
                        e.content = e.content.to_uppercase();
                        e
                    })
                    .collect(),
            )
        }
        fn after(&self, _ctx: HookContext<'_>, mut output: Event) -> Option<Event> {
            output.content.push('!');
            Some(output)
        }
    }

    #[test]
    fn assembler_holds_one_back() {
        let mut asm = TurnAssembler::default();
        assert!(asm.push(Event::new("a", "1", sid())).is_none());
        assert_eq!(asm.push(Event::new("a", "2", sid())).unwrap().content, "1");
        assert_eq!(asm.finish().unwrap().content, "2");
        assert!(TurnAssembler::default().finish().is_none());
    }

    #[tokio::test]
    async fn yields_one_event_per_chunk() {
        let model = Arc::new(ScriptedModel::new(vec![ScriptedResponse::text("a b c")]));
        let agent = AgentBuilder::new().name("agent").build(model).unwrap();

        let events: Vec<Event> = agent
            .forward(vec![Event::user("go", sid())], sid())
            .map(Result::unwrap)
            .collect()
            .await;

        let contents: Vec<&str> = events.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, ["a ", "a b ", "a b c", "a b c"]);
        assert!(events[..3].iter().all(|e| e.model_status == Some(ModelStatus::Streaming)));
        assert!(events[3].is_generation_end());
        assert!(events.iter().all(|e| e.sender == "agent"));
    }

    #[tokio::test]
    async fn commits_input_and_final_once() {
        let model = Arc::new(ScriptedModel::new(vec![ScriptedResponse::text("hello there")]));
        let agent = AgentBuilder::new().name("agent").build(model).unwrap();

        let _: Vec<_> = agent
            .forward(vec![Event::user("hi", sid())], sid())
            .collect()
            .await;

        let memory = agent.core().memory().snapshot(&sid());
        assert_eq!(memory.len(), 2);
        assert_eq!(memory[0].content, "hi");
        assert_eq!(memory[1].content, "hello there");
    }

    #[tokio::test]
    async fn memory_and_input_reach_the_model() {
        let model = Arc::new(ScriptedModel::new(vec![
            ScriptedResponse::text("first"),
            ScriptedResponse::text("second"),
        ]));
        let agent = AgentBuilder::new()
            .name("agent")
            .template("You are terse.")
            .build(model.clone())
            .unwrap();

        let _: Vec<_> = agent.forward(vec![Event::user("q1", sid())], sid()).collect().await;
        let _: Vec<_> = agent.forward(vec![Event::user("q2", sid())], sid()).collect().await;

        let inputs = model.inputs();
        let second: Vec<(Role, &str)> = inputs[1]
            .messages
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .collect();
        assert_eq!(
            second,
            [
                (Role::System, "You are terse."),
                (Role::User, "q1"),
                (Role::Assistant, "first"),
                (Role::User, "q2"),
            ]
        );
    }

    #[tokio::test]
    async fn empty_response_yields_empty_end_event() {
        let model = Arc::new(ScriptedModel::new(vec![ScriptedResponse::chunks(vec![])]));
        let agent = AgentBuilder::new().build(model).unwrap();

        let events: Vec<_> = agent
            .forward(vec![Event::user("hi", sid())], sid())
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        let last = events[0].as_ref().unwrap();
        assert_eq!(last.content, "");
        assert_eq!(last.sender, "mindstream");
        assert!(last.is_generation_end());
    }

    #[tokio::test]
    async fn model_error_leaves_memory_untouched() {
        let model = Arc::new(ScriptedModel::new(vec![ScriptedResponse::stream_error(
            vec![ModelChunk::streaming("par")],
            ModelError::StreamInterrupted("reset".into()),
        )]));
        let agent = AgentBuilder::new().build(model).unwrap();

        let items: Vec<_> = agent
            .forward(vec![Event::user("hi", sid())], sid())
            .collect()
            .await;
        // The held-back chunk is never released once the stream fails.
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(ModelError::StreamInterrupted(_))));
        assert!(agent.core().memory().is_empty(&sid()));
    }

    #[tokio::test]
    async fn parser_fields_attached() {
        let text = r#"Look it up.<|action_start|><|plugin|>{"name": "clock"}<|action_end|>"#;
        let model = Arc::new(ScriptedModel::new(vec![ScriptedResponse::chunks(vec![
            ModelChunk::streaming("Look it up."),
            ModelChunk::end(text),
        ])]));
        let agent = AgentBuilder::new()
            .parser(Arc::new(ActionParser::default()))
            .build(model)
            .unwrap();

        let events: Vec<Event> = agent
            .forward(vec![Event::user("time?", sid())], sid())
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(events[0].requested_tool(), None);
        assert_eq!(events[1].requested_tool(), Some("plugin"));
        assert_eq!(agent.core().tool_types(), ToolType::ALL);
    }

    #[tokio::test]
    async fn hooks_rewrite_input_and_output() {
        let model = Arc::new(ScriptedModel::new(vec![ScriptedResponse::text("ok")]));
        let agent = AgentBuilder::new()
            .hook(Arc::new(Shout))
            .build(model.clone())
            .unwrap();

        let events: Vec<Event> = agent
            .forward(vec![Event::user("quiet", sid())], sid())
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(model.inputs()[0].messages[0].content, "QUIET");
        assert_eq!(events.last().unwrap().content, "ok!");
        // Memory holds the pre-hook final event.
        let memory = agent.core().memory().snapshot(&sid());
        assert_eq!(memory[1].content, "ok");
    }

    #[test]
    fn blocking_turn_is_lazy_and_matches() {
        let model = Arc::new(ScriptedModel::new(vec![ScriptedResponse::text("x y")]));
        let agent = AgentBuilder::new().build_blocking(model.clone()).unwrap();

        let mut turn = agent.forward(vec![Event::user("go", sid())], sid());
        assert_eq!(model.call_count(), 0);

        let first = turn.next().unwrap().unwrap();
        assert_eq!(first.content, "x ");
        assert_eq!(model.call_count(), 1);

        let rest: Vec<Event> = turn.map(Result::unwrap).collect();
        let contents: Vec<&str> = rest.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, ["x y", "x y"]);
        assert_eq!(agent.core().memory().len(&sid()), 2);
    }

    #[test]
    fn empty_name_is_rejected() {
        let model = Arc::new(ScriptedModel::new(vec![]));
        assert!(matches!(
            AgentBuilder::new().name("").build(model),
            Err(EngineError::Config(_))
        ));
    }
}
