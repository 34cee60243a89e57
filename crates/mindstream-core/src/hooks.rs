use crate::event::Event;
use crate::ids::SessionId;

/// What a hook sees about the call it is attached to.
#[derive(Clone, Copy, Debug)]
pub struct HookContext<'a> {
    pub agent_name: &'a str,
    pub session_id: &'a SessionId,
}

/// Observer around each model call. Hooks get owned copies and hand back a
/// replacement, or `None` to keep what they were given.
pub trait AgentHook: Send + Sync {
    fn name(&self) -> &str;

    fn before(&self, _ctx: HookContext<'_>, _input: Vec<Event>) -> Option<Vec<Event>> {
        None
    }

    fn after(&self, _ctx: HookContext<'_>, _output: Event) -> Option<Event> {
        None
    }
}
