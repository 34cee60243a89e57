use mindstream_core::event::Event;
use mindstream_core::format::Aggregator;
use mindstream_core::model::{ChatMessage, FormattedInput, Role};

/// Renders memory as a chat transcript.
///
/// The system message is the template followed by the output schema,
/// separated by a blank line, and is left out when both are empty. The
/// agent's own events become assistant messages, `user` events become user
/// messages, and anything else (tool results) becomes an environment message
/// named after its sender.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultAggregator;

impl Aggregator for DefaultAggregator {
    fn format(
        &self,
        memory: &[Event],
        agent_name: &str,
        output_schema: Option<&str>,
        template: Option<&str>,
    ) -> FormattedInput {
        let mut input = FormattedInput::default();

        let system: Vec<&str> = [template, output_schema]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if !system.is_empty() {
            input.push(ChatMessage::new(Role::System, system.join("\n\n")));
        }

        for event in memory {
            let message = if event.sender == agent_name {
                ChatMessage::new(Role::Assistant, event.content.clone())
            } else if event.sender == "user" {
                ChatMessage::new(Role::User, event.content.clone())
            } else {
                ChatMessage::new(Role::Environment, event.content.clone()).named(event.sender.clone())
            };
            input.push(message);
        }
        input
    }
}
