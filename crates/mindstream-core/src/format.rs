use crate::event::{Event, StructuredFields, ToolType};
use crate::model::FormattedInput;

/// Decodes raw model text into structured fields.
pub trait OutputParser: Send + Sync {
    /// `None` means "nothing structured here", which callers treat as plain text.
    fn parse(&self, text: &str) -> Option<StructuredFields>;

    /// Format instructions handed to the aggregator as the output schema.
    fn instructions(&self) -> Option<&str> {
        None
    }

    /// Tool types this parser can emit. Used to validate executor coverage.
    fn tool_types(&self) -> &[ToolType] {
        &[]
    }
}

/// Turns session memory into the exact input a model consumes.
pub trait Aggregator: Send + Sync {
    fn format(
        &self,
        memory: &[Event],
        agent_name: &str,
        output_schema: Option<&str>,
        template: Option<&str>,
    ) -> FormattedInput;
}
