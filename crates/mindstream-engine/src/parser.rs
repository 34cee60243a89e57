use serde_json::Value;

use mindstream_core::event::{StructuredFields, ToolType};
use mindstream_core::format::OutputParser;

use crate::plugin::PluginDefinition;

pub const ACTION_START: &str = "<|action_start|>";
pub const ACTION_END: &str = "<|action_end|>";

fn tag(tool_type: ToolType) -> &'static str {
    match tool_type {
        ToolType::Plugin => "<|plugin|>",
        ToolType::Interpreter => "<|interpreter|>",
    }
}

/// Recognises tool calls written with action markers:
///
/// ```text
/// I should search first.<|action_start|><|plugin|>{"name": "search", "parameters": {...}}<|action_end|>
/// ```
///
/// `tool_type` is set as soon as the start marker and tag have streamed in,
/// so partial output is already classified as an in-progress call. Tags for
/// tool types that are not enabled are left as plain text; an unrecognised
/// `<|name|>` tag is passed through as tool type `name`.
pub struct ActionParser {
    enabled: Vec<ToolType>,
    instructions: String,
}

impl ActionParser {
    pub fn new(enabled: &[ToolType]) -> Self {
        let mut enabled = enabled.to_vec();
        enabled.sort();
        enabled.dedup();
        let instructions = default_instructions(&enabled);
        Self {
            enabled,
            instructions,
        }
    }

    /// Append the plugin catalog to the instructions, one line per plugin
    /// with its description and parameter schema.
    pub fn with_plugins(mut self, plugins: &[PluginDefinition]) -> Self {
        if plugins.is_empty() || !self.is_enabled(ToolType::Plugin) {
            return self;
        }
        if !self.instructions.is_empty() {
            self.instructions.push('\n');
        }
        self.instructions.push_str("Available plugins:");
        for plugin in plugins {
            self.instructions.push_str(&format!(
                "\n- {}: {} Parameters: {}",
                plugin.name, plugin.description, plugin.parameters
            ));
        }
        self
    }

    /// Replace the format instructions handed to the aggregator.
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    fn is_enabled(&self, tool_type: ToolType) -> bool {
        self.enabled.contains(&tool_type)
    }
}

impl Default for ActionParser {
    fn default() -> Self {
        Self::new(&ToolType::ALL)
    }
}

impl OutputParser for ActionParser {
    fn parse(&self, text: &str) -> Option<StructuredFields> {
        let start = text.find(ACTION_START)?;
        let thought = text[..start].trim();
        let rest = &text[start + ACTION_START.len()..];

        let (tool_type, body) = split_tag(rest)?;
        if let Ok(known) = tool_type.parse::<ToolType>() {
            if !self.is_enabled(known) {
                return None;
            }
        }

        let (raw_action, complete) = match body.find(ACTION_END) {
            Some(end) => (body[..end].trim(), true),
            None => (body.trim(), false),
        };

        let action = if complete && tool_type == ToolType::Plugin.as_str() {
            serde_json::from_str::<Value>(raw_action)
                .unwrap_or_else(|_| Value::String(raw_action.to_string()))
        } else {
            Value::String(raw_action.to_string())
        };

        Some(
            StructuredFields::new()
                .with_tool_type(tool_type)
                .with("thought", thought)
                .with("action", action)
                .with("complete", complete),
        )
    }

    fn instructions(&self) -> Option<&str> {
        Some(self.instructions.as_str()).filter(|s| !s.is_empty())
    }

    fn tool_types(&self) -> &[ToolType] {
        &self.enabled
    }
}

/// Split `<|name|>body` into `(name, body)`. `None` until the tag is complete.
fn split_tag(rest: &str) -> Option<(&str, &str)> {
    let inner = rest.strip_prefix("<|")?;
    let close = inner.find("|>")?;
    let name = &inner[..close];
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((name, &inner[close + 2..]))
}

fn default_instructions(enabled: &[ToolType]) -> String {
    if enabled.is_empty() {
        return String::new();
    }
    let mut out = String::from(
        "When you need a tool, write your reasoning, then the call between action markers and stop.\n",
    );
    for tool_type in enabled {
        let example = match tool_type {
            ToolType::Plugin => r#"{"name": "<plugin>", "parameters": {...}}"#,
            ToolType::Interpreter => "<code to run>",
        };
        out.push_str(&format!(
            "- {}: {ACTION_START}{}{example}{ACTION_END}\n",
            tool_type,
            tag(*tool_type)
        ));
    }
    out.push_str("Answer without markers once no tool is needed.");
    out
}
