use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::SessionId;
use crate::status::{ModelStatus, StatusCode};

/// Closed set of tool kinds a model can request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolType {
    /// Code execution.
    Interpreter,
    /// Named plugin action (web search and friends).
    Plugin,
}

impl ToolType {
    pub const ALL: [ToolType; 2] = [ToolType::Interpreter, ToolType::Plugin];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interpreter => "interpreter",
            Self::Plugin => "plugin",
        }
    }
}

impl std::fmt::Display for ToolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown tool type: {0}")]
pub struct UnknownToolType(pub String);

impl std::str::FromStr for ToolType {
    type Err = UnknownToolType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interpreter" => Ok(Self::Interpreter),
            "plugin" => Ok(Self::Plugin),
            other => Err(UnknownToolType(other.to_string())),
        }
    }
}

/// Fields decoded from model output by an output parser.
///
/// `tool_type` is reserved; everything else is parser-specific and kept as
/// JSON (thought text, action payloads, plan graphs, reference maps).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_type: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl StructuredFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool_type(mut self, tool_type: impl Into<String>) -> Self {
        self.tool_type = Some(tool_type.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// The requested tool type, if present and non-empty.
    pub fn tool_type(&self) -> Option<&str> {
        self.tool_type.as_deref().filter(|t| !t.is_empty())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// One increment of conversation progress.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub sender: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_fields: Option<StructuredFields>,
    pub status: StatusCode,
    /// Raw model-stream status this event was produced under. Absent for
    /// events that did not come from the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_status: Option<ModelStatus>,
    pub session_id: SessionId,
}

impl Event {
    pub fn new(sender: impl Into<String>, content: impl Into<String>, session_id: SessionId) -> Self {
        Self {
            sender: sender.into(),
            content: content.into(),
            structured_fields: None,
            status: StatusCode::SessionReady,
            model_status: None,
            session_id,
        }
    }

    /// A message typed by the user.
    pub fn user(content: impl Into<String>, session_id: SessionId) -> Self {
        Self::new("user", content, session_id)
    }

    pub fn with_fields(mut self, fields: StructuredFields) -> Self {
        self.structured_fields = Some(fields);
        self
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_model_status(mut self, model_status: ModelStatus) -> Self {
        self.model_status = Some(model_status);
        self
    }

    /// The tool type requested by this event, if any.
    pub fn requested_tool(&self) -> Option<&str> {
        self.structured_fields.as_ref().and_then(StructuredFields::tool_type)
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.structured_fields.as_ref().and_then(|f| f.get(key))
    }

    /// True when the model signalled the end of generation for this event.
    pub fn is_generation_end(&self) -> bool {
        self.model_status.is_some_and(ModelStatus::is_end)
    }

    /// Approximate in-memory footprint, used by memory retention.
    pub fn approx_bytes(&self) -> usize {
        let fields = self
            .structured_fields
            .as_ref()
            .and_then(|f| serde_json::to_string(f).ok())
            .map_or(0, |s| s.len());
        self.sender.len() + self.content.len() + fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_type_parse() {
        assert_eq!("plugin".parse::<ToolType>().unwrap(), ToolType::Plugin);
        assert_eq!("interpreter".parse::<ToolType>().unwrap(), ToolType::Interpreter);
        let err = "browser".parse::<ToolType>().unwrap_err();
        assert_eq!(err.to_string(), "unknown tool type: browser");
    }

    #[test]
    fn empty_tool_type_is_absent() {
        let fields = StructuredFields::new().with_tool_type("");
        assert_eq!(fields.tool_type(), None);
        let fields = StructuredFields::new().with_tool_type("plugin");
        assert_eq!(fields.tool_type(), Some("plugin"));
    }

    #[test]
    fn fields_flatten_next_to_tool_type() {
        let fields = StructuredFields::new()
            .with_tool_type("plugin")
            .with("thought", "search first");
        let json = serde_json::to_value(&fields).unwrap();
        assert_eq!(json["tool_type"], "plugin");
        assert_eq!(json["thought"], "search first");

        let parsed: StructuredFields = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, fields);
    }

    #[test]
    fn event_requested_tool() {
        let sid = SessionId::from_raw("s1");
        let plain = Event::new("agent", "hello", sid.clone());
        assert_eq!(plain.requested_tool(), None);

        let tool = Event::new("agent", "call", sid)
            .with_fields(StructuredFields::new().with_tool_type("interpreter"));
        assert_eq!(tool.requested_tool(), Some("interpreter"));
    }

    #[test]
    fn event_serializes_status_as_code() {
        let evt = Event::user("hi", SessionId::from_raw("s1")).with_status(StatusCode::StreamIng);
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["status"], 1);
        assert_eq!(json["sender"], "user");
        assert!(json.get("model_status").is_none());
        assert!(json.get("structured_fields").is_none());
    }

    #[test]
    fn generation_end_flag() {
        let sid = SessionId::from_raw("s1");
        let evt = Event::new("agent", "x", sid.clone()).with_model_status(ModelStatus::End);
        assert!(evt.is_generation_end());
        assert!(!Event::new("agent", "x", sid).is_generation_end());
    }

    #[test]
    fn approx_bytes_counts_fields() {
        let sid = SessionId::from_raw("s1");
        let bare = Event::new("a", "abc", sid.clone());
        assert_eq!(bare.approx_bytes(), 4);
        let with = bare.clone().with_fields(StructuredFields::new().with("k", "v"));
        assert!(with.approx_bytes() > bare.approx_bytes());
    }
}
