use serde::{Deserialize, Serialize};

use crate::event::ToolType;

/// Coarse progress code attached to every event handed to a caller.
///
/// Serialized as its integer wire code. The tool chains are laid out so that
/// "+1" walks from "call in progress" to "call composed" to "result available":
///
/// ```text
/// PluginStart(3) -> PluginEnd(4) -> PluginReturn(5)
/// Coding(6)      -> CodeEnd(7)   -> CodeReturn(8)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum StatusCode {
    ServerErr,
    End,
    StreamIng,
    SessionReady,
    PluginStart,
    PluginEnd,
    PluginReturn,
    Coding,
    CodeEnd,
    CodeReturn,
}

impl StatusCode {
    pub fn code(self) -> i8 {
        match self {
            Self::ServerErr => -1,
            Self::End => 0,
            Self::StreamIng => 1,
            Self::SessionReady => 2,
            Self::PluginStart => 3,
            Self::PluginEnd => 4,
            Self::PluginReturn => 5,
            Self::Coding => 6,
            Self::CodeEnd => 7,
            Self::CodeReturn => 8,
        }
    }

    pub fn from_code(code: i8) -> Option<Self> {
        Some(match code {
            -1 => Self::ServerErr,
            0 => Self::End,
            1 => Self::StreamIng,
            2 => Self::SessionReady,
            3 => Self::PluginStart,
            4 => Self::PluginEnd,
            5 => Self::PluginReturn,
            6 => Self::Coding,
            7 => Self::CodeEnd,
            8 => Self::CodeReturn,
            _ => return None,
        })
    }

    /// The "+1" step. Only defined along the two tool chains.
    pub fn successor(self) -> Option<Self> {
        match self {
            Self::PluginStart => Some(Self::PluginEnd),
            Self::PluginEnd => Some(Self::PluginReturn),
            Self::Coding => Some(Self::CodeEnd),
            Self::CodeEnd => Some(Self::CodeReturn),
            _ => None,
        }
    }

    /// True while a tool call is still being generated.
    pub fn is_tool_in_progress(self) -> bool {
        matches!(self, Self::PluginStart | Self::Coding)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::End | Self::ServerErr)
    }

    /// In-progress code for a tool call of the given type.
    pub fn in_progress(tool_type: ToolType) -> Self {
        match tool_type {
            ToolType::Plugin => Self::PluginStart,
            ToolType::Interpreter => Self::Coding,
        }
    }

    /// Result-available code for a tool call of the given type.
    pub fn returned(tool_type: ToolType) -> Self {
        match tool_type {
            ToolType::Plugin => Self::PluginReturn,
            ToolType::Interpreter => Self::CodeReturn,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServerErr => "server_err",
            Self::End => "end",
            Self::StreamIng => "stream_ing",
            Self::SessionReady => "session_ready",
            Self::PluginStart => "plugin_start",
            Self::PluginEnd => "plugin_end",
            Self::PluginReturn => "plugin_return",
            Self::Coding => "coding",
            Self::CodeEnd => "code_end",
            Self::CodeReturn => "code_return",
        }
    }
}

impl From<StatusCode> for i8 {
    fn from(status: StatusCode) -> Self {
        status.code()
    }
}

impl TryFrom<i8> for StatusCode {
    type Error = String;

    fn try_from(code: i8) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| format!("unknown status code: {code}"))
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status reported by the model client for each chunk of a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    /// More text follows.
    Streaming,
    /// Generation for this call has ended; the chunk carries the full text.
    End,
}

impl ModelStatus {
    pub fn is_end(self) -> bool {
        matches!(self, Self::End)
    }
}
