//! Decoded stream events.
//!
//! The adapter runner parses the child's NDJSON stdout into [`StreamEvent`]
//! values; the executor forwards them to its event log and token accounting.

use serde::{Deserialize, Serialize};

/// Discriminant of a decoded stream record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    System,
    ToolUse,
    ToolResult,
    Text,
    Result,
}

/// One decoded record from the child's NDJSON stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub kind: StreamEventKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    /// Most relevant input field for the tool (file path, pattern, command…),
    /// truncated for display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Cumulative input-side tokens at the time of this event.
    #[serde(default)]
    pub tokens_in: u64,

    /// Cumulative output tokens at the time of this event.
    #[serde(default)]
    pub tokens_out: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<ResultSubtype>,
}

impl StreamEvent {
    pub fn tokens_total(&self) -> u64 {
        self.tokens_in.saturating_add(self.tokens_out)
    }
}

/// Subtype of a final `result` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSubtype {
    Success,
    ErrorMaxTurns,
    ErrorDuringExecution,
    #[serde(untagged)]
    Other(String),
}

impl ResultSubtype {
    /// Map the wire string to a subtype. Unknown strings are preserved.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "error_max_turns" => Self::ErrorMaxTurns,
            "error_during_execution" => Self::ErrorDuringExecution,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Success)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Success => "success",
            Self::ErrorMaxTurns => "error_max_turns",
            Self::ErrorDuringExecution => "error_during_execution",
            Self::Other(s) => s,
        }
    }
}
