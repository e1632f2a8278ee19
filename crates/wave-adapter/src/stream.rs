//! NDJSON stream decoding.
//!
//! The child writes newline-delimited JSON records on stdout. Each line is
//! decoded by its `type` field; unknown shapes are ignored. `tool_result`
//! records are decoded but suppressed — the preceding `tool_use` already
//! described the action.

use serde::Deserialize;
use serde_json::Value;
use tracing::trace;
use wave_core::stream::{ResultSubtype, StreamEvent, StreamEventKind};

/// Generous line cap: a single minified tool result can run to megabytes.
pub const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

/// Assistant text is summarized to this many characters in events.
const TEXT_PREVIEW_CHARS: usize = 200;

/// Bash commands are summarized to this many characters.
const COMMAND_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    // cache_read_input_tokens is deliberately ignored: it re-counts the
    // same cached context on every turn and is already represented once
    // through cache_creation_input_tokens.
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Vec<WireBlock>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    Text {
        text: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireRecord {
    System {},
    Assistant {
        message: WireMessage,
    },
    ToolResult {},
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    #[serde(other)]
    Unknown,
}

/// Stateful decoder for one child's stdout stream.
///
/// Token accounting: the last assistant turn's `input_tokens` replaces the
/// running input count (turn usage includes the full conversation history,
/// so summing would overcount), while `output_tokens` accumulate. The final
/// `result` usage, when present, is authoritative:
/// `input + output + cache_creation`.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    tokens_in: u64,
    tokens_out: u64,
    final_tokens: Option<u64>,
    result_content: Option<String>,
    subtype: Option<ResultSubtype>,
    files_modified: Vec<String>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one line into zero or more events.
    pub fn decode_line(&mut self, line: &str) -> Vec<StreamEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        let record: WireRecord = match serde_json::from_str(trimmed) {
            Ok(record) => record,
            Err(e) => {
                trace!(error = %e, "ignoring non-record stdout line");
                return Vec::new();
            }
        };

        match record {
            WireRecord::System {} => vec![self.event(StreamEventKind::System)],
            WireRecord::Assistant { message } => self.decode_assistant(message),
            // Suppressed: the prior tool_use already described the action.
            WireRecord::ToolResult {} => Vec::new(),
            WireRecord::Result {
                subtype,
                result,
                usage,
            } => self.decode_result(subtype, result, usage),
            WireRecord::Unknown => Vec::new(),
        }
    }

    fn decode_assistant(&mut self, message: WireMessage) -> Vec<StreamEvent> {
        if let Some(usage) = &message.usage {
            // Replace, don't sum: each turn reports the whole history.
            self.tokens_in = usage.input_tokens;
            self.tokens_out = self.tokens_out.saturating_add(usage.output_tokens);
        }

        let mut events = Vec::new();
        for block in message.content {
            match block {
                WireBlock::ToolUse { name, input } => {
                    if let Some(path) = modified_file(&name, &input) {
                        if !self.files_modified.contains(&path) {
                            self.files_modified.push(path);
                        }
                    }
                    let mut event = self.event(StreamEventKind::ToolUse);
                    event.tool_input = summarize_tool_input(&name, &input);
                    event.tool_name = Some(name);
                    events.push(event);
                }
                WireBlock::Text { text } => {
                    let mut event = self.event(StreamEventKind::Text);
                    event.content = Some(truncate_chars(&text, TEXT_PREVIEW_CHARS));
                    events.push(event);
                }
                WireBlock::Unknown => {}
            }
        }
        events
    }

    fn decode_result(
        &mut self,
        subtype: Option<String>,
        result: Option<String>,
        usage: Option<WireUsage>,
    ) -> Vec<StreamEvent> {
        if let Some(usage) = usage {
            self.final_tokens = Some(
                usage
                    .input_tokens
                    .saturating_add(usage.output_tokens)
                    .saturating_add(usage.cache_creation_input_tokens),
            );
        }
        self.subtype = subtype.as_deref().map(ResultSubtype::from_wire);
        self.result_content = result;

        let mut event = self.event(StreamEventKind::Result);
        event.subtype = self.subtype.clone();
        event.content = self.result_content.clone();
        vec![event]
    }

    fn event(&self, kind: StreamEventKind) -> StreamEvent {
        StreamEvent {
            kind,
            tool_name: None,
            tool_input: None,
            content: None,
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
            subtype: None,
        }
    }

    /// Best current total: the final result usage when seen, otherwise the
    /// running turn totals.
    pub fn tokens_total(&self) -> u64 {
        self.final_tokens
            .unwrap_or_else(|| self.tokens_in.saturating_add(self.tokens_out))
    }

    pub fn result_content(&self) -> Option<&str> {
        self.result_content.as_deref()
    }

    pub fn subtype(&self) -> Option<&ResultSubtype> {
        self.subtype.as_ref()
    }

    pub fn take_files_modified(&mut self) -> Vec<String> {
        std::mem::take(&mut self.files_modified)
    }

    /// Whether a final result record was decoded.
    pub fn saw_result(&self) -> bool {
        self.final_tokens.is_some() || self.result_content.is_some() || self.subtype.is_some()
    }
}

/// Pick the most relevant input field for a tool invocation.
fn summarize_tool_input(tool: &str, input: &Value) -> Option<String> {
    let field = |key: &str| input.get(key).and_then(Value::as_str).map(String::from);
    match tool {
        "Read" | "Write" | "Edit" => field("file_path"),
        "Glob" | "Grep" => field("pattern"),
        "Bash" => field("command").map(|c| truncate_chars(&c, COMMAND_PREVIEW_CHARS)),
        "Task" => field("description"),
        "WebFetch" => field("url"),
        "WebSearch" => field("query"),
        "NotebookEdit" => field("notebook_path"),
        "TodoWrite" => summarize_todos(input),
        _ => None,
    }
}

/// The in-progress task's text, or an "N/M tasks" count.
fn summarize_todos(input: &Value) -> Option<String> {
    let todos = input.get("todos")?.as_array()?;
    if let Some(current) = todos.iter().find(|t| {
        t.get("status").and_then(Value::as_str) == Some("in_progress")
    }) {
        if let Some(content) = current.get("content").and_then(Value::as_str) {
            return Some(content.to_string());
        }
    }
    let completed = todos
        .iter()
        .filter(|t| t.get("status").and_then(Value::as_str) == Some("completed"))
        .count();
    Some(format!("{completed}/{} tasks", todos.len()))
}

/// File path for tools that modify the workspace.
fn modified_file(tool: &str, input: &Value) -> Option<String> {
    let key = match tool {
        "Write" | "Edit" => "file_path",
        "NotebookEdit" => "notebook_path",
        _ => return None,
    };
    input.get(key).and_then(Value::as_str).map(String::from)
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().nth(max).is_none() {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
#[path = "stream_tests.rs"]
mod tests;
