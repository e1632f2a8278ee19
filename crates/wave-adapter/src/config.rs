//! Adapter invocation configuration and result.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use wave_core::stream::{ResultSubtype, StreamEvent};
use wave_core::types::{OutputFormat, SandboxPolicy};
use wave_core::FailureReason;

/// Observer invoked for each decoded stream event, serially per child.
pub type StreamCallback = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

/// Default deadline for agent CLI invocations.
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(600);

/// Default deadline for generic process runners.
pub const DEFAULT_PROCESS_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything an adapter needs to execute one step.
#[derive(Clone)]
pub struct AdapterRunConfig {
    /// Agent binary override; adapters fall back to their default binary.
    pub binary: Option<PathBuf>,

    /// Persona name, for settings, diagnostics and events.
    pub persona: String,

    /// Step workspace; the child's working directory.
    pub workspace: PathBuf,

    pub prompt: String,

    /// Persona system prompt (already loaded from file when applicable).
    pub system_prompt: String,

    /// Optional contract-compliance section appended to the system prompt.
    pub contract_section: Option<String>,

    pub timeout: Duration,

    /// Fully curated child environment. The child inherits nothing else.
    pub env: HashMap<String, String>,

    pub model: Option<String>,
    pub temperature: Option<f64>,

    pub allowed_tools: Vec<String>,
    pub denied_tools: Vec<String>,

    pub output_format: OutputFormat,

    pub sandbox: Option<SandboxPolicy>,

    /// Skill command files copied into the agent's command directory.
    pub skills: Vec<PathBuf>,

    pub max_subagents: Option<u32>,

    /// Stream observer. When absent, decoded events still feed token
    /// accounting and are dropped.
    pub on_event: Option<StreamCallback>,
}

impl AdapterRunConfig {
    pub fn new(persona: impl Into<String>, workspace: impl Into<PathBuf>, prompt: impl Into<String>) -> Self {
        Self {
            binary: None,
            persona: persona.into(),
            workspace: workspace.into(),
            prompt: prompt.into(),
            system_prompt: String::new(),
            contract_section: None,
            timeout: DEFAULT_AGENT_TIMEOUT,
            env: HashMap::new(),
            model: None,
            temperature: None,
            allowed_tools: Vec::new(),
            denied_tools: Vec::new(),
            output_format: OutputFormat::Text,
            sandbox: None,
            skills: Vec::new(),
            max_subagents: None,
            on_event: None,
        }
    }

    pub(crate) fn emit(&self, event: &StreamEvent) {
        if let Some(cb) = &self.on_event {
            cb(event);
        }
    }
}

impl std::fmt::Debug for AdapterRunConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRunConfig")
            .field("binary", &self.binary)
            .field("persona", &self.persona)
            .field("workspace", &self.workspace)
            .field("timeout", &self.timeout)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("output_format", &self.output_format)
            .field("sandbox", &self.sandbox)
            .field("has_callback", &self.on_event.is_some())
            .finish_non_exhaustive()
    }
}

/// Outcome of a successfully exited adapter invocation.
#[derive(Debug, Clone)]
pub struct AdapterResult {
    pub exit_code: i32,

    /// Full buffered stdout.
    pub stdout: String,

    /// Cumulative tokens: `input + output + cache_creation` from the final
    /// result record, or the running turn totals when none was emitted.
    pub tokens_used: u64,

    /// Extracted result content from the final `result` record.
    pub result_content: Option<String>,

    pub subtype: Option<ResultSubtype>,

    /// Files the agent wrote or edited, parsed from the stream.
    pub files_modified: Vec<String>,

    /// Set when the child exited zero but its declared subtype indicates a
    /// failure (e.g. `error_max_turns`).
    pub failure: Option<FailureReason>,

    /// Set when declared-JSON output could not be parsed and a fallback
    /// document (template or error report) was synthesized instead.
    pub format_warning: Option<String>,
}
