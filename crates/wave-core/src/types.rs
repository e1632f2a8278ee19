//! Pipeline, step, persona and contract definitions.
//!
//! These are the typed structures the executor consumes. Manifest parsing
//! (TOML on disk) deserializes directly into them; the executor never sees
//! raw manifest text.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// A validated pipeline: a name and an ordered set of steps forming a DAG.
///
/// Immutable for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Optional JSON schema the run input must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<String>,

    /// Steps in declaration order. Declaration order breaks scheduling ties.
    pub steps: Vec<Step>,

    /// When true, the first step failure cancels all pending and running
    /// peers instead of only skipping downstream steps.
    #[serde(default)]
    pub fail_fast: bool,
}

impl Pipeline {
    /// Look up a step by id.
    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

/// One node in the pipeline DAG: a single persona invocation on one workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the pipeline.
    pub step_id: String,

    /// Name of the persona that executes this step.
    pub persona: String,

    /// Step ids that must complete before this step becomes ready.
    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub workspace: WorkspaceSpec,

    #[serde(default)]
    pub memory: MemoryStrategy,

    /// Artifacts copied in from upstream steps before execution.
    #[serde(default)]
    pub inject: Vec<InjectedArtifact>,

    /// Artifacts this step declares as outputs.
    #[serde(default)]
    pub outputs: Vec<ArtifactDef>,

    pub exec: ExecConfig,

    /// Handover contract evaluated against the step's result content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<Contract>,
}

/// Workspace materialization spec for a step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceSpec {
    /// Directories copied into the workspace before execution.
    #[serde(default)]
    pub mounts: Vec<Mount>,
}

/// A copy-based mount: `source` is copied (never symlinked) into the
/// workspace under `target` (or the source's basename when absent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub source: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Restrictive permissions are stamped on the materialized copy.
    #[serde(default)]
    pub readonly: bool,
}

/// Whether a step starts from a clean context or receives injected artifacts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStrategy {
    #[default]
    Fresh,
    Injected,
}

/// Reference to an artifact produced by an upstream step, copied into this
/// step's `artifacts/` directory under the `as` name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectedArtifact {
    pub from_step: String,
    pub artifact: String,
    #[serde(rename = "as")]
    pub as_name: String,
}

/// A declared output artifact: a file the step is expected to leave at
/// `path` (relative to its workspace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDef {
    pub name: String,

    /// Path relative to the step workspace.
    pub path: String,

    /// Content-type hint (e.g. "markdown", "json").
    #[serde(default, rename = "type")]
    pub content_type: String,

    /// Required artifacts that are missing after a successful exit fail the
    /// step with an artifact-missing error.
    #[serde(default)]
    pub required: bool,
}

/// Execution configuration for a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Prompt template. `{{input}}` and `{{artifact:<name>}}` placeholders
    /// are resolved at dispatch time.
    pub prompt: String,

    /// Wall-clock deadline for the adapter invocation.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Expected shape of the result content.
    #[serde(default)]
    pub output_format: OutputFormat,
}

fn default_timeout_secs() -> u64 {
    600
}

/// Declared shape of a step's result content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Markdown,
    Yaml,
}

/// Handover contract: a declarative check applied to the step's output,
/// plus the retry policy when the check fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    #[serde(flatten)]
    pub kind: ContractKind,

    /// When true, exhausting retries fails the step. When false, the step
    /// completes with a recorded contract warning.
    #[serde(default = "default_true")]
    pub must_pass: bool,

    #[serde(default)]
    pub max_retries: u32,
}

fn default_true() -> bool {
    true
}

/// The closed set of contract kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContractKind {
    /// Parse the result content as JSON and validate it against a schema,
    /// given inline or loaded from `schema_path`.
    JsonSchema {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema_path: Option<PathBuf>,
    },
    /// Run a shell command in the step workspace (or `dir`); exit 0 passes.
    Command {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dir: Option<String>,
    },
    /// Lightweight structural check on the declared format.
    Format { format: OutputFormat },
}

/// A named bundle of adapter, model, prompt and policy, referenced by steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,

    /// Adapter identifier (e.g. "claude-code", "process", "mock").
    pub adapter: String,

    /// Agent binary path override. Required for the process adapter;
    /// CLI adapters fall back to their default binary on PATH.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// System prompt text, or a file to load it from. Text wins when both
    /// are set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_path: Option<PathBuf>,

    /// Tool patterns the persona may use. Empty means permissive.
    #[serde(default)]
    pub allowed_tools: Vec<String>,

    /// Tool patterns denied regardless of the allow list.
    #[serde(default)]
    pub denied_tools: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxPolicy>,

    /// Host environment variable names forwarded to the child.
    #[serde(default)]
    pub env_passthrough: Vec<String>,

    /// Skill command files copied into the agent's command directory.
    #[serde(default)]
    pub skills: Vec<PathBuf>,

    /// Cap on concurrent sub-agents the agent may spawn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_subagents: Option<u32>,
}

/// Sandbox policy consumed from the manifest. The core does not implement
/// OS isolation; it emits this record into the agent settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxPolicy {
    pub enabled: bool,

    /// Network domains the sandboxed agent may reach.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
}

/// A parsed manifest: one pipeline plus the personas its steps reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub pipeline: Pipeline,

    #[serde(default)]
    pub personas: Vec<Persona>,
}

impl Manifest {
    /// Personas indexed by name. Later duplicates win, matching manifest
    /// override order.
    pub fn personas_by_name(&self) -> HashMap<&str, &Persona> {
        self.personas
            .iter()
            .map(|p| (p.name.as_str(), p))
            .collect()
    }
}
