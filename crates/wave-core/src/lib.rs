//! Core data model shared by every wave crate.
//!
//! Pipelines, steps, personas, contracts and artifacts are the static shape
//! of a run; [`status`] holds the run/step state machines; [`stream`] holds
//! the decoded agent stream events; [`error`] holds the failure taxonomy.

pub mod error;
pub mod status;
pub mod stream;
pub mod types;

pub use error::{FailureReason, StepError};
pub use status::{RunStatus, StepState};
pub use stream::{ResultSubtype, StreamEvent, StreamEventKind};
pub use types::{
    ArtifactDef, Contract, ContractKind, ExecConfig, InjectedArtifact, Manifest, MemoryStrategy,
    Mount, OutputFormat, Persona, Pipeline, SandboxPolicy, Step, WorkspaceSpec,
};

/// Generate a new run identifier (ULID, 26 chars Crockford Base32).
pub fn new_run_id() -> String {
    ulid::Ulid::new().to_string()
}
