//! Per-step workspace materialization.
//!
//! Each step executes in `<root>/<pipeline_id>/<step_id>/`: the declared
//! mounts are copied in (never symlinked), upstream artifacts land under
//! `artifacts/`, and declared outputs are collected from the tree after the
//! step finishes. The workspace path is stable for the step's run and
//! outlives it until explicit cleanup.

mod manager;

pub use manager::{
    MaterializeReport, OutputArtifact, SkippedFile, WorkspaceConfig, WorkspaceError,
    WorkspaceManager,
};
