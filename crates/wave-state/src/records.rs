//! Persisted record types.
//!
//! One struct per table; the executor owns all writes. Records round-trip
//! through serde unchanged, which the store tests rely on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use wave_core::{RunStatus, StepState};

/// Durable record of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub pipeline_name: String,
    pub status: RunStatus,

    /// The run input string, verbatim.
    pub input: String,

    /// Step currently executing (display only; parallel runs show one).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,

    /// Cumulative tokens across all steps.
    #[serde(default)]
    pub total_tokens: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Free-form operator tags, persisted as JSON.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl RunRecord {
    pub fn new(run_id: impl Into<String>, pipeline_name: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            pipeline_name: pipeline_name.into(),
            status: RunStatus::Pending,
            input: input.into(),
            current_step: None,
            total_tokens: 0,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            error_message: None,
            tags: BTreeMap::new(),
        }
    }
}

/// Durable state of one step within a run. Keyed by `(run_id, step_id)` so
/// workspace paths never collide across runs sharing a step id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStateRecord {
    pub run_id: String,
    pub step_id: String,
    pub state: StepState,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StepStateRecord {
    pub fn new(run_id: impl Into<String>, step_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            step_id: step_id.into(),
            state: StepState::Pending,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            workspace_path: None,
            error_message: None,
        }
    }
}

/// Append-only event log entry. Created only by the executor, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Assigned by the store on append; `None` before persistence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    pub run_id: String,
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,

    /// State label at the time of the event (e.g. "running", "tool_use").
    pub state: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,

    pub message: String,

    /// Token delta attributed to this event.
    #[serde(default)]
    pub tokens_used: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Per-step performance metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    pub run_id: String,
    pub step_id: String,
    pub pipeline_name: String,
    pub persona: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub duration_ms: u64,

    #[serde(default)]
    pub tokens_used: u64,

    #[serde(default)]
    pub files_modified: u32,

    #[serde(default)]
    pub artifacts_generated: u32,

    #[serde(default)]
    pub memory_bytes: u64,

    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// A produced artifact, immutable once its step completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub run_id: String,
    pub step_id: String,
    pub name: String,

    /// Absolute path within the step workspace.
    pub path: String,

    #[serde(default, rename = "type")]
    pub content_type: String,

    #[serde(default)]
    pub size: u64,
}

/// Aggregate statistics pushed down to the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub total_runs: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total_tokens: u64,
}
