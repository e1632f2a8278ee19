//! The record-oriented store contract.
//!
//! The executor depends only on this trait; the backing persistence is a
//! single-file SQLite database in production and an in-memory map in tests.

use async_trait::async_trait;

use crate::records::{
    ArtifactRecord, EventRecord, PerformanceRecord, RunRecord, RunStatistics, StepStateRecord,
};

/// Store-level failure.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("blocking task failed: {0}")]
    Task(String),

    #[error("run '{0}' not found")]
    RunNotFound(String),
}

pub type Result<T> = std::result::Result<T, StateError>;

/// Durable record store for runs, steps, events, artifacts and metrics.
///
/// Writes are serialized by the backend; readers observe a consistent
/// snapshot. Event append preserves insertion order per run.
#[async_trait]
pub trait StateStore: Send + Sync {
    // ── Runs ────────────────────────────────────────────────────────

    async fn create_run(&self, run: &RunRecord) -> Result<()>;

    /// Overwrite the run row. The run must exist.
    async fn update_run(&self, run: &RunRecord) -> Result<()>;

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>>;

    /// Most recent runs first (by started_at, then run_id).
    async fn recent_runs(&self, limit: u32) -> Result<Vec<RunRecord>>;

    async fn last_run_for_pipeline(&self, pipeline_name: &str) -> Result<Option<RunRecord>>;

    // ── Steps ───────────────────────────────────────────────────────

    /// Insert or replace the `(run_id, step_id)` row.
    async fn upsert_step(&self, step: &StepStateRecord) -> Result<()>;

    async fn get_step(&self, run_id: &str, step_id: &str) -> Result<Option<StepStateRecord>>;

    /// All step rows for a run, in insertion order.
    async fn steps_for_run(&self, run_id: &str) -> Result<Vec<StepStateRecord>>;

    // ── Events ──────────────────────────────────────────────────────

    /// Append one event; returns the assigned id.
    async fn append_event(&self, event: &EventRecord) -> Result<i64>;

    async fn events_for_run(&self, run_id: &str) -> Result<Vec<EventRecord>>;

    // ── Metrics & artifacts ─────────────────────────────────────────

    async fn record_performance(&self, perf: &PerformanceRecord) -> Result<i64>;

    async fn performance_for_run(&self, run_id: &str) -> Result<Vec<PerformanceRecord>>;

    async fn record_artifact(&self, artifact: &ArtifactRecord) -> Result<()>;

    /// Artifacts for a run, optionally narrowed to one step.
    async fn artifacts_for_run(
        &self,
        run_id: &str,
        step_id: Option<&str>,
    ) -> Result<Vec<ArtifactRecord>>;

    // ── Aggregates & cleanup ────────────────────────────────────────

    /// Statistics across runs, optionally narrowed to one pipeline.
    async fn run_statistics(&self, pipeline_name: Option<&str>) -> Result<RunStatistics>;

    /// Remove the run and every dependent row (steps, events, metrics,
    /// artifacts). Used by workspace cleanup.
    async fn delete_run(&self, run_id: &str) -> Result<()>;
}
