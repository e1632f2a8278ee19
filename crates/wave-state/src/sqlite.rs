//! SQLite-backed state store.
//!
//! A single-file database behind `Arc<Mutex<Connection>>`; blocking calls
//! are bridged to async via `tokio::task::spawn_blocking`. WAL journal mode
//! and a busy timeout keep concurrent read-only views (the dashboard)
//! cheap while the executor holds the single writer.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::records::{
    ArtifactRecord, EventRecord, PerformanceRecord, RunRecord, RunStatistics, StepStateRecord,
};
use crate::store::{Result, StateError, StateStore};

/// SQLite implementation of [`StateStore`].
#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateStore {
    /// Open (or create) a database file and bootstrap the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path.as_ref())?)
    }

    /// Ephemeral in-process database; data is lost on drop.
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;\
             PRAGMA foreign_keys = ON;\
             PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a synchronous closure on the blocking thread pool with the
    /// connection locked.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|e| StateError::Task(e.to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StateError::Task(e.to_string()))?
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pipeline_run (
    run_id        TEXT PRIMARY KEY,
    pipeline_name TEXT NOT NULL,
    status        TEXT NOT NULL,
    input         TEXT NOT NULL,
    current_step  TEXT,
    total_tokens  INTEGER NOT NULL DEFAULT 0,
    started_at    TEXT,
    completed_at  TEXT,
    cancelled_at  TEXT,
    error_message TEXT,
    tags_json     TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_run_pipeline ON pipeline_run (pipeline_name);
CREATE INDEX IF NOT EXISTS idx_run_status   ON pipeline_run (status);
CREATE INDEX IF NOT EXISTS idx_run_started  ON pipeline_run (started_at);

CREATE TABLE IF NOT EXISTS step_state (
    run_id         TEXT NOT NULL,
    step_id        TEXT NOT NULL,
    state          TEXT NOT NULL,
    retry_count    INTEGER NOT NULL DEFAULT 0,
    started_at     TEXT,
    completed_at   TEXT,
    workspace_path TEXT,
    error_message  TEXT,
    PRIMARY KEY (run_id, step_id)
);
CREATE INDEX IF NOT EXISTS idx_step_id ON step_state (step_id);

CREATE TABLE IF NOT EXISTS event_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id      TEXT NOT NULL,
    timestamp   TEXT NOT NULL,
    step_id     TEXT,
    state       TEXT NOT NULL,
    persona     TEXT,
    message     TEXT NOT NULL,
    tokens_used INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER
);
CREATE INDEX IF NOT EXISTS idx_event_run ON event_log (run_id);

CREATE TABLE IF NOT EXISTS performance_metric (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id              TEXT NOT NULL,
    step_id             TEXT NOT NULL,
    pipeline_name       TEXT NOT NULL,
    persona             TEXT NOT NULL,
    started_at          TEXT,
    completed_at        TEXT,
    duration_ms         INTEGER NOT NULL DEFAULT 0,
    tokens_used         INTEGER NOT NULL DEFAULT 0,
    files_modified      INTEGER NOT NULL DEFAULT 0,
    artifacts_generated INTEGER NOT NULL DEFAULT 0,
    memory_bytes        INTEGER NOT NULL DEFAULT 0,
    success             INTEGER NOT NULL,
    error_message       TEXT
);
CREATE INDEX IF NOT EXISTS idx_perf_run ON performance_metric (run_id);

CREATE TABLE IF NOT EXISTS artifact (
    run_id  TEXT NOT NULL,
    step_id TEXT NOT NULL,
    name    TEXT NOT NULL,
    path    TEXT NOT NULL,
    type    TEXT NOT NULL DEFAULT '',
    size    INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (run_id, step_id, name)
);
";

// ── Column conversion helpers ───────────────────────────────────────

fn ts_to_sql(ts: &Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|t| t.to_rfc3339())
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, msg)),
    )
}

fn ts_from_sql(idx: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| conversion_error(idx, format!("bad timestamp '{s}': {e}")))
        })
        .transpose()
}

fn parse_label<T: std::str::FromStr<Err = String>>(idx: usize, s: String) -> rusqlite::Result<T> {
    s.parse().map_err(|e: String| conversion_error(idx, e))
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let tags_json: String = row.get(10)?;
    let tags = serde_json::from_str(&tags_json)
        .map_err(|e| conversion_error(10, format!("bad tags json: {e}")))?;
    Ok(RunRecord {
        run_id: row.get(0)?,
        pipeline_name: row.get(1)?,
        status: parse_label(2, row.get::<_, String>(2)?)?,
        input: row.get(3)?,
        current_step: row.get(4)?,
        total_tokens: row.get::<_, i64>(5)? as u64,
        started_at: ts_from_sql(6, row.get(6)?)?,
        completed_at: ts_from_sql(7, row.get(7)?)?,
        cancelled_at: ts_from_sql(8, row.get(8)?)?,
        error_message: row.get(9)?,
        tags,
    })
}

const RUN_COLUMNS: &str = "run_id, pipeline_name, status, input, current_step, total_tokens, \
                           started_at, completed_at, cancelled_at, error_message, tags_json";

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<StepStateRecord> {
    Ok(StepStateRecord {
        run_id: row.get(0)?,
        step_id: row.get(1)?,
        state: parse_label(2, row.get::<_, String>(2)?)?,
        retry_count: row.get::<_, i64>(3)? as u32,
        started_at: ts_from_sql(4, row.get(4)?)?,
        completed_at: ts_from_sql(5, row.get(5)?)?,
        workspace_path: row.get(6)?,
        error_message: row.get(7)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    Ok(EventRecord {
        id: Some(row.get(0)?),
        run_id: row.get(1)?,
        timestamp: ts_from_sql(2, row.get(2)?)?.ok_or_else(|| {
            conversion_error(2, "event timestamp missing".to_string())
        })?,
        step_id: row.get(3)?,
        state: row.get(4)?,
        persona: row.get(5)?,
        message: row.get(6)?,
        tokens_used: row.get::<_, i64>(7)? as u64,
        duration_ms: row.get::<_, Option<i64>>(8)?.map(|v| v as u64),
    })
}

fn perf_from_row(row: &Row<'_>) -> rusqlite::Result<PerformanceRecord> {
    Ok(PerformanceRecord {
        id: Some(row.get(0)?),
        run_id: row.get(1)?,
        step_id: row.get(2)?,
        pipeline_name: row.get(3)?,
        persona: row.get(4)?,
        started_at: ts_from_sql(5, row.get(5)?)?,
        completed_at: ts_from_sql(6, row.get(6)?)?,
        duration_ms: row.get::<_, i64>(7)? as u64,
        tokens_used: row.get::<_, i64>(8)? as u64,
        files_modified: row.get::<_, i64>(9)? as u32,
        artifacts_generated: row.get::<_, i64>(10)? as u32,
        memory_bytes: row.get::<_, i64>(11)? as u64,
        success: row.get(12)?,
        error_message: row.get(13)?,
    })
}

fn artifact_from_row(row: &Row<'_>) -> rusqlite::Result<ArtifactRecord> {
    Ok(ArtifactRecord {
        run_id: row.get(0)?,
        step_id: row.get(1)?,
        name: row.get(2)?,
        path: row.get(3)?,
        content_type: row.get(4)?,
        size: row.get::<_, i64>(5)? as u64,
    })
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn create_run(&self, run: &RunRecord) -> Result<()> {
        let run = run.clone();
        self.blocking(move |conn| {
            let tags_json = serde_json::to_string(&run.tags)?;
            conn.execute(
                "INSERT INTO pipeline_run (run_id, pipeline_name, status, input, current_step, \
                 total_tokens, started_at, completed_at, cancelled_at, error_message, tags_json) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    run.run_id,
                    run.pipeline_name,
                    run.status.to_string(),
                    run.input,
                    run.current_step,
                    run.total_tokens as i64,
                    ts_to_sql(&run.started_at),
                    ts_to_sql(&run.completed_at),
                    ts_to_sql(&run.cancelled_at),
                    run.error_message,
                    tags_json,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_run(&self, run: &RunRecord) -> Result<()> {
        let run = run.clone();
        self.blocking(move |conn| {
            let tags_json = serde_json::to_string(&run.tags)?;
            let affected = conn.execute(
                "UPDATE pipeline_run SET pipeline_name = ?2, status = ?3, input = ?4, \
                 current_step = ?5, total_tokens = ?6, started_at = ?7, completed_at = ?8, \
                 cancelled_at = ?9, error_message = ?10, tags_json = ?11 WHERE run_id = ?1",
                params![
                    run.run_id,
                    run.pipeline_name,
                    run.status.to_string(),
                    run.input,
                    run.current_step,
                    run.total_tokens as i64,
                    ts_to_sql(&run.started_at),
                    ts_to_sql(&run.completed_at),
                    ts_to_sql(&run.cancelled_at),
                    run.error_message,
                    tags_json,
                ],
            )?;
            if affected == 0 {
                return Err(StateError::RunNotFound(run.run_id.clone()));
            }
            Ok(())
        })
        .await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let run_id = run_id.to_string();
        self.blocking(move |conn| {
            let run = conn
                .query_row(
                    &format!("SELECT {RUN_COLUMNS} FROM pipeline_run WHERE run_id = ?1"),
                    params![run_id],
                    run_from_row,
                )
                .optional()?;
            Ok(run)
        })
        .await
    }

    async fn recent_runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM pipeline_run \
                 ORDER BY started_at IS NULL, started_at DESC, run_id DESC LIMIT ?1"
            ))?;
            let runs = stmt
                .query_map(params![limit], run_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(runs)
        })
        .await
    }

    async fn last_run_for_pipeline(&self, pipeline_name: &str) -> Result<Option<RunRecord>> {
        let pipeline_name = pipeline_name.to_string();
        self.blocking(move |conn| {
            let run = conn
                .query_row(
                    &format!(
                        "SELECT {RUN_COLUMNS} FROM pipeline_run WHERE pipeline_name = ?1 \
                         ORDER BY started_at IS NULL, started_at DESC, run_id DESC LIMIT 1"
                    ),
                    params![pipeline_name],
                    run_from_row,
                )
                .optional()?;
            Ok(run)
        })
        .await
    }

    async fn upsert_step(&self, step: &StepStateRecord) -> Result<()> {
        let step = step.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO step_state (run_id, step_id, state, retry_count, started_at, \
                 completed_at, workspace_path, error_message) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT (run_id, step_id) DO UPDATE SET state = ?3, retry_count = ?4, \
                 started_at = ?5, completed_at = ?6, workspace_path = ?7, error_message = ?8",
                params![
                    step.run_id,
                    step.step_id,
                    step.state.to_string(),
                    step.retry_count as i64,
                    ts_to_sql(&step.started_at),
                    ts_to_sql(&step.completed_at),
                    step.workspace_path,
                    step.error_message,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_step(&self, run_id: &str, step_id: &str) -> Result<Option<StepStateRecord>> {
        let run_id = run_id.to_string();
        let step_id = step_id.to_string();
        self.blocking(move |conn| {
            let step = conn
                .query_row(
                    "SELECT run_id, step_id, state, retry_count, started_at, completed_at, \
                     workspace_path, error_message FROM step_state \
                     WHERE run_id = ?1 AND step_id = ?2",
                    params![run_id, step_id],
                    step_from_row,
                )
                .optional()?;
            Ok(step)
        })
        .await
    }

    async fn steps_for_run(&self, run_id: &str) -> Result<Vec<StepStateRecord>> {
        let run_id = run_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT run_id, step_id, state, retry_count, started_at, completed_at, \
                 workspace_path, error_message FROM step_state WHERE run_id = ?1 ORDER BY rowid",
            )?;
            let steps = stmt
                .query_map(params![run_id], step_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(steps)
        })
        .await
    }

    async fn append_event(&self, event: &EventRecord) -> Result<i64> {
        let event = event.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO event_log (run_id, timestamp, step_id, state, persona, message, \
                 tokens_used, duration_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    event.run_id,
                    event.timestamp.to_rfc3339(),
                    event.step_id,
                    event.state,
                    event.persona,
                    event.message,
                    event.tokens_used as i64,
                    event.duration_ms.map(|v| v as i64),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn events_for_run(&self, run_id: &str) -> Result<Vec<EventRecord>> {
        let run_id = run_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, timestamp, step_id, state, persona, message, tokens_used, \
                 duration_ms FROM event_log WHERE run_id = ?1 ORDER BY id",
            )?;
            let events = stmt
                .query_map(params![run_id], event_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(events)
        })
        .await
    }

    async fn record_performance(&self, perf: &PerformanceRecord) -> Result<i64> {
        let perf = perf.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO performance_metric (run_id, step_id, pipeline_name, persona, \
                 started_at, completed_at, duration_ms, tokens_used, files_modified, \
                 artifacts_generated, memory_bytes, success, error_message) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    perf.run_id,
                    perf.step_id,
                    perf.pipeline_name,
                    perf.persona,
                    ts_to_sql(&perf.started_at),
                    ts_to_sql(&perf.completed_at),
                    perf.duration_ms as i64,
                    perf.tokens_used as i64,
                    perf.files_modified as i64,
                    perf.artifacts_generated as i64,
                    perf.memory_bytes as i64,
                    perf.success,
                    perf.error_message,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn performance_for_run(&self, run_id: &str) -> Result<Vec<PerformanceRecord>> {
        let run_id = run_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, step_id, pipeline_name, persona, started_at, completed_at, \
                 duration_ms, tokens_used, files_modified, artifacts_generated, memory_bytes, \
                 success, error_message FROM performance_metric WHERE run_id = ?1 ORDER BY id",
            )?;
            let metrics = stmt
                .query_map(params![run_id], perf_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(metrics)
        })
        .await
    }

    async fn record_artifact(&self, artifact: &ArtifactRecord) -> Result<()> {
        let artifact = artifact.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO artifact (run_id, step_id, name, path, type, size) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT (run_id, step_id, name) DO UPDATE SET path = ?4, type = ?5, size = ?6",
                params![
                    artifact.run_id,
                    artifact.step_id,
                    artifact.name,
                    artifact.path,
                    artifact.content_type,
                    artifact.size as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn artifacts_for_run(
        &self,
        run_id: &str,
        step_id: Option<&str>,
    ) -> Result<Vec<ArtifactRecord>> {
        let run_id = run_id.to_string();
        let step_id = step_id.map(|s| s.to_string());
        self.blocking(move |conn| {
            let artifacts = match step_id {
                Some(step_id) => {
                    let mut stmt = conn.prepare(
                        "SELECT run_id, step_id, name, path, type, size FROM artifact \
                         WHERE run_id = ?1 AND step_id = ?2 ORDER BY name",
                    )?;
                    let rows = stmt.query_map(params![run_id, step_id], artifact_from_row)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT run_id, step_id, name, path, type, size FROM artifact \
                         WHERE run_id = ?1 ORDER BY step_id, name",
                    )?;
                    let rows = stmt.query_map(params![run_id], artifact_from_row)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                }
            };
            Ok(artifacts)
        })
        .await
    }

    async fn run_statistics(&self, pipeline_name: Option<&str>) -> Result<RunStatistics> {
        let pipeline_name = pipeline_name.map(|s| s.to_string());
        self.blocking(move |conn| {
            let select = "SELECT COUNT(*), \
                 COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0), \
                 COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0), \
                 COALESCE(SUM(CASE WHEN status = 'cancelled' THEN 1 ELSE 0 END), 0), \
                 COALESCE(SUM(total_tokens), 0) FROM pipeline_run";
            let map = |row: &Row<'_>| {
                Ok(RunStatistics {
                    total_runs: row.get::<_, i64>(0)? as u64,
                    completed: row.get::<_, i64>(1)? as u64,
                    failed: row.get::<_, i64>(2)? as u64,
                    cancelled: row.get::<_, i64>(3)? as u64,
                    total_tokens: row.get::<_, i64>(4)? as u64,
                })
            };
            let stats = match pipeline_name {
                Some(name) => conn.query_row(
                    &format!("{select} WHERE pipeline_name = ?1"),
                    params![name],
                    map,
                )?,
                None => conn.query_row(select, [], map)?,
            };
            Ok(stats)
        })
        .await
    }

    async fn delete_run(&self, run_id: &str) -> Result<()> {
        let run_id = run_id.to_string();
        self.blocking(move |conn| {
            conn.execute("DELETE FROM artifact WHERE run_id = ?1", params![run_id])?;
            conn.execute(
                "DELETE FROM performance_metric WHERE run_id = ?1",
                params![run_id],
            )?;
            conn.execute("DELETE FROM event_log WHERE run_id = ?1", params![run_id])?;
            conn.execute("DELETE FROM step_state WHERE run_id = ?1", params![run_id])?;
            conn.execute(
                "DELETE FROM pipeline_run WHERE run_id = ?1",
                params![run_id],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
#[path = "sqlite_tests.rs"]
mod tests;
