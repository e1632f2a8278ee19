//! In-memory state store for tests and dry runs.
//!
//! Same contract as the SQLite backend, backed by a mutex-guarded map.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::records::{
    ArtifactRecord, EventRecord, PerformanceRecord, RunRecord, RunStatistics, StepStateRecord,
};
use crate::store::{Result, StateError, StateStore};
use wave_core::RunStatus;

#[derive(Debug, Default)]
struct Inner {
    runs: BTreeMap<String, RunRecord>,
    steps: Vec<StepStateRecord>,
    events: Vec<EventRecord>,
    metrics: Vec<PerformanceRecord>,
    artifacts: Vec<ArtifactRecord>,
    next_event_id: i64,
    next_metric_id: i64,
}

/// In-memory implementation of [`StateStore`].
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| StateError::Task(e.to_string()))
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn create_run(&self, run: &RunRecord) -> Result<()> {
        self.lock()?.runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &RunRecord) -> Result<()> {
        let mut inner = self.lock()?;
        if !inner.runs.contains_key(&run.run_id) {
            return Err(StateError::RunNotFound(run.run_id.clone()));
        }
        inner.runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        Ok(self.lock()?.runs.get(run_id).cloned())
    }

    async fn recent_runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        let inner = self.lock()?;
        let mut runs: Vec<RunRecord> = inner.runs.values().cloned().collect();
        runs.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn last_run_for_pipeline(&self, pipeline_name: &str) -> Result<Option<RunRecord>> {
        let runs = self.recent_runs(u32::MAX).await?;
        Ok(runs.into_iter().find(|r| r.pipeline_name == pipeline_name))
    }

    async fn upsert_step(&self, step: &StepStateRecord) -> Result<()> {
        let mut inner = self.lock()?;
        match inner
            .steps
            .iter_mut()
            .find(|s| s.run_id == step.run_id && s.step_id == step.step_id)
        {
            Some(existing) => *existing = step.clone(),
            None => inner.steps.push(step.clone()),
        }
        Ok(())
    }

    async fn get_step(&self, run_id: &str, step_id: &str) -> Result<Option<StepStateRecord>> {
        Ok(self
            .lock()?
            .steps
            .iter()
            .find(|s| s.run_id == run_id && s.step_id == step_id)
            .cloned())
    }

    async fn steps_for_run(&self, run_id: &str) -> Result<Vec<StepStateRecord>> {
        Ok(self
            .lock()?
            .steps
            .iter()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn append_event(&self, event: &EventRecord) -> Result<i64> {
        let mut inner = self.lock()?;
        inner.next_event_id += 1;
        let id = inner.next_event_id;
        let mut event = event.clone();
        event.id = Some(id);
        inner.events.push(event);
        Ok(id)
    }

    async fn events_for_run(&self, run_id: &str) -> Result<Vec<EventRecord>> {
        Ok(self
            .lock()?
            .events
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn record_performance(&self, perf: &PerformanceRecord) -> Result<i64> {
        let mut inner = self.lock()?;
        inner.next_metric_id += 1;
        let id = inner.next_metric_id;
        let mut perf = perf.clone();
        perf.id = Some(id);
        inner.metrics.push(perf);
        Ok(id)
    }

    async fn performance_for_run(&self, run_id: &str) -> Result<Vec<PerformanceRecord>> {
        Ok(self
            .lock()?
            .metrics
            .iter()
            .filter(|m| m.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn record_artifact(&self, artifact: &ArtifactRecord) -> Result<()> {
        let mut inner = self.lock()?;
        match inner.artifacts.iter_mut().find(|a| {
            a.run_id == artifact.run_id && a.step_id == artifact.step_id && a.name == artifact.name
        }) {
            Some(existing) => *existing = artifact.clone(),
            None => inner.artifacts.push(artifact.clone()),
        }
        Ok(())
    }

    async fn artifacts_for_run(
        &self,
        run_id: &str,
        step_id: Option<&str>,
    ) -> Result<Vec<ArtifactRecord>> {
        Ok(self
            .lock()?
            .artifacts
            .iter()
            .filter(|a| a.run_id == run_id && step_id.is_none_or(|s| a.step_id == s))
            .cloned()
            .collect())
    }

    async fn run_statistics(&self, pipeline_name: Option<&str>) -> Result<RunStatistics> {
        let inner = self.lock()?;
        let mut stats = RunStatistics::default();
        for run in inner
            .runs
            .values()
            .filter(|r| pipeline_name.is_none_or(|p| r.pipeline_name == p))
        {
            stats.total_runs += 1;
            stats.total_tokens += run.total_tokens;
            match run.status {
                RunStatus::Completed => stats.completed += 1,
                RunStatus::Failed => stats.failed += 1,
                RunStatus::Cancelled => stats.cancelled += 1,
                RunStatus::Pending | RunStatus::Running => {}
            }
        }
        Ok(stats)
    }

    async fn delete_run(&self, run_id: &str) -> Result<()> {
        let mut inner = self.lock()?;
        inner.runs.remove(run_id);
        inner.steps.retain(|s| s.run_id != run_id);
        inner.events.retain(|e| e.run_id != run_id);
        inner.metrics.retain(|m| m.run_id != run_id);
        inner.artifacts.retain(|a| a.run_id != run_id);
        Ok(())
    }
}
