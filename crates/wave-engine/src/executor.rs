//! DAG execution.
//!
//! The executor is the single owner of the run's state map. Each tick it
//! computes the ready set (pending steps whose dependencies all completed),
//! dispatches up to the parallelism limit into a `JoinSet`, and reacts to
//! terminations. Record writes go through the state store from this one
//! task; event append flows through a dedicated logger task fed by an
//! unbounded channel, which keeps per-step event order intact and run
//! timestamps monotonic.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use wave_adapter::{Adapter, AdapterRunConfig, curated_env};
use wave_contract::{ContractOutcome, RetryDecision};
use wave_core::error::{FailureReason, StepError};
use wave_core::stream::{StreamEvent, StreamEventKind};
use wave_core::types::{Contract, Manifest, Persona, Step};
use wave_core::{RunStatus, StepState};
use wave_permission::PermissionPolicy;
use wave_state::{
    ArtifactRecord, EventRecord, PerformanceRecord, RunRecord, StateError, StateStore,
    StepStateRecord,
};
use wave_workspace::{WorkspaceConfig, WorkspaceError, WorkspaceManager};

use crate::prompt;
use crate::validate::{ValidatedPipeline, ValidationError, validate};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("run input rejected by pipeline input schema: {0}")]
    InputRejected(String),

    #[error(transparent)]
    Contract(#[from] wave_contract::ContractError),

    #[error("run '{0}' not found")]
    RunNotFound(String),

    #[error("run '{run_id}' belongs to pipeline '{expected}', not '{actual}'")]
    PipelineMismatch {
        run_id: String,
        expected: String,
        actual: String,
    },
}

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum concurrently running steps.
    pub max_parallel: usize,

    /// Project root: the boundary mounts must stay within.
    pub project_root: PathBuf,

    pub workspace: WorkspaceConfig,

    /// Remove the pipeline's workspaces after a completed run.
    pub cleanup_workspaces: bool,
}

impl ExecutorConfig {
    pub fn new(project_root: impl Into<PathBuf>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            max_parallel: 1,
            project_root: project_root.into(),
            workspace: WorkspaceConfig::new(workspace_root),
            cleanup_workspaces: false,
        }
    }
}

/// Final view of a run handed back to the caller.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub total_tokens: u64,
    pub steps: Vec<StepStateRecord>,
}

/// Owns the DAG execution state machine.
pub struct Executor {
    store: Arc<dyn StateStore>,
    workspaces: WorkspaceManager,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(store: Arc<dyn StateStore>, config: ExecutorConfig) -> Self {
        let workspaces = WorkspaceManager::new(config.workspace.clone());
        Self {
            store,
            workspaces,
            config,
        }
    }

    /// Execute a fresh run of the manifest.
    pub async fn run(
        &self,
        manifest: Manifest,
        input: &str,
        tags: BTreeMap<String, String>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let validated = validate(manifest)?;
        self.check_input_schema(&validated, input).await?;

        let run_id = wave_core::new_run_id();
        let mut run = RunRecord::new(&run_id, &validated.manifest.pipeline.name, input);
        run.tags = tags;
        self.store.create_run(&run).await?;

        let mut states = HashMap::new();
        let mut retries = HashMap::new();
        for step in &validated.manifest.pipeline.steps {
            self.store
                .upsert_step(&StepStateRecord::new(&run_id, &step.step_id))
                .await?;
            states.insert(step.step_id.clone(), StepState::Pending);
            retries.insert(step.step_id.clone(), 0u32);
        }

        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        self.store.update_run(&run).await?;
        info!(run_id = %run_id, pipeline = %run.pipeline_name, "run started");

        self.drive(&validated, run, states, retries, input, cancel)
            .await
    }

    /// Resume a persisted non-terminal run. Terminal runs are a no-op:
    /// their persisted outcome is returned unchanged.
    pub async fn resume(
        &self,
        run_id: &str,
        manifest: Manifest,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let mut run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;

        if run.status.is_terminal() {
            let steps = self.store.steps_for_run(run_id).await?;
            return Ok(RunOutcome {
                run_id: run_id.to_string(),
                status: run.status,
                total_tokens: run.total_tokens,
                steps,
            });
        }

        if manifest.pipeline.name != run.pipeline_name {
            return Err(EngineError::PipelineMismatch {
                run_id: run_id.to_string(),
                expected: run.pipeline_name.clone(),
                actual: manifest.pipeline.name.clone(),
            });
        }
        let validated = validate(manifest)?;

        let persisted = self.store.steps_for_run(run_id).await?;
        let mut states = HashMap::new();
        let mut retries = HashMap::new();
        for step in &validated.manifest.pipeline.steps {
            let record = persisted.iter().find(|s| s.step_id == step.step_id);
            let (state, retry_count) = match record {
                // The child did not survive the crash: run it again.
                Some(r) if r.state == StepState::Running => {
                    let mut reset = r.clone();
                    reset.state = StepState::Pending;
                    reset.started_at = None;
                    self.store.upsert_step(&reset).await?;
                    (StepState::Pending, r.retry_count)
                }
                Some(r) => (r.state, r.retry_count),
                None => {
                    self.store
                        .upsert_step(&StepStateRecord::new(run_id, &step.step_id))
                        .await?;
                    (StepState::Pending, 0)
                }
            };
            states.insert(step.step_id.clone(), state);
            retries.insert(step.step_id.clone(), retry_count);
        }

        let input = run.input.clone();
        run.status = RunStatus::Running;
        self.store.update_run(&run).await?;
        info!(run_id = %run_id, "run resumed");

        self.drive(&validated, run, states, retries, &input, cancel)
            .await
    }

    async fn check_input_schema(
        &self,
        validated: &ValidatedPipeline,
        input: &str,
    ) -> Result<(), EngineError> {
        let Some(schema) = &validated.manifest.pipeline.input_schema else {
            return Ok(());
        };
        let contract = Contract {
            kind: wave_core::types::ContractKind::JsonSchema {
                schema: Some(schema.clone()),
                schema_path: None,
            },
            must_pass: true,
            max_retries: 0,
        };
        let outcome = wave_contract::evaluate(
            &contract,
            input,
            &self.config.project_root,
            &HashMap::new(),
        )
        .await?;
        match outcome {
            ContractOutcome::Passed => Ok(()),
            ContractOutcome::Failed { diagnostic } => Err(EngineError::InputRejected(diagnostic)),
        }
    }

    /// The run loop. Single owner of `states`; all record writes happen
    /// here or in the logger task.
    async fn drive(
        &self,
        validated: &ValidatedPipeline,
        mut run: RunRecord,
        mut states: HashMap<String, StepState>,
        mut retries: HashMap<String, u32>,
        input: &str,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let run_id = run.run_id.clone();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let logger = tokio::spawn(event_logger(
            Arc::clone(&self.store),
            run_id.clone(),
            events_rx,
        ));
        let _ = events_tx.send(EngineEvent::RunState {
            state: "running".to_string(),
            message: format!("pipeline '{}' started", run.pipeline_name),
        });

        // Internal abort: fired by fail-fast as well as by the caller's
        // cancellation. Run status reflects only the caller's token.
        let abort = cancel.child_token();
        let mut join_set: JoinSet<StepTermination> = JoinSet::new();
        let mut abort_noted = false;
        let mut first_failure: Option<String> = None;

        loop {
            if !abort.is_cancelled() {
                for step_id in ready_steps(validated, &states) {
                    if join_set.len() >= self.config.max_parallel.max(1) {
                        break;
                    }
                    self.dispatch(
                        validated,
                        &mut run,
                        &mut states,
                        &retries,
                        &step_id,
                        input,
                        &events_tx,
                        &abort,
                        &mut join_set,
                    )
                    .await?;
                }
            } else if !abort_noted {
                abort_noted = true;
                for step in &validated.manifest.pipeline.steps {
                    if states.get(&step.step_id) == Some(&StepState::Pending) {
                        self.mark_terminal(
                            &run_id,
                            &step.step_id,
                            StepState::Cancelled,
                            retries[&step.step_id],
                            Some("cancelled before start".to_string()),
                            &events_tx,
                        )
                        .await?;
                        states.insert(step.step_id.clone(), StepState::Cancelled);
                    }
                }
            }

            let Some(joined) = join_set.join_next().await else {
                if abort.is_cancelled() && !abort_noted {
                    // Abort fired after the last dispatch check; sweep
                    // pending steps before finishing.
                    continue;
                }
                break;
            };

            let termination = match joined {
                Ok(t) => t,
                Err(join_error) => {
                    error!(error = %join_error, "step task panicked");
                    continue;
                }
            };
            self.handle_termination(
                validated,
                &mut run,
                &mut states,
                &mut retries,
                termination,
                &abort,
                &mut first_failure,
                &events_tx,
            )
            .await?;
        }

        // Unreachable pending steps (a failed run being resumed, or peers
        // of a failure without fail-fast) are skipped.
        for step in &validated.manifest.pipeline.steps {
            if states.get(&step.step_id) == Some(&StepState::Pending) {
                self.mark_terminal(
                    &run_id,
                    &step.step_id,
                    StepState::Skipped,
                    retries[&step.step_id],
                    Some("unreachable: an upstream step did not complete".to_string()),
                    &events_tx,
                )
                .await?;
                states.insert(step.step_id.clone(), StepState::Skipped);
            }
        }

        let status = if cancel.is_cancelled() {
            RunStatus::Cancelled
        } else if states.values().any(|s| *s == StepState::Failed) {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };

        run.status = status;
        run.current_step = None;
        match status {
            RunStatus::Cancelled => run.cancelled_at = Some(Utc::now()),
            _ => run.completed_at = Some(Utc::now()),
        }
        if status == RunStatus::Failed {
            run.error_message = first_failure.clone();
        }

        let _ = events_tx.send(EngineEvent::RunState {
            state: status.to_string(),
            message: match &first_failure {
                Some(message) if status == RunStatus::Failed => {
                    format!("pipeline '{}' failed: {message}", run.pipeline_name)
                }
                _ => format!("pipeline '{}' {status}", run.pipeline_name),
            },
        });
        drop(events_tx);
        let _ = logger.await;

        self.store.update_run(&run).await?;
        info!(run_id = %run_id, status = %status, tokens = run.total_tokens, "run finished");

        if self.config.cleanup_workspaces && status == RunStatus::Completed {
            if let Err(e) = self.workspaces.cleanup_pipeline(&run.pipeline_name) {
                warn!(error = %e, "post-run workspace cleanup failed");
            }
        }

        Ok(RunOutcome {
            run_id: run_id.clone(),
            status,
            total_tokens: run.total_tokens,
            steps: self.store.steps_for_run(&run_id).await?,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        validated: &ValidatedPipeline,
        run: &mut RunRecord,
        states: &mut HashMap<String, StepState>,
        retries: &HashMap<String, u32>,
        step_id: &str,
        input: &str,
        events_tx: &mpsc::UnboundedSender<EngineEvent>,
        abort: &CancellationToken,
        join_set: &mut JoinSet<StepTermination>,
    ) -> Result<(), EngineError> {
        let step = validated
            .manifest
            .pipeline
            .step(step_id)
            .expect("ready step exists")
            .clone();
        let persona = validated
            .manifest
            .personas_by_name()
            .get(step.persona.as_str())
            .copied()
            .expect("persona resolved at validation")
            .clone();
        let adapter = validated.adapters[&persona.name].clone();
        // Snapshot: the policy in force for this execution, immune to any
        // later persona mutation.
        let policy = validated.policies[&persona.name].clone();

        let workspace_path = self
            .workspaces
            .workspace_path(&run.pipeline_name, step_id)
            .display()
            .to_string();

        states.insert(step_id.to_string(), StepState::Running);
        let mut record = StepStateRecord::new(&run.run_id, step_id);
        record.state = StepState::Running;
        record.retry_count = retries[step_id];
        record.started_at = Some(Utc::now());
        record.workspace_path = Some(workspace_path);
        self.store.upsert_step(&record).await?;

        run.current_step = Some(step_id.to_string());
        self.store.update_run(run).await?;

        let _ = events_tx.send(EngineEvent::StepStarted {
            step_id: step_id.to_string(),
            persona: persona.name.clone(),
        });
        debug!(step_id, persona = %persona.name, "step dispatched");

        let job = StepJob {
            run_id: run.run_id.clone(),
            pipeline_name: run.pipeline_name.clone(),
            step,
            persona,
            adapter,
            policy,
            retry_count: retries[step_id],
            input: input.to_string(),
            project_root: self.config.project_root.clone(),
            workspaces: self.workspaces.clone(),
            store: Arc::clone(&self.store),
            events: events_tx.clone(),
            cancel: abort.clone(),
        };
        join_set.spawn(execute_step(job));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_termination(
        &self,
        validated: &ValidatedPipeline,
        run: &mut RunRecord,
        states: &mut HashMap<String, StepState>,
        retries: &mut HashMap<String, u32>,
        termination: StepTermination,
        abort: &CancellationToken,
        first_failure: &mut Option<String>,
        events_tx: &mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<(), EngineError> {
        let step_id = termination.step_id.clone();
        retries.insert(step_id.clone(), termination.retry_count);

        let (state, error_message, tokens, success) = match &termination.outcome {
            StepOutcome::Completed { tokens, .. } => (StepState::Completed, None, *tokens, true),
            StepOutcome::Failed { error } => (
                StepState::Failed,
                Some(error.persisted_message()),
                error.tokens_used,
                false,
            ),
            StepOutcome::Cancelled { tokens } => (
                StepState::Cancelled,
                Some("cancelled".to_string()),
                *tokens,
                false,
            ),
        };

        states.insert(step_id.clone(), state);
        let mut record = StepStateRecord::new(&run.run_id, &step_id);
        record.state = state;
        record.retry_count = termination.retry_count;
        record.started_at = Some(termination.started_at);
        record.completed_at = Some(Utc::now());
        record.workspace_path = Some(
            self.workspaces
                .workspace_path(&run.pipeline_name, &step_id)
                .display()
                .to_string(),
        );
        record.error_message = error_message.clone();
        self.store.upsert_step(&record).await?;

        let (files_modified, artifacts_generated) = match &termination.outcome {
            StepOutcome::Completed {
                files_modified,
                artifacts_generated,
                ..
            } => (*files_modified, *artifacts_generated),
            _ => (0, 0),
        };
        self.store
            .record_performance(&PerformanceRecord {
                id: None,
                run_id: run.run_id.clone(),
                step_id: step_id.clone(),
                pipeline_name: run.pipeline_name.clone(),
                persona: termination.persona.clone(),
                started_at: Some(termination.started_at),
                completed_at: Some(Utc::now()),
                duration_ms: termination.duration_ms,
                tokens_used: tokens,
                files_modified,
                artifacts_generated,
                memory_bytes: 0,
                success,
                error_message,
            })
            .await?;

        run.total_tokens = run.total_tokens.saturating_add(tokens);
        self.store.update_run(run).await?;

        if state == StepState::Failed {
            if first_failure.is_none() {
                if let StepOutcome::Failed { error } = &termination.outcome {
                    *first_failure = Some(format!("step '{step_id}': {error}"));
                }
            }
            if validated.manifest.pipeline.fail_fast {
                info!(step_id = %step_id, "fail-fast: cancelling peers");
                abort.cancel();
            } else {
                self.skip_downstream(validated, run, states, retries, &step_id, events_tx)
                    .await?;
            }
        }

        debug!(step_id = %step_id, state = %state, tokens, "step terminated");
        Ok(())
    }

    /// Mark every transitive dependent of `failed_step` as skipped.
    async fn skip_downstream(
        &self,
        validated: &ValidatedPipeline,
        run: &RunRecord,
        states: &mut HashMap<String, StepState>,
        retries: &HashMap<String, u32>,
        failed_step: &str,
        events_tx: &mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<(), EngineError> {
        let mut frontier = vec![failed_step.to_string()];
        while let Some(current) = frontier.pop() {
            for step in &validated.manifest.pipeline.steps {
                if !step.depends_on.contains(&current) {
                    continue;
                }
                if states.get(&step.step_id) == Some(&StepState::Pending) {
                    states.insert(step.step_id.clone(), StepState::Skipped);
                    self.mark_terminal(
                        &run.run_id,
                        &step.step_id,
                        StepState::Skipped,
                        retries[&step.step_id],
                        Some(format!("skipped: upstream step '{current}' failed")),
                        events_tx,
                    )
                    .await?;
                    frontier.push(step.step_id.clone());
                }
            }
        }
        Ok(())
    }

    async fn mark_terminal(
        &self,
        run_id: &str,
        step_id: &str,
        state: StepState,
        retry_count: u32,
        message: Option<String>,
        events_tx: &mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<(), EngineError> {
        let mut record = StepStateRecord::new(run_id, step_id);
        record.state = state;
        record.retry_count = retry_count;
        record.completed_at = Some(Utc::now());
        record.error_message = message.clone();
        self.store.upsert_step(&record).await?;

        let _ = events_tx.send(EngineEvent::StepFinished {
            step_id: step_id.to_string(),
            persona: String::new(),
            state,
            message: message.unwrap_or_else(|| state.to_string()),
            duration_ms: 0,
            tokens: 0,
        });
        Ok(())
    }
}

/// Pending steps whose dependencies have all completed, in dispatch order.
fn ready_steps(validated: &ValidatedPipeline, states: &HashMap<String, StepState>) -> Vec<String> {
    let mut ready: Vec<&String> = validated
        .manifest
        .pipeline
        .steps
        .iter()
        .filter(|step| states.get(&step.step_id) == Some(&StepState::Pending))
        .filter(|step| {
            step.depends_on
                .iter()
                .all(|dep| states.get(dep) == Some(&StepState::Completed))
        })
        .map(|step| &step.step_id)
        .collect();
    ready.sort_by_key(|id| validated.rank(id));
    ready.into_iter().cloned().collect()
}

// ── Step execution task ─────────────────────────────────────────────

struct StepJob {
    run_id: String,
    pipeline_name: String,
    step: Step,
    persona: Persona,
    adapter: Adapter,
    policy: PermissionPolicy,
    retry_count: u32,
    input: String,
    project_root: PathBuf,
    workspaces: WorkspaceManager,
    store: Arc<dyn StateStore>,
    events: mpsc::UnboundedSender<EngineEvent>,
    cancel: CancellationToken,
}

enum StepOutcome {
    Completed {
        tokens: u64,
        files_modified: u32,
        artifacts_generated: u32,
    },
    Failed {
        error: StepError,
    },
    Cancelled {
        tokens: u64,
    },
}

struct StepTermination {
    step_id: String,
    persona: String,
    outcome: StepOutcome,
    retry_count: u32,
    started_at: chrono::DateTime<Utc>,
    duration_ms: u64,
}

async fn execute_step(job: StepJob) -> StepTermination {
    let started_at = Utc::now();
    let timer = std::time::Instant::now();
    let (outcome, retry_count) = run_step_inner(&job).await;

    let duration_ms = timer.elapsed().as_millis() as u64;
    let (state, message, tokens) = match &outcome {
        StepOutcome::Completed { tokens, .. } => {
            (StepState::Completed, "completed".to_string(), *tokens)
        }
        StepOutcome::Failed { error } => (StepState::Failed, error.persisted_message(), error.tokens_used),
        StepOutcome::Cancelled { tokens } => (StepState::Cancelled, "cancelled".to_string(), *tokens),
    };
    let _ = job.events.send(EngineEvent::StepFinished {
        step_id: job.step.step_id.clone(),
        persona: job.persona.name.clone(),
        state,
        message,
        duration_ms,
        tokens,
    });

    StepTermination {
        step_id: job.step.step_id.clone(),
        persona: job.persona.name.clone(),
        outcome,
        retry_count,
        started_at,
        duration_ms,
    }
}

async fn run_step_inner(job: &StepJob) -> (StepOutcome, u32) {
    let mut retry_count = job.retry_count;

    // Workspace materialization and artifact injection happen once; only
    // the adapter invocation participates in retries.
    let workspace = match prepare_workspace(job).await {
        Ok(path) => path,
        Err(error) => return (StepOutcome::Failed { error }, retry_count),
    };

    let injected: HashMap<String, String> = job
        .step
        .inject
        .iter()
        .map(|i| (i.as_name.clone(), format!("artifacts/{}", i.as_name)))
        .collect();
    let base_prompt = prompt::render(&job.step.exec.prompt, &job.input, &injected);

    let config = match build_adapter_config(job, &workspace, &base_prompt) {
        Ok(config) => config,
        Err(error) => return (StepOutcome::Failed { error }, retry_count),
    };
    if let Err(error) = job.adapter.preflight(&config).await {
        return (StepOutcome::Failed { error }, retry_count);
    }

    let mut attempt_prompt = base_prompt.clone();
    loop {
        let mut attempt_config = config.clone();
        attempt_config.prompt = attempt_prompt.clone();

        let failure: StepError = match job.adapter.run(&attempt_config, &job.cancel).await {
            Ok(result) => {
                if let Some(warning) = &result.format_warning {
                    job.send_warning(warning.clone());
                }
                match &result.failure {
                    Some(reason) => {
                        let mut error = StepError::new(
                            *reason,
                            format!(
                                "agent reported {}",
                                result
                                    .subtype
                                    .as_ref()
                                    .map(|s| s.as_str().to_string())
                                    .unwrap_or_else(|| reason.to_string())
                            ),
                        )
                        .with_tokens(result.tokens_used);
                        if let Some(subtype) = &result.subtype {
                            error = error.with_subtype(subtype.as_str());
                        }
                        error
                    }
                    None => match finish_attempt(job, &workspace, &result, retry_count).await {
                        AttemptEnd::Done(outcome) => return (outcome, retry_count),
                        AttemptEnd::RetryWith(diagnostic) => {
                            retry_count += 1;
                            job.send_warning(format!(
                                "contract failed (attempt {retry_count}): {diagnostic}"
                            ));
                            attempt_prompt = prompt::enrich_with_failure(&base_prompt, &diagnostic);
                            continue;
                        }
                    },
                }
            }
            Err(error) if error.reason == FailureReason::Cancelled => {
                return (
                    StepOutcome::Cancelled {
                        tokens: error.tokens_used,
                    },
                    retry_count,
                );
            }
            Err(error) => error,
        };

        // Adapter-level failure: the contract's retry budget also governs
        // re-invocation after transient failures.
        if let Some(contract) = &job.step.contract {
            if wave_contract::decide(contract, retry_count) == RetryDecision::Retry {
                retry_count += 1;
                job.send_warning(format!(
                    "adapter failed (attempt {retry_count}): {}",
                    failure.message
                ));
                attempt_prompt = prompt::enrich_with_failure(&base_prompt, &failure.message);
                continue;
            }
        }
        return (StepOutcome::Failed { error: failure }, retry_count);
    }
}

enum AttemptEnd {
    Done(StepOutcome),
    RetryWith(String),
}

/// Contract evaluation and artifact collection for a clean adapter exit.
async fn finish_attempt(
    job: &StepJob,
    workspace: &std::path::Path,
    result: &wave_adapter::AdapterResult,
    retry_count: u32,
) -> AttemptEnd {
    let content = result.result_content.as_deref().unwrap_or("");

    if let Some(contract) = &job.step.contract {
        let env = curated_env(&job.persona.env_passthrough, &HashMap::new());
        match wave_contract::evaluate(contract, content, workspace, &env).await {
            Ok(ContractOutcome::Passed) => {}
            Ok(ContractOutcome::Failed { diagnostic }) => {
                return match wave_contract::decide(contract, retry_count) {
                    RetryDecision::Retry => AttemptEnd::RetryWith(diagnostic),
                    RetryDecision::FailStep => AttemptEnd::Done(StepOutcome::Failed {
                        error: StepError::new(
                            FailureReason::GeneralError,
                            format!("contract failed after {retry_count} retries: {diagnostic}"),
                        )
                        .with_tokens(result.tokens_used),
                    }),
                    RetryDecision::CompleteWithWarning => {
                        job.send_warning(format!("contract warning: {diagnostic}"));
                        complete(job, workspace, result).await
                    }
                };
            }
            Err(e) => {
                return AttemptEnd::Done(StepOutcome::Failed {
                    error: StepError::new(
                        FailureReason::GeneralError,
                        format!("contract evaluation error: {e}"),
                    )
                    .with_tokens(result.tokens_used),
                });
            }
        }
    }

    complete(job, workspace, result).await
}

/// Collect declared outputs, persist artifact records, build the final
/// outcome. A missing required artifact fails the step even after exit 0.
async fn complete(
    job: &StepJob,
    workspace: &std::path::Path,
    result: &wave_adapter::AdapterResult,
) -> AttemptEnd {
    let collected = match job.workspaces.collect_outputs(workspace, &job.step.outputs) {
        Ok(collected) => collected,
        Err(e) => {
            return AttemptEnd::Done(StepOutcome::Failed {
                error: StepError::new(FailureReason::GeneralError, e.to_string())
                    .with_tokens(result.tokens_used),
            });
        }
    };

    let mut artifacts_generated = 0u32;
    for artifact in collected.iter().filter(|a| a.exists) {
        artifacts_generated += 1;
        let record = ArtifactRecord {
            run_id: job.run_id.clone(),
            step_id: job.step.step_id.clone(),
            name: artifact.name.clone(),
            path: artifact.path.display().to_string(),
            content_type: artifact.content_type.clone(),
            size: artifact.size,
        };
        if let Err(e) = job.store.record_artifact(&record).await {
            warn!(error = %e, artifact = %artifact.name, "failed to persist artifact record");
        }
    }

    AttemptEnd::Done(StepOutcome::Completed {
        tokens: result.tokens_used,
        files_modified: result.files_modified.len() as u32,
        artifacts_generated,
    })
}

/// Materialize the workspace and inject upstream artifacts.
async fn prepare_workspace(job: &StepJob) -> Result<PathBuf, StepError> {
    let report = job
        .workspaces
        .create(
            &job.pipeline_name,
            &job.step.step_id,
            &job.step.workspace.mounts,
            &job.project_root,
        )
        .map_err(workspace_error)?;

    for skipped in &report.skipped_files {
        job.send_warning(format!(
            "file '{}' exceeds the copy cap ({} bytes); skipped",
            skipped.path.display(),
            skipped.size
        ));
    }

    for injection in &job.step.inject {
        let produced = job
            .store
            .artifacts_for_run(&job.run_id, Some(&injection.from_step))
            .await
            .map_err(|e| StepError::new(FailureReason::GeneralError, e.to_string()))?;
        let source = produced
            .iter()
            .find(|a| a.name == injection.artifact)
            .map(|a| PathBuf::from(&a.path))
            .ok_or_else(|| {
                StepError::new(
                    FailureReason::GeneralError,
                    format!(
                        "artifact '{}' from step '{}' was never recorded",
                        injection.artifact, injection.from_step
                    ),
                )
            })?;
        job.workspaces
            .inject_artifact(
                &report.path,
                &injection.from_step,
                &injection.artifact,
                &injection.as_name,
                &source,
            )
            .map_err(workspace_error)?;
    }

    Ok(report.path)
}

fn workspace_error(e: WorkspaceError) -> StepError {
    StepError::new(FailureReason::GeneralError, e.to_string())
}

fn build_adapter_config(
    job: &StepJob,
    workspace: &std::path::Path,
    prompt_text: &str,
) -> Result<AdapterRunConfig, StepError> {
    let system_prompt = match (&job.persona.system_prompt, &job.persona.system_prompt_path) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => std::fs::read_to_string(path).map_err(|e| {
            StepError::new(
                FailureReason::GeneralError,
                format!("failed to read system prompt '{}': {e}", path.display()),
            )
        })?,
        (None, None) => String::new(),
    };

    let overrides = HashMap::from([
        ("WAVE_RUN_ID".to_string(), job.run_id.clone()),
        ("WAVE_STEP_ID".to_string(), job.step.step_id.clone()),
    ]);

    let mut config = AdapterRunConfig::new(&job.persona.name, workspace, prompt_text);
    config.timeout = Duration::from_secs(job.step.exec.timeout_secs);
    config.env = curated_env(&job.persona.env_passthrough, &overrides);
    config.model = job.persona.model.clone();
    config.temperature = job.persona.temperature;
    config.system_prompt = system_prompt;
    config.contract_section = job.step.contract.as_ref().map(prompt::contract_section);
    config.allowed_tools = job.persona.allowed_tools.clone();
    config.denied_tools = job.persona.denied_tools.clone();
    config.output_format = job.step.exec.output_format;
    config.sandbox = job.persona.sandbox.clone();
    config.skills = job.persona.skills.clone();
    config.max_subagents = job.persona.max_subagents;
    config.binary = job.persona.binary.clone();

    // Stream observer: forward every event to the run log, and audit
    // tool invocations against the step's fixed permission policy.
    let events = job.events.clone();
    let step_id = job.step.step_id.clone();
    let persona = job.persona.name.clone();
    let policy = job.policy.clone();
    config.on_event = Some(Arc::new(move |event: &StreamEvent| {
        if event.kind == StreamEventKind::ToolUse {
            if let Some(tool) = &event.tool_name {
                let argument = event.tool_input.as_deref().unwrap_or("");
                if let Err(denied) = policy.check(&persona, tool, argument) {
                    let _ = events.send(EngineEvent::Warning {
                        step_id: step_id.clone(),
                        persona: persona.clone(),
                        message: denied.to_string(),
                    });
                }
            }
        }
        let _ = events.send(EngineEvent::Stream {
            step_id: step_id.clone(),
            persona: persona.clone(),
            event: event.clone(),
        });
    }));

    Ok(config)
}

impl StepJob {
    fn send_warning(&self, message: String) {
        let _ = self.events.send(EngineEvent::Warning {
            step_id: self.step.step_id.clone(),
            persona: self.persona.name.clone(),
            message,
        });
    }
}

// ── Event logger ────────────────────────────────────────────────────

/// Events flowing from the run loop and step tasks to the persisted log.
enum EngineEvent {
    RunState {
        state: String,
        message: String,
    },
    StepStarted {
        step_id: String,
        persona: String,
    },
    Stream {
        step_id: String,
        persona: String,
        event: StreamEvent,
    },
    Warning {
        step_id: String,
        persona: String,
        message: String,
    },
    StepFinished {
        step_id: String,
        persona: String,
        state: StepState,
        message: String,
        duration_ms: u64,
        tokens: u64,
    },
}

/// Single consumer of the event channel. Timestamps are assigned here, at
/// dequeue, which makes them monotonic per run even with parallel steps.
async fn event_logger(
    store: Arc<dyn StateStore>,
    run_id: String,
    mut rx: mpsc::UnboundedReceiver<EngineEvent>,
) {
    let mut last_tokens: HashMap<String, u64> = HashMap::new();

    while let Some(event) = rx.recv().await {
        let record = match event {
            EngineEvent::RunState { state, message } => EventRecord {
                id: None,
                run_id: run_id.clone(),
                timestamp: Utc::now(),
                step_id: None,
                state,
                persona: None,
                message,
                tokens_used: 0,
                duration_ms: None,
            },
            EngineEvent::StepStarted { step_id, persona } => EventRecord {
                id: None,
                run_id: run_id.clone(),
                timestamp: Utc::now(),
                step_id: Some(step_id),
                state: "step_started".to_string(),
                persona: Some(persona),
                message: "step started".to_string(),
                tokens_used: 0,
                duration_ms: None,
            },
            EngineEvent::Stream {
                step_id,
                persona,
                event,
            } => {
                let Some((state, message)) = stream_entry(&event) else {
                    continue;
                };
                let total = event.tokens_total();
                let previous = last_tokens.insert(step_id.clone(), total).unwrap_or(0);
                EventRecord {
                    id: None,
                    run_id: run_id.clone(),
                    timestamp: Utc::now(),
                    step_id: Some(step_id),
                    state,
                    persona: Some(persona),
                    message,
                    tokens_used: total.saturating_sub(previous),
                    duration_ms: None,
                }
            }
            EngineEvent::Warning {
                step_id,
                persona,
                message,
            } => EventRecord {
                id: None,
                run_id: run_id.clone(),
                timestamp: Utc::now(),
                step_id: Some(step_id),
                state: "warning".to_string(),
                persona: Some(persona),
                message,
                tokens_used: 0,
                duration_ms: None,
            },
            EngineEvent::StepFinished {
                step_id,
                persona,
                state,
                message,
                duration_ms,
                tokens,
            } => {
                let previous = last_tokens.get(&step_id).copied().unwrap_or(0);
                EventRecord {
                    id: None,
                    run_id: run_id.clone(),
                    timestamp: Utc::now(),
                    step_id: Some(step_id),
                    state: format!("step_{state}"),
                    persona: (!persona.is_empty()).then_some(persona),
                    message,
                    tokens_used: tokens.saturating_sub(previous),
                    duration_ms: Some(duration_ms),
                }
            }
        };

        if let Err(e) = store.append_event(&record).await {
            warn!(error = %e, "failed to append event");
        }
    }
}

/// Compact log entry for a stream event. System events are not persisted.
fn stream_entry(event: &StreamEvent) -> Option<(String, String)> {
    match event.kind {
        StreamEventKind::System | StreamEventKind::ToolResult => None,
        StreamEventKind::ToolUse => {
            let tool = event.tool_name.as_deref().unwrap_or("tool");
            let message = match &event.tool_input {
                Some(input) => format!("{tool}: {input}"),
                None => tool.to_string(),
            };
            Some(("tool_use".to_string(), message))
        }
        StreamEventKind::Text => Some((
            "text".to_string(),
            event.content.clone().unwrap_or_default(),
        )),
        StreamEventKind::Result => {
            let subtype = event
                .subtype
                .as_ref()
                .map(|s| s.as_str())
                .unwrap_or("unknown");
            Some(("result".to_string(), format!("result: {subtype}")))
        }
    }
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;
