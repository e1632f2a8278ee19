//! Command implementations.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use wave_core::RunStatus;
use wave_engine::{Executor, ExecutorConfig, RunOutcome};
use wave_state::StateStore;
use wave_workspace::{WorkspaceConfig, WorkspaceManager};

use crate::cli::parse_tags;
use crate::manifest;

fn executor(
    store: Arc<dyn StateStore>,
    parallel: usize,
    project_root: Option<PathBuf>,
    workspace_root: PathBuf,
    cleanup: bool,
) -> Result<Executor> {
    let project_root = match project_root {
        Some(root) => root,
        None => std::env::current_dir().context("failed to resolve current directory")?,
    };
    let mut config = ExecutorConfig::new(project_root, workspace_root);
    config.max_parallel = parallel;
    config.cleanup_workspaces = cleanup;
    Ok(Executor::new(store, config))
}

/// Cancellation token wired to Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling run");
            trigger.cancel();
        }
    });
    cancel
}

fn report(outcome: &RunOutcome) -> ExitCode {
    println!("run:    {}", outcome.run_id);
    println!("status: {}", outcome.status);
    println!("tokens: {}", outcome.total_tokens);
    for step in &outcome.steps {
        let note = step.error_message.as_deref().unwrap_or("");
        println!("  {:<24} {:<10} {}", step.step_id, step.state.to_string(), note);
    }
    if outcome.status == RunStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn run(
    store: Arc<dyn StateStore>,
    manifest_path: &Path,
    input: &str,
    raw_tags: &[String],
    parallel: usize,
    project_root: Option<PathBuf>,
    workspace_root: PathBuf,
    cleanup: bool,
) -> Result<ExitCode> {
    let manifest = manifest::load(manifest_path)?;
    let tags = parse_tags(raw_tags)?;
    let executor = executor(store, parallel, project_root, workspace_root, cleanup)?;

    let outcome = executor
        .run(manifest, input, tags, interrupt_token())
        .await?;
    Ok(report(&outcome))
}

pub async fn resume(
    store: Arc<dyn StateStore>,
    run_id: &str,
    manifest_path: &Path,
    parallel: usize,
    project_root: Option<PathBuf>,
    workspace_root: PathBuf,
) -> Result<ExitCode> {
    let manifest = manifest::load(manifest_path)?;
    let executor = executor(store, parallel, project_root, workspace_root, false)?;

    let outcome = executor
        .resume(run_id, manifest, interrupt_token())
        .await?;
    Ok(report(&outcome))
}

pub async fn status(
    store: Arc<dyn StateStore>,
    pipeline: Option<&str>,
    limit: u32,
) -> Result<ExitCode> {
    let stats = store.run_statistics(pipeline).await?;
    println!(
        "runs: {} (completed {}, failed {}, cancelled {}), tokens: {}",
        stats.total_runs, stats.completed, stats.failed, stats.cancelled, stats.total_tokens
    );

    let runs = store.recent_runs(limit).await?;
    for run in runs
        .iter()
        .filter(|r| pipeline.is_none_or(|p| r.pipeline_name == p))
    {
        let started = run
            .started_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<20} {:<10} {:>10} tokens  {}",
            run.run_id, run.pipeline_name, run.status.to_string(), run.total_tokens, started
        );
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn events(store: Arc<dyn StateStore>, run_id: &str) -> Result<ExitCode> {
    let events = store.events_for_run(run_id).await?;
    if events.is_empty() {
        println!("no events for run {run_id}");
        return Ok(ExitCode::SUCCESS);
    }
    for event in events {
        let step = event.step_id.as_deref().unwrap_or("-");
        let persona = event.persona.as_deref().unwrap_or("-");
        println!(
            "{}  {:<24} {:<14} {:<12} {}",
            event.timestamp.to_rfc3339(),
            step,
            event.state,
            persona,
            event.message
        );
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn cleanup(
    store: Arc<dyn StateStore>,
    older_than_days: i64,
    pipeline: Option<&str>,
    workspace_root: PathBuf,
) -> Result<ExitCode> {
    let cutoff = Utc::now() - chrono::Duration::days(older_than_days);
    let workspaces = WorkspaceManager::new(WorkspaceConfig::new(workspace_root));

    let runs = store.recent_runs(u32::MAX).await?;
    let mut pruned = 0usize;
    let mut pipelines: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();

    for run in runs {
        if !run.status.is_terminal() {
            continue;
        }
        if pipeline.is_some_and(|p| run.pipeline_name != p) {
            continue;
        }
        let ended = run.completed_at.or(run.cancelled_at).or(run.started_at);
        if ended.is_none_or(|t| t > cutoff) {
            continue;
        }
        store.delete_run(&run.run_id).await?;
        pipelines.insert(run.pipeline_name.clone());
        pruned += 1;
    }

    for pipeline in &pipelines {
        if let Err(e) = workspaces.cleanup_pipeline(pipeline) {
            warn!(pipeline = %pipeline, error = %e, "workspace cleanup failed");
        }
    }

    println!(
        "pruned {pruned} runs across {} pipelines",
        pipelines.len()
    );
    Ok(ExitCode::SUCCESS)
}
