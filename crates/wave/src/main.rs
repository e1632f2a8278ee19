//! `wave` — multi-agent pipeline orchestrator CLI.

mod cli;
mod commands;
mod logging;
mod manifest;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use wave_state::{SqliteStateStore, StateStore};

use crate::cli::{Cli, Commands};

fn state_dir() -> PathBuf {
    std::env::var("WAVE_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".local/state/wave")
        })
}

/// Workspace root: explicit flag, then `WAVE_WORKSPACE_ROOT`, then the
/// state directory.
fn workspace_root(flag: Option<PathBuf>, state_dir: &std::path::Path) -> PathBuf {
    flag.or_else(|| std::env::var("WAVE_WORKSPACE_ROOT").ok().map(PathBuf::from))
        .unwrap_or_else(|| state_dir.join("workspaces"))
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    let state_dir = state_dir();
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("failed to create state dir '{}'", state_dir.display()))?;
    let _log_guard = logging::init(&state_dir, cli.log_file);

    let db_path = cli
        .state_db
        .clone()
        .unwrap_or_else(|| state_dir.join("wave.db"));
    let store: Arc<dyn StateStore> = Arc::new(
        SqliteStateStore::open(&db_path)
            .with_context(|| format!("failed to open state db '{}'", db_path.display()))?,
    );

    match cli.command {
        Commands::Run {
            manifest,
            input,
            tags,
            parallel,
            project_root,
            workspace_root: ws_flag,
            cleanup,
        } => {
            commands::run(
                store,
                &manifest,
                &input,
                &tags,
                parallel,
                project_root,
                workspace_root(ws_flag, &state_dir),
                cleanup,
            )
            .await
        }
        Commands::Resume {
            run_id,
            manifest,
            parallel,
            project_root,
            workspace_root: ws_flag,
        } => {
            commands::resume(
                store,
                &run_id,
                &manifest,
                parallel,
                project_root,
                workspace_root(ws_flag, &state_dir),
            )
            .await
        }
        Commands::Status { pipeline, limit } => {
            commands::status(store, pipeline.as_deref(), limit).await
        }
        Commands::Events { run_id } => commands::events(store, &run_id).await,
        Commands::Cleanup {
            older_than_days,
            pipeline,
            workspace_root: ws_flag,
        } => {
            commands::cleanup(
                store,
                older_than_days,
                pipeline.as_deref(),
                workspace_root(ws_flag, &state_dir),
            )
            .await
        }
    }
}
