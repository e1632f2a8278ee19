//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "wave", about = "Multi-agent pipeline orchestrator", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// State database path. Defaults to `$WAVE_STATE_DIR/wave.db`, falling
    /// back to `~/.local/state/wave/wave.db`.
    #[arg(long, global = true)]
    pub state_db: Option<PathBuf>,

    /// Also write logs to a file under the state directory.
    #[arg(long, global = true)]
    pub log_file: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute a pipeline manifest.
    Run {
        /// Path to the TOML manifest.
        manifest: PathBuf,

        /// Run input, forwarded to prompt templates as `{{input}}`.
        #[arg(long, default_value = "")]
        input: String,

        /// Free-form run tags, `key=value`. Repeatable.
        #[arg(long = "tag", value_name = "KEY=VALUE")]
        tags: Vec<String>,

        /// Maximum concurrently running steps.
        #[arg(long, default_value_t = 1)]
        parallel: usize,

        /// Project root that mounts must stay within. Defaults to the
        /// current directory.
        #[arg(long)]
        project_root: Option<PathBuf>,

        /// Workspace root override. Falls back to `WAVE_WORKSPACE_ROOT`,
        /// then to the state directory.
        #[arg(long)]
        workspace_root: Option<PathBuf>,

        /// Remove workspaces after a completed run.
        #[arg(long)]
        cleanup: bool,
    },

    /// Resume a persisted non-terminal run.
    Resume {
        run_id: String,

        /// Path to the TOML manifest of the same pipeline.
        manifest: PathBuf,

        #[arg(long, default_value_t = 1)]
        parallel: usize,

        #[arg(long)]
        project_root: Option<PathBuf>,

        #[arg(long)]
        workspace_root: Option<PathBuf>,
    },

    /// Show recent runs and aggregate statistics.
    Status {
        /// Narrow to one pipeline.
        #[arg(long)]
        pipeline: Option<String>,

        #[arg(long, default_value_t = 10)]
        limit: u32,
    },

    /// Print the persisted event log for a run.
    Events { run_id: String },

    /// Remove workspaces and state for old terminal runs.
    Cleanup {
        /// Only prune runs older than this many days.
        #[arg(long, default_value_t = 7)]
        older_than_days: i64,

        /// Narrow to one pipeline.
        #[arg(long)]
        pipeline: Option<String>,

        #[arg(long)]
        workspace_root: Option<PathBuf>,
    },
}

/// Parse repeated `key=value` tag arguments.
pub fn parse_tags(raw: &[String]) -> anyhow::Result<std::collections::BTreeMap<String, String>> {
    let mut tags = std::collections::BTreeMap::new();
    for entry in raw {
        let Some((key, value)) = entry.split_once('=') else {
            anyhow::bail!("invalid tag '{entry}': expected key=value");
        };
        tags.insert(key.to_string(), value.to_string());
    }
    Ok(tags)
}
