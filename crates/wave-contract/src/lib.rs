//! Contract validation at handover boundaries.
//!
//! A step's contract is evaluated against its extracted result content
//! after the adapter finishes. Contract failure is an expected outcome
//! ([`ContractOutcome::Failed`]) that feeds the retry policy; only
//! infrastructure problems (unreadable schema, unspawnable command) are
//! errors.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use tracing::debug;
use wave_core::types::{Contract, ContractKind, OutputFormat};

/// Deadline for `command` contracts, distinct from the agent deadline.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Result of evaluating a contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractOutcome {
    Passed,
    /// The check ran and the output did not satisfy it.
    Failed { diagnostic: String },
}

impl ContractOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, Self::Passed)
    }

    fn failed(diagnostic: impl Into<String>) -> Self {
        Self::Failed {
            diagnostic: diagnostic.into(),
        }
    }
}

/// What the executor should do after a contract failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-invoke the step with an enriched prompt.
    Retry,
    /// Retries exhausted and the contract must pass.
    FailStep,
    /// Retries exhausted but the contract is advisory; complete with a
    /// recorded warning.
    CompleteWithWarning,
}

/// Infrastructure failure while evaluating a contract.
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("json_schema contract declares neither schema nor schema_path")]
    NoSchema,

    #[error("failed to read schema at '{path}': {source}")]
    SchemaRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("failed to run contract command '{command}': {source}")]
    CommandSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("contract command '{command}' exceeded {timeout_secs}s")]
    CommandTimeout { command: String, timeout_secs: u64 },
}

/// Evaluate a step's contract against its result content.
///
/// `workspace` is the step workspace (command contracts run there unless
/// they declare their own `dir`); `env` is the same curated environment the
/// adapter child received.
pub async fn evaluate(
    contract: &Contract,
    result_content: &str,
    workspace: &Path,
    env: &HashMap<String, String>,
) -> Result<ContractOutcome, ContractError> {
    let outcome = match &contract.kind {
        ContractKind::JsonSchema {
            schema,
            schema_path,
        } => evaluate_schema(schema.as_deref(), schema_path.as_deref(), result_content)?,
        ContractKind::Command { command, dir } => {
            evaluate_command(command, dir.as_deref(), workspace, env).await?
        }
        ContractKind::Format { format } => evaluate_format(*format, result_content),
    };

    debug!(passed = outcome.passed(), "contract evaluated");
    Ok(outcome)
}

/// Apply the retry policy after a contract failure.
pub fn decide(contract: &Contract, retry_count: u32) -> RetryDecision {
    if retry_count < contract.max_retries {
        RetryDecision::Retry
    } else if contract.must_pass {
        RetryDecision::FailStep
    } else {
        RetryDecision::CompleteWithWarning
    }
}

fn evaluate_schema(
    schema: Option<&str>,
    schema_path: Option<&Path>,
    content: &str,
) -> Result<ContractOutcome, ContractError> {
    let schema_text = match (schema, schema_path) {
        (Some(inline), _) => inline.to_string(),
        (None, Some(path)) => {
            std::fs::read_to_string(path).map_err(|source| ContractError::SchemaRead {
                path: path.display().to_string(),
                source,
            })?
        }
        (None, None) => return Err(ContractError::NoSchema),
    };

    let schema_value: serde_json::Value = serde_json::from_str(&schema_text)
        .map_err(|e| ContractError::InvalidSchema(e.to_string()))?;
    let validator = jsonschema::validator_for(&schema_value)
        .map_err(|e| ContractError::InvalidSchema(e.to_string()))?;

    let instance: serde_json::Value = match serde_json::from_str(content) {
        Ok(v) => v,
        Err(e) => {
            return Ok(ContractOutcome::failed(format!(
                "result content is not valid JSON: {e}"
            )));
        }
    };

    match validator.validate(&instance) {
        Ok(()) => Ok(ContractOutcome::Passed),
        Err(error) => Ok(ContractOutcome::failed(format!(
            "schema violation: {error}"
        ))),
    }
}

async fn evaluate_command(
    command: &str,
    dir: Option<&str>,
    workspace: &Path,
    env: &HashMap<String, String>,
) -> Result<ContractOutcome, ContractError> {
    let cwd = match dir {
        Some(d) => workspace.join(d),
        None => workspace.to_path_buf(),
    };

    // Absolute path: the curated environment may not carry PATH.
    let mut cmd = tokio::process::Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(&cwd)
        .env_clear()
        .envs(env)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(COMMAND_TIMEOUT, cmd.output())
        .await
        .map_err(|_| ContractError::CommandTimeout {
            command: command.to_string(),
            timeout_secs: COMMAND_TIMEOUT.as_secs(),
        })?
        .map_err(|source| ContractError::CommandSpawn {
            command: command.to_string(),
            source,
        })?;

    if output.status.success() {
        return Ok(ContractOutcome::Passed);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let tail: String = stderr
        .lines()
        .rev()
        .take(5)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join("\n");
    Ok(ContractOutcome::failed(format!(
        "command '{command}' exited with {}: {tail}",
        output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string())
    )))
}

fn evaluate_format(format: OutputFormat, content: &str) -> ContractOutcome {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return ContractOutcome::failed("output is empty");
    }
    match format {
        OutputFormat::Text => ContractOutcome::Passed,
        OutputFormat::Json => match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(_) => ContractOutcome::Passed,
            Err(e) => ContractOutcome::failed(format!("invalid JSON: {e}")),
        },
        OutputFormat::Yaml => match serde_yaml::from_str::<serde_yaml::Value>(trimmed) {
            Ok(_) => ContractOutcome::Passed,
            Err(e) => ContractOutcome::failed(format!("invalid YAML: {e}")),
        },
        OutputFormat::Markdown => {
            let structured = trimmed.lines().any(|line| {
                let line = line.trim_start();
                line.starts_with('#')
                    || line.starts_with("- ")
                    || line.starts_with("* ")
                    || line.len() > 2 && line.as_bytes()[0].is_ascii_digit() && line[1..].starts_with(". ")
            });
            if structured {
                ContractOutcome::Passed
            } else {
                ContractOutcome::failed("markdown output has no heading or list structure")
            }
        }
    }
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
