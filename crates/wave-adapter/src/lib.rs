//! Adapter runner: spawns and supervises the external agent that executes
//! one step.
//!
//! Adapters form a closed set modeled as a data enum (not trait objects):
//! two agent CLIs, a generic process runner, an API wrapper and a mock.
//! They share one capability — run a configured invocation to an
//! [`AdapterResult`] or a classified [`StepError`].

mod api;
mod classify;
mod config;
mod correction;
mod env;
mod mock;
mod process;
mod settings;
mod stream;

pub use classify::classify_exit;
pub use config::{
    AdapterResult, AdapterRunConfig, DEFAULT_AGENT_TIMEOUT, DEFAULT_PROCESS_TIMEOUT,
    StreamCallback,
};
pub use correction::{JsonRecovery, RecoveryStrategy, error_report, recover_json};
pub use env::{BASE_ENV, TELEMETRY_DISABLE, curated_env};
pub use process::{DRAIN_BUDGET, TERM_GRACE};
pub use settings::{
    COMMANDS_RELATIVE_DIR, SETTINGS_RELATIVE_PATH, SYSTEM_PROMPT_RELATIVE_PATH,
    assemble_system_prompt, write_settings, write_system_prompt,
};
pub use stream::{MAX_LINE_BYTES, StreamDecoder};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use wave_core::error::{FailureReason, StepError};
use wave_core::types::OutputFormat;

/// A persona referenced an adapter identifier the core does not know.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("unknown adapter '{0}'")]
pub struct UnknownAdapter(pub String);

/// The closed set of adapters, selected at pipeline load by identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "adapter", rename_all = "kebab-case")]
pub enum Adapter {
    /// Claude Code CLI, streaming NDJSON.
    ClaudeCode,
    /// Codex CLI, streaming NDJSON via `exec --json`.
    Codex,
    /// Generic process runner: any binary taking the prompt as its single
    /// argument; stdout becomes the result content.
    Process,
    /// Direct provider API call (no tool use).
    Api {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_url: Option<String>,
    },
    /// Scripted NDJSON replay for tests; echoes the prompt when unscripted.
    Mock {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        script: Option<String>,
    },
}

impl Adapter {
    /// Resolve a manifest adapter identifier.
    pub fn from_identifier(id: &str) -> Result<Self, UnknownAdapter> {
        match id {
            "claude-code" => Ok(Self::ClaudeCode),
            "codex" => Ok(Self::Codex),
            "process" => Ok(Self::Process),
            "api" => Ok(Self::Api { base_url: None }),
            "mock" => Ok(Self::Mock { script: None }),
            other => Err(UnknownAdapter(other.to_string())),
        }
    }

    pub fn identifier(&self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude-code",
            Self::Codex => "codex",
            Self::Process => "process",
            Self::Api { .. } => "api",
            Self::Mock { .. } => "mock",
        }
    }

    /// Default binary name for CLI adapters.
    fn default_binary(&self) -> Option<&'static str> {
        match self {
            Self::ClaudeCode => Some("claude"),
            Self::Codex => Some("codex"),
            Self::Process | Self::Api { .. } | Self::Mock { .. } => None,
        }
    }

    pub fn install_hint(&self) -> &'static str {
        match self {
            Self::ClaudeCode => "Install: npm install -g @anthropic-ai/claude-code",
            Self::Codex => "Install: npm install -g @openai/codex",
            Self::Process => "Set the persona's `binary` to an executable path",
            Self::Api { .. } => "Add ANTHROPIC_API_KEY to the persona's env passthrough",
            Self::Mock { .. } => "The mock adapter needs no installation",
        }
    }

    /// Verify the adapter's binary resolves before the first spawn.
    pub async fn preflight(&self, config: &AdapterRunConfig) -> Result<(), StepError> {
        let Some(binary) = self.binary_name(config) else {
            return Ok(());
        };
        match which::which(&binary) {
            Ok(_) => Ok(()),
            Err(_) => Err(self.not_installed(&binary)),
        }
    }

    fn not_installed(&self, binary: &str) -> StepError {
        StepError::new(
            FailureReason::GeneralError,
            format!(
                "agent binary '{}' is not installed or not on PATH. {}",
                binary,
                self.install_hint()
            ),
        )
    }

    fn binary_name(&self, config: &AdapterRunConfig) -> Option<String> {
        config
            .binary
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .or_else(|| self.default_binary().map(String::from))
    }

    /// Execute one step. `Ok` only for a zero exit; deadline expiry,
    /// cancellation and non-zero exits come back as classified errors with
    /// best-effort diagnostics.
    pub async fn run(
        &self,
        config: &AdapterRunConfig,
        cancel: &CancellationToken,
    ) -> Result<AdapterResult, StepError> {
        let mut result = match self {
            Self::ClaudeCode | Self::Codex => {
                settings::write_settings(config)?;
                settings::write_system_prompt(config)?;
                settings::copy_skills(config)?;
                let cmd = self.build_cli_command(config)?;
                process::supervise(cmd, config, cancel).await?
            }
            Self::Process => {
                let cmd = self.build_process_command(config)?;
                let mut result = process::supervise(cmd, config, cancel).await?;
                // Generic runners rarely speak the stream protocol; their
                // stdout is the result.
                if result.result_content.is_none() {
                    result.result_content = Some(result.stdout.trim().to_string());
                }
                result
            }
            Self::Api { base_url } => api::run_api(base_url.as_deref(), config, cancel).await?,
            Self::Mock { script } => mock::run_mock(script.as_deref(), config)?,
        };

        if config.output_format == OutputFormat::Json {
            if let Some(content) = result.result_content.take() {
                let recovery = correction::recover_json(&content);
                result.result_content = Some(recovery.content);
                result.format_warning = recovery.warning;
            }
        }

        Ok(result)
    }

    fn build_cli_command(&self, config: &AdapterRunConfig) -> Result<Command, StepError> {
        let binary = self.binary_name(config).ok_or_else(|| {
            StepError::new(FailureReason::GeneralError, "adapter has no binary")
        })?;
        let mut cmd = Command::new(binary);
        cmd.current_dir(&config.workspace);
        cmd.env_clear();
        cmd.envs(&config.env);
        if let Some(max) = config.max_subagents {
            cmd.env("WAVE_MAX_SUBAGENTS", max.to_string());
        }

        match self {
            Self::ClaudeCode => {
                cmd.arg("--output-format").arg("stream-json");
                cmd.arg("--verbose");
                cmd.arg("--settings").arg(settings::SETTINGS_RELATIVE_PATH);
                if let Some(model) = &config.model {
                    cmd.arg("--model").arg(model);
                }
                cmd.arg("--append-system-prompt")
                    .arg(settings::assemble_system_prompt(config));
                cmd.arg("-p").arg(&config.prompt);
            }
            Self::Codex => {
                cmd.arg("exec");
                cmd.arg("--json");
                if let Some(model) = &config.model {
                    cmd.arg("--model").arg(model);
                }
                cmd.arg(&config.prompt);
            }
            _ => unreachable!("build_cli_command is only called for CLI adapters"),
        }
        Ok(cmd)
    }

    fn build_process_command(&self, config: &AdapterRunConfig) -> Result<Command, StepError> {
        let binary = config.binary.clone().ok_or_else(|| {
            StepError::new(
                FailureReason::GeneralError,
                "process adapter requires the persona to declare a binary",
            )
        })?;
        let mut cmd = Command::new(binary);
        cmd.current_dir(&config.workspace);
        cmd.env_clear();
        cmd.envs(&config.env);
        cmd.arg(&config.prompt);
        Ok(cmd)
    }
}
