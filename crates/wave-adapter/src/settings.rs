//! Per-workspace agent configuration files.
//!
//! Before spawn, the runner materializes the agent's settings record and
//! system-prompt document inside the workspace, and copies any persona
//! skill commands into the agent's command directory.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::debug;
use wave_core::error::{FailureReason, StepError};

use crate::config::AdapterRunConfig;

/// Shared base protocol prepended to every persona prompt.
const BASE_PROTOCOL: &str = "\
# Execution Protocol

You are one step of an automated pipeline. Work only inside the current \
workspace. Write declared output artifacts to their exact declared paths. \
When you are done, stop; do not wait for further input.";

/// Relative path of the settings record inside the workspace.
pub const SETTINGS_RELATIVE_PATH: &str = ".claude/settings.json";

/// Relative path of the assembled system prompt inside the workspace.
pub const SYSTEM_PROMPT_RELATIVE_PATH: &str = ".claude/system-prompt.md";

/// Relative directory for copied skill commands.
pub const COMMANDS_RELATIVE_DIR: &str = ".claude/commands";

fn io_error(path: &Path, e: std::io::Error) -> StepError {
    StepError::new(
        FailureReason::GeneralError,
        format!("failed to write agent config '{}': {e}", path.display()),
    )
}

/// Write the agent settings record. Returns the absolute settings path.
///
/// The sandbox block is only present when the persona's sandbox policy is
/// enabled; the network allowlist within it is the authoritative network
/// boundary for the agent.
pub fn write_settings(config: &AdapterRunConfig) -> Result<PathBuf, StepError> {
    let mut settings = json!({
        "model": config.model,
        "temperature": config.temperature,
        "output_format": "stream-json",
        "permissions": {
            "allow": config.allowed_tools,
            "deny": config.denied_tools,
        },
    });

    if let Some(sandbox) = config.sandbox.as_ref().filter(|s| s.enabled) {
        settings["sandbox"] = json!({
            "enabled": true,
            "allowUnsandboxedCommands": false,
            "autoAllowBashIfSandboxed": true,
            "network": {
                "allowedDomains": sandbox.allowed_domains,
            },
        });
    }

    let path = config.workspace.join(SETTINGS_RELATIVE_PATH);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }
    let body = serde_json::to_string_pretty(&settings).unwrap_or_else(|_| "{}".to_string());
    fs::write(&path, body).map_err(|e| io_error(&path, e))?;

    debug!(path = %path.display(), "agent settings written");
    Ok(path)
}

/// Assemble the system-prompt document: base protocol, persona prompt,
/// optional contract-compliance section, and the auto-generated restriction
/// section, joined by `---` separators.
pub fn assemble_system_prompt(config: &AdapterRunConfig) -> String {
    let mut sections: Vec<String> = vec![BASE_PROTOCOL.to_string()];

    if !config.system_prompt.trim().is_empty() {
        sections.push(config.system_prompt.trim().to_string());
    }
    if let Some(contract) = &config.contract_section {
        sections.push(contract.trim().to_string());
    }
    sections.push(restriction_section(config));

    sections.join("\n\n---\n\n")
}

/// Write the assembled system prompt into the workspace.
pub fn write_system_prompt(config: &AdapterRunConfig) -> Result<PathBuf, StepError> {
    let path = config.workspace.join(SYSTEM_PROMPT_RELATIVE_PATH);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }
    fs::write(&path, assemble_system_prompt(config)).map_err(|e| io_error(&path, e))?;
    Ok(path)
}

fn restriction_section(config: &AdapterRunConfig) -> String {
    let mut out = String::from("# Restrictions\n");

    if config.denied_tools.is_empty() {
        out.push_str("\nDenied tools: none.\n");
    } else {
        out.push_str("\nDenied tools (never use these):\n");
        for pattern in &config.denied_tools {
            out.push_str(&format!("- `{pattern}`\n"));
        }
    }

    if config.allowed_tools.is_empty() {
        out.push_str("\nAllowed tools: all tools not denied above.\n");
    } else {
        out.push_str("\nAllowed tools:\n");
        for pattern in &config.allowed_tools {
            out.push_str(&format!("- `{pattern}`\n"));
        }
    }

    if let Some(sandbox) = config.sandbox.as_ref().filter(|s| s.enabled) {
        if sandbox.allowed_domains.is_empty() {
            out.push_str("\nNetwork access: none.\n");
        } else {
            out.push_str("\nAllowed network domains:\n");
            for domain in &sandbox.allowed_domains {
                out.push_str(&format!("- {domain}\n"));
            }
        }
    }

    out.trim_end().to_string()
}

/// Copy persona skill command files into the agent's command directory.
pub fn copy_skills(config: &AdapterRunConfig) -> Result<(), StepError> {
    if config.skills.is_empty() {
        return Ok(());
    }
    let commands_dir = config.workspace.join(COMMANDS_RELATIVE_DIR);
    fs::create_dir_all(&commands_dir).map_err(|e| io_error(&commands_dir, e))?;

    for skill in &config.skills {
        let Some(file_name) = skill.file_name() else {
            continue;
        };
        let dest = commands_dir.join(file_name);
        fs::copy(skill, &dest).map_err(|e| io_error(&dest, e))?;
        debug!(skill = %skill.display(), "skill command copied");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use wave_core::types::SandboxPolicy;

    use super::*;

    fn config_in(tmp: &TempDir) -> AdapterRunConfig {
        let mut config = AdapterRunConfig::new("analyst", tmp.path(), "prompt");
        config.model = Some("claude-sonnet-4-5".to_string());
        config.temperature = Some(0.2);
        config.allowed_tools = vec!["Read".into(), "Write(out/**)".into()];
        config.denied_tools = vec!["Bash(rm -rf*)".into()];
        config
    }

    #[test]
    fn settings_record_shape() {
        let tmp = TempDir::new().unwrap();
        let path = write_settings(&config_in(&tmp)).unwrap();
        assert!(path.ends_with(".claude/settings.json"));

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["model"], "claude-sonnet-4-5");
        assert_eq!(value["output_format"], "stream-json");
        assert_eq!(value["permissions"]["allow"][1], "Write(out/**)");
        assert_eq!(value["permissions"]["deny"][0], "Bash(rm -rf*)");
        // No sandbox policy declared: no sandbox block.
        assert!(value.get("sandbox").is_none());
    }

    #[test]
    fn sandbox_block_when_enabled() {
        let tmp = TempDir::new().unwrap();
        let mut config = config_in(&tmp);
        config.sandbox = Some(SandboxPolicy {
            enabled: true,
            allowed_domains: vec!["api.github.com".into()],
        });

        let path = write_settings(&config).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["sandbox"]["enabled"], true);
        assert_eq!(value["sandbox"]["allowUnsandboxedCommands"], false);
        assert_eq!(value["sandbox"]["autoAllowBashIfSandboxed"], true);
        assert_eq!(value["sandbox"]["network"]["allowedDomains"][0], "api.github.com");
    }

    #[test]
    fn disabled_sandbox_emits_no_block() {
        let tmp = TempDir::new().unwrap();
        let mut config = config_in(&tmp);
        config.sandbox = Some(SandboxPolicy {
            enabled: false,
            allowed_domains: vec!["ignored.example".into()],
        });
        let path = write_settings(&config).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(value.get("sandbox").is_none());
    }

    #[test]
    fn system_prompt_section_order() {
        let tmp = TempDir::new().unwrap();
        let mut config = config_in(&tmp);
        config.system_prompt = "You are a meticulous analyst.".to_string();
        config.contract_section = Some("Your output must be valid JSON.".to_string());

        let prompt = assemble_system_prompt(&config);
        let sections: Vec<&str> = prompt.split("\n\n---\n\n").collect();
        assert_eq!(sections.len(), 4);
        assert!(sections[0].starts_with("# Execution Protocol"));
        assert_eq!(sections[1], "You are a meticulous analyst.");
        assert_eq!(sections[2], "Your output must be valid JSON.");
        assert!(sections[3].starts_with("# Restrictions"));
        assert!(sections[3].contains("Bash(rm -rf*)"));
        assert!(sections[3].contains("Write(out/**)"));
    }

    #[test]
    fn restriction_section_lists_domains() {
        let tmp = TempDir::new().unwrap();
        let mut config = config_in(&tmp);
        config.sandbox = Some(SandboxPolicy {
            enabled: true,
            allowed_domains: vec!["api.github.com".into(), "crates.io".into()],
        });
        let prompt = assemble_system_prompt(&config);
        assert!(prompt.contains("- api.github.com"));
        assert!(prompt.contains("- crates.io"));
    }

    #[test]
    fn empty_persona_prompt_is_omitted() {
        let tmp = TempDir::new().unwrap();
        let mut config = config_in(&tmp);
        config.system_prompt = "   ".to_string();
        let prompt = assemble_system_prompt(&config);
        let sections: Vec<&str> = prompt.split("\n\n---\n\n").collect();
        assert_eq!(sections.len(), 2);
    }

    #[test]
    fn write_system_prompt_creates_file() {
        let tmp = TempDir::new().unwrap();
        let path = write_system_prompt(&config_in(&tmp)).unwrap();
        assert!(path.is_file());
        assert!(
            fs::read_to_string(&path)
                .unwrap()
                .contains("# Execution Protocol")
        );
    }

    #[test]
    fn skills_copied_into_commands_dir() {
        let tmp = TempDir::new().unwrap();
        let skill_src = tmp.path().join("review.md");
        fs::write(&skill_src, "# /review").unwrap();

        let mut config = config_in(&tmp);
        config.skills = vec![skill_src];
        copy_skills(&config).unwrap();

        let copied = tmp.path().join(".claude/commands/review.md");
        assert_eq!(fs::read_to_string(copied).unwrap(), "# /review");
    }
}
