//! Curated child environment.
//!
//! Children inherit an allowlist only: the base set, telemetry-disable
//! flags, the persona's passthrough names that are set on the host, and
//! step-specific overrides. Everything else on the host is suppressed.

use std::collections::HashMap;

/// Host variables always forwarded when set.
pub const BASE_ENV: &[&str] = &["HOME", "PATH", "TERM", "TMPDIR"];

/// Flags set to `"1"` on every child to keep agent CLIs quiet.
pub const TELEMETRY_DISABLE: &[&str] = &[
    "DISABLE_TELEMETRY",
    "DISABLE_ERROR_REPORTING",
    "DISABLE_BUG_COMMAND",
    "CLAUDE_CODE_DISABLE_FEEDBACK_SURVEY",
];

/// Build the curated environment for one adapter invocation.
///
/// Precedence, lowest to highest: base set, telemetry flags, persona
/// passthrough, step overrides.
pub fn curated_env(
    passthrough: &[String],
    overrides: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env = HashMap::new();

    for name in BASE_ENV {
        if let Ok(value) = std::env::var(name) {
            env.insert(name.to_string(), value);
        }
    }

    for flag in TELEMETRY_DISABLE {
        env.insert(flag.to_string(), "1".to_string());
    }

    for name in passthrough {
        if let Ok(value) = std::env::var(name) {
            env.insert(name.clone(), value);
        }
    }

    for (name, value) in overrides {
        env.insert(name.clone(), value.clone());
    }

    env
}
