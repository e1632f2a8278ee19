//! Tool permission policy: ordered allow/deny glob patterns with deny-first
//! precedence.
//!
//! A policy is two pattern lists derived from a persona. Evaluation order:
//!
//! 1. Any matching deny pattern denies, naming the pattern.
//! 2. An empty allow list allows everything not denied.
//! 3. Otherwise the invocation must match an allow pattern.

mod pattern;

pub use pattern::{PatternError, ToolPattern, match_glob};

use serde::{Deserialize, Serialize};

/// An evaluated permission policy, fixed for the duration of a step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionPolicy {
    allow: Vec<ToolPattern>,
    deny: Vec<ToolPattern>,
}

/// A denied tool invocation, with enough context for display.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("persona '{persona}' denied {tool}({argument}): {reason}")]
pub struct PermissionDenied {
    pub persona: String,
    pub tool: String,
    pub argument: String,
    pub reason: String,
}

impl PermissionPolicy {
    /// Build a policy from raw pattern strings (persona allow/deny lists).
    pub fn parse(allow: &[String], deny: &[String]) -> Result<Self, PatternError> {
        Ok(Self {
            allow: allow
                .iter()
                .map(|p| ToolPattern::parse(p))
                .collect::<Result<_, _>>()?,
            deny: deny
                .iter()
                .map(|p| ToolPattern::parse(p))
                .collect::<Result<_, _>>()?,
        })
    }

    /// Evaluate a `(tool, argument)` invocation. Deny patterns win over
    /// allow patterns; an empty allow list is permissive.
    pub fn check(
        &self,
        persona: &str,
        tool: &str,
        argument: &str,
    ) -> Result<(), PermissionDenied> {
        if let Some(denied) = self.deny.iter().find(|p| p.matches(tool, argument)) {
            return Err(PermissionDenied {
                persona: persona.to_string(),
                tool: tool.to_string(),
                argument: argument.to_string(),
                reason: format!("blocked by deny pattern '{}'", denied.raw()),
            });
        }

        if self.allow.is_empty() || self.allow.iter().any(|p| p.matches(tool, argument)) {
            return Ok(());
        }

        Err(PermissionDenied {
            persona: persona.to_string(),
            tool: tool.to_string(),
            argument: argument.to_string(),
            reason: "not in allowed tools list".to_string(),
        })
    }

    pub fn allow_patterns(&self) -> impl Iterator<Item = &str> {
        self.allow.iter().map(|p| p.raw())
    }

    pub fn deny_patterns(&self) -> impl Iterator<Item = &str> {
        self.deny.iter().map(|p| p.raw())
    }
}
