//! Failure taxonomy for step execution.
//!
//! Every step failure is classified into one of a closed set of reasons.
//! The reason drives the remediation text shown to operators and is
//! persisted verbatim, so the vocabulary here is stable.

use serde::{Deserialize, Serialize};

/// Classified reason a step execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The parent-enforced deadline expired.
    Timeout,
    /// The agent exhausted its context window or turn budget.
    ContextExhaustion,
    /// The provider rejected further requests.
    RateLimit,
    /// The run (or step) was cancelled by the operator.
    Cancelled,
    /// Anything else, including signal terminations and missing artifacts.
    GeneralError,
}

impl FailureReason {
    /// Operator-facing remediation text, derived mechanically from the reason.
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::Timeout => {
                "Consider increasing the step timeout or breaking the task into smaller steps."
            }
            Self::ContextExhaustion => {
                "The context window was exhausted. Consider breaking the task into smaller steps \
                 or adjusting relay compaction thresholds."
            }
            Self::RateLimit => "API rate limit reached. Wait for the limit to reset and retry.",
            Self::Cancelled => "The step was cancelled before completion.",
            Self::GeneralError => "Check the adapter output and logs for details.",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::ContextExhaustion => "context_exhaustion",
            Self::RateLimit => "rate_limit",
            Self::Cancelled => "cancelled",
            Self::GeneralError => "general_error",
        };
        write!(f, "{s}")
    }
}

/// Typed step-execution error surfaced to the executor.
///
/// Carries best-effort diagnostics recovered from the child's stream (token
/// counts, result subtype) even when the child was killed.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("step failed ({reason}): {message}")]
pub struct StepError {
    pub reason: FailureReason,

    /// Human-readable cause.
    pub message: String,

    /// Tokens consumed before the failure, recovered from the stream.
    #[serde(default)]
    pub tokens_used: u64,

    /// Result subtype reported by the agent, when one was emitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
}

impl StepError {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            tokens_used: 0,
            subtype: None,
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }

    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    /// Remediation text for this error's reason.
    pub fn remediation(&self) -> &'static str {
        self.reason.remediation()
    }

    /// The message persisted on the step record: cause plus remediation.
    pub fn persisted_message(&self) -> String {
        format!("{} — {}", self.message, self.remediation())
    }
}
