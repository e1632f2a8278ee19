//! Failure classification.
//!
//! Precedence (highest first): deadline expiry → timeout; declared
//! `error_max_turns` → context exhaustion; content matching context
//! patterns → context exhaustion; content matching rate-limit patterns →
//! rate limit; anything else → general error. Content sniffing is only
//! consulted for non-zero exits and declared error subtypes, so prose that
//! merely mentions rate limiting never misclassifies a successful step.

use std::sync::LazyLock;

use regex::Regex;
use wave_core::FailureReason;
use wave_core::stream::ResultSubtype;

static CONTEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)prompt is too long").unwrap());

static RATE_LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)you've hit your limit|rate limit|too many requests").unwrap()
});

/// Classify a terminated child that was not killed by deadline or
/// cancellation. Returns `None` when the exit is a plain success.
pub fn classify_exit(
    exit_code: i32,
    subtype: Option<&ResultSubtype>,
    content: &str,
) -> Option<FailureReason> {
    let declared_error = subtype.is_some_and(ResultSubtype::is_error);
    if exit_code == 0 && !declared_error {
        return None;
    }

    if matches!(subtype, Some(ResultSubtype::ErrorMaxTurns)) {
        return Some(FailureReason::ContextExhaustion);
    }
    if CONTEXT_RE.is_match(content) {
        return Some(FailureReason::ContextExhaustion);
    }
    if RATE_LIMIT_RE.is_match(content) {
        return Some(FailureReason::RateLimit);
    }
    Some(FailureReason::GeneralError)
}
