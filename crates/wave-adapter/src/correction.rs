//! Output format correction.
//!
//! Agents asked for JSON frequently wrap it in prose or fences, or emit it
//! with small defects. When a step declares JSON output, the extracted
//! result content runs through a ladder of recovery strategies, cheapest
//! first. When no parse rung succeeds, the ladder still terminates in
//! valid JSON: non-empty content is wrapped verbatim in a fallback
//! template, and empty content yields a structured error report. Either
//! way a warning is recorded, and the step is not failed for format alone
//! unless its contract requires JSON.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// Which rung of the ladder produced valid JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Content parsed as-is.
    Direct,
    /// Extracted from a fenced ```json block.
    FencedBlock,
    /// Prefix stripped / trailing commas removed.
    CleanedLines,
    /// Outermost object or array located by regex.
    RegexExtraction,
    /// Object reassembled from individually parseable key/value lines.
    PartialRecovery,
    /// Nothing parsed; the original content was wrapped in a template.
    TemplateFallback,
    /// Nothing parsed and nothing to wrap; a structured error report.
    ErrorReport,
}

/// Outcome of the recovery ladder.
#[derive(Debug)]
pub struct JsonRecovery {
    /// Parsed value: recovered JSON, or the synthesized fallback document.
    pub value: Value,

    /// JSON text for the result content. Parse rungs yield the recovered
    /// text; fallback rungs yield the synthesized document, which carries
    /// the original content inside it.
    pub content: String,

    pub strategy: RecoveryStrategy,

    /// Set when no parse rung succeeded and a fallback was synthesized.
    pub warning: Option<String>,
}

static FENCED_JSON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*\n(.*?)```").unwrap()
});

static TRAILING_COMMA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").unwrap());

static OBJECT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)\{.*\}").unwrap());

static ARRAY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)\[.*\]").unwrap());

static KEY_VALUE_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""([^"]+)"\s*:\s*(.+?),?\s*$"#).unwrap());

/// Run the recovery ladder over result content. Always yields valid JSON;
/// `warning` tells the two fallback rungs apart from genuine recovery.
pub fn recover_json(content: &str) -> JsonRecovery {
    let attempts: [(RecoveryStrategy, fn(&str) -> Option<String>); 5] = [
        (RecoveryStrategy::Direct, direct),
        (RecoveryStrategy::FencedBlock, fenced_block),
        (RecoveryStrategy::CleanedLines, cleaned_lines),
        (RecoveryStrategy::RegexExtraction, regex_extraction),
        (RecoveryStrategy::PartialRecovery, partial_recovery),
    ];

    for (strategy, attempt) in attempts {
        if let Some(candidate) = attempt(content) {
            if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
                return JsonRecovery {
                    value,
                    content: candidate,
                    strategy,
                    warning: None,
                };
            }
        }
    }

    if !content.trim().is_empty() {
        let template = template_fallback(content);
        return JsonRecovery {
            content: template.to_string(),
            value: template,
            strategy: RecoveryStrategy::TemplateFallback,
            warning: Some(
                "declared JSON output could not be recovered; original content wrapped in a \
                 fallback template"
                    .to_string(),
            ),
        };
    }

    let report = error_report(content);
    JsonRecovery {
        content: report.to_string(),
        value: report,
        strategy: RecoveryStrategy::ErrorReport,
        warning: Some("declared JSON output was empty; emitted a structured error report".to_string()),
    }
}

/// Wrap unparseable content in a minimal result template. The original
/// text is preserved verbatim under `result`.
fn template_fallback(content: &str) -> Value {
    serde_json::json!({ "result": content })
}

/// Structured error report, the ladder's last resort when there is no
/// content worth wrapping.
pub fn error_report(content: &str) -> Value {
    let preview: String = content.chars().take(2000).collect();
    serde_json::json!({
        "error": "unrecoverable_output_format",
        "expected": "json",
        "raw_preview": preview,
    })
}

fn direct(content: &str) -> Option<String> {
    let trimmed = content.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn fenced_block(content: &str) -> Option<String> {
    FENCED_JSON_RE
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Strip explanatory prefixes and trailing commas: keep lines from the
/// first `{` or `[` onward, then drop commas dangling before closers.
fn cleaned_lines(content: &str) -> Option<String> {
    let start = content.find(['{', '['])?;
    let body = &content[start..];
    let cleaned = TRAILING_COMMA_RE.replace_all(body, "$1");
    Some(cleaned.trim().to_string())
}

/// Locate the outermost object (preferred) or array anywhere in the text.
fn regex_extraction(content: &str) -> Option<String> {
    let candidate = OBJECT_RE
        .find(content)
        .or_else(|| ARRAY_RE.find(content))?;
    let cleaned = TRAILING_COMMA_RE.replace_all(candidate.as_str(), "$1");
    Some(cleaned.into_owned())
}

/// Reassemble an object from lines that individually parse as
/// `"key": value` pairs. Lossy, but salvages diagnostics from mangled
/// output.
fn partial_recovery(content: &str) -> Option<String> {
    let mut object = serde_json::Map::new();
    for line in content.lines() {
        let Some(caps) = KEY_VALUE_LINE_RE.captures(line.trim()) else {
            continue;
        };
        let key = caps[1].to_string();
        let raw_value = caps[2].trim().trim_end_matches(',');
        if let Ok(value) = serde_json::from_str::<Value>(raw_value) {
            object.insert(key, value);
        }
    }
    if object.is_empty() {
        return None;
    }
    serde_json::to_string(&Value::Object(object)).ok()
}

#[cfg(test)]
#[path = "correction_tests.rs"]
mod tests;
