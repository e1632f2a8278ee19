//! Tool pattern grammar and glob matching.
//!
//! Grammar: `ToolName` (any argument), `ToolName(GLOB)` (argument must match
//! GLOB), or `*` (any tool, any argument). GLOB supports `*`, `**`, `?`,
//! `[abc]`, `[a-z]`.
//!
//! Matching dispatches on whitespace: file-path arguments use path-style
//! globbing where `*` stays within a path segment and `**` crosses
//! separators; shell-command arguments (anything containing whitespace on
//! either side) fall back to string globbing where `*` matches any
//! character run, spaces included.

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

/// A pattern failed to parse.
#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("empty tool pattern")]
    Empty,

    #[error("invalid glob in pattern '{pattern}': {source}")]
    InvalidGlob {
        pattern: String,
        source: glob::PatternError,
    },
}

impl Clone for PatternError {
    fn clone(&self) -> Self {
        match self {
            PatternError::Empty => PatternError::Empty,
            PatternError::InvalidGlob { pattern, source } => PatternError::InvalidGlob {
                pattern: pattern.clone(),
                source: glob::PatternError {
                    pos: source.pos,
                    msg: source.msg,
                },
            },
        }
    }
}

impl PartialEq for PatternError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PatternError::Empty, PatternError::Empty) => true,
            (
                PatternError::InvalidGlob { pattern: p1, source: s1 },
                PatternError::InvalidGlob { pattern: p2, source: s2 },
            ) => p1 == p2 && s1.pos == s2.pos && s1.msg == s2.msg,
            _ => false,
        }
    }
}

/// One parsed entry of an allow or deny list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ToolPattern {
    raw: String,
    tool: ToolMatcher,
    arg: Option<Pattern>,
}

#[derive(Debug, Clone, PartialEq)]
enum ToolMatcher {
    /// `*` — any tool.
    Any,
    /// Exact tool name.
    Exact(String),
    /// Tool segment containing glob metacharacters.
    Glob(Pattern),
}

impl ToolPattern {
    /// Parse a raw pattern string.
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PatternError::Empty);
        }

        let (tool_part, arg_part) = match raw.find('(') {
            Some(open) if raw.ends_with(')') => {
                (&raw[..open], Some(&raw[open + 1..raw.len() - 1]))
            }
            _ => (raw, None),
        };

        let tool = if tool_part == "*" {
            ToolMatcher::Any
        } else if tool_part.contains(['*', '?', '[']) {
            ToolMatcher::Glob(compile(raw, tool_part)?)
        } else {
            ToolMatcher::Exact(tool_part.to_string())
        };

        let arg = match arg_part {
            // `Tool(*)` is equivalent to a bare wildcard argument but is kept
            // as a compiled pattern so the deny reason names the user's text.
            Some(glob) => Some(compile(raw, glob)?),
            None => None,
        };

        Ok(Self {
            raw: raw.to_string(),
            tool,
            arg,
        })
    }

    /// Whether this pattern matches a `(tool, argument)` invocation.
    pub fn matches(&self, tool: &str, argument: &str) -> bool {
        let tool_ok = match &self.tool {
            ToolMatcher::Any => true,
            ToolMatcher::Exact(name) => name == tool,
            ToolMatcher::Glob(pattern) => pattern.matches(tool),
        };
        if !tool_ok {
            return false;
        }

        match &self.arg {
            None => true,
            Some(pattern) => matches_dispatched(pattern, argument),
        }
    }

    /// The original pattern text, for deny reasons and display.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

impl TryFrom<String> for ToolPattern {
    type Error = PatternError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ToolPattern> for String {
    fn from(value: ToolPattern) -> Self {
        value.raw
    }
}

fn compile(raw: &str, glob: &str) -> Result<Pattern, PatternError> {
    Pattern::new(glob).map_err(|source| PatternError::InvalidGlob {
        pattern: raw.to_string(),
        source,
    })
}

/// Match `text` against an already-compiled glob, dispatching on whitespace.
fn matches_dispatched(pattern: &Pattern, text: &str) -> bool {
    let space_mode =
        pattern.as_str().contains(char::is_whitespace) || text.contains(char::is_whitespace);
    pattern.matches_with(text, match_options(space_mode))
}

/// Match `text` against a glob `pattern` string.
///
/// Whitespace on either side selects string-mode matching (spaces are
/// literal, `*` crosses everything); otherwise path-mode applies (`*` stays
/// within a segment, `**` crosses separators).
pub fn match_glob(pattern: &str, text: &str) -> Result<bool, PatternError> {
    let compiled = compile(pattern, pattern)?;
    Ok(matches_dispatched(&compiled, text))
}

fn match_options(space_mode: bool) -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: !space_mode,
        require_literal_leading_dot: false,
    }
}
