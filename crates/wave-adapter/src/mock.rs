//! Mock adapter: replays a scripted NDJSON transcript through the real
//! stream decoder, so tests exercise the production decode path without a
//! child process.

use wave_core::error::StepError;

use crate::classify::classify_exit;
use crate::config::{AdapterResult, AdapterRunConfig};
use crate::stream::StreamDecoder;

/// Replay `script` (NDJSON, one record per line). With no script, behaves
/// like an echo agent: the prompt comes back as the result content with a
/// small fixed usage.
pub(crate) fn run_mock(
    script: Option<&str>,
    config: &AdapterRunConfig,
) -> Result<AdapterResult, StepError> {
    let transcript = match script {
        Some(script) => script.to_string(),
        None => echo_transcript(&config.prompt),
    };

    let mut decoder = StreamDecoder::new();
    for line in transcript.lines() {
        for event in decoder.decode_line(line) {
            config.emit(&event);
        }
    }

    let content = decoder.result_content().unwrap_or("").to_string();
    let subtype = decoder.subtype().cloned();
    let failure = classify_exit(0, subtype.as_ref(), &content);

    Ok(AdapterResult {
        exit_code: 0,
        tokens_used: decoder.tokens_total(),
        result_content: decoder.result_content().map(String::from),
        subtype,
        files_modified: decoder.take_files_modified(),
        failure,
        format_warning: None,
        stdout: transcript,
    })
}

fn echo_transcript(prompt: &str) -> String {
    serde_json::json!({
        "type": "result",
        "subtype": "success",
        "result": prompt,
        "usage": {
            "input_tokens": 10,
            "output_tokens": 5,
            "cache_read_input_tokens": 0,
            "cache_creation_input_tokens": 0,
        },
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use wave_core::stream::ResultSubtype;

    use super::*;

    #[test]
    fn echo_mode_returns_prompt_with_fixed_usage() {
        let config = AdapterRunConfig::new("p", "/tmp", r#"{"ok":true}"#);
        let result = run_mock(None, &config).unwrap();
        assert_eq!(result.result_content.as_deref(), Some(r#"{"ok":true}"#));
        assert_eq!(result.tokens_used, 15);
        assert_eq!(result.subtype, Some(ResultSubtype::Success));
        assert!(result.failure.is_none());
    }

    #[test]
    fn scripted_transcript_is_replayed() {
        let script = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Write","input":{"file_path":"out/spec.md","content":"x"}}],"usage":{"input_tokens":50,"output_tokens":10}}}
{"type":"result","subtype":"success","result":"done","usage":{"input_tokens":60,"output_tokens":12,"cache_read_input_tokens":0,"cache_creation_input_tokens":3}}"#;
        let config = AdapterRunConfig::new("p", "/tmp", "ignored");
        let result = run_mock(Some(script), &config).unwrap();
        assert_eq!(result.result_content.as_deref(), Some("done"));
        assert_eq!(result.tokens_used, 75);
        assert_eq!(result.files_modified, vec!["out/spec.md".to_string()]);
    }

    #[test]
    fn scripted_error_subtype_classifies() {
        let script = r#"{"type":"result","subtype":"error_max_turns","result":"","usage":{"input_tokens":1000,"output_tokens":0,"cache_read_input_tokens":0,"cache_creation_input_tokens":0}}"#;
        let config = AdapterRunConfig::new("p", "/tmp", "x");
        let result = run_mock(Some(script), &config).unwrap();
        assert_eq!(
            result.failure,
            Some(wave_core::FailureReason::ContextExhaustion)
        );
    }
}
