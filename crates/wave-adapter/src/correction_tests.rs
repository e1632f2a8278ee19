use super::*;

#[test]
fn valid_json_passes_directly() {
    let recovery = recover_json(r#"{"ok": true, "count": 3}"#);
    assert_eq!(recovery.strategy, RecoveryStrategy::Direct);
    assert!(recovery.warning.is_none());
    assert_eq!(recovery.value["count"], 3);
}

#[test]
fn whitespace_padded_json_is_direct() {
    let recovery = recover_json("\n\n  [1, 2, 3]  \n");
    assert_eq!(recovery.strategy, RecoveryStrategy::Direct);
    assert_eq!(recovery.content, "[1, 2, 3]");
}

#[test]
fn fenced_block_extracted() {
    let content = "Here is the analysis you asked for:\n\n```json\n{\"verdict\": \"pass\"}\n```\n\nLet me know if you need more.";
    let recovery = recover_json(content);
    assert_eq!(recovery.strategy, RecoveryStrategy::FencedBlock);
    assert_eq!(recovery.value["verdict"], "pass");
}

#[test]
fn bare_fence_without_language_tag() {
    let content = "```\n{\"a\": 1}\n```";
    let recovery = recover_json(content);
    assert_eq!(recovery.strategy, RecoveryStrategy::FencedBlock);
}

#[test]
fn explanatory_prefix_stripped() {
    let content = "Sure! The result is:\n{\"items\": [1, 2]}";
    let recovery = recover_json(content);
    assert_eq!(recovery.strategy, RecoveryStrategy::CleanedLines);
    assert_eq!(recovery.value["items"][1], 2);
}

#[test]
fn trailing_commas_removed() {
    let content = "The object:\n{\"a\": 1, \"b\": [1, 2,],}";
    let recovery = recover_json(content);
    assert_eq!(recovery.strategy, RecoveryStrategy::CleanedLines);
    assert_eq!(recovery.value["b"][0], 1);
}

#[test]
fn object_embedded_in_prose_extracted_by_regex() {
    // The `{` appears mid-line, after prose containing a stray `[` that
    // defeats line-based cleanup.
    let content = "See section [2] for context; verdict follows {\"score\": 7} as discussed.";
    let recovery = recover_json(content);
    assert_eq!(recovery.strategy, RecoveryStrategy::RegexExtraction);
    assert_eq!(recovery.value["score"], 7);
}

#[test]
fn partial_recovery_from_key_value_lines() {
    let content = "RESULT DUMP\n\"status\": \"failed\",\n\"retries\": 3,\ngarbage line here\n\"done\": true";
    let recovery = recover_json(content);
    assert_eq!(recovery.strategy, RecoveryStrategy::PartialRecovery);
    assert_eq!(recovery.value["status"], "failed");
    assert_eq!(recovery.value["retries"], 3);
    assert_eq!(recovery.value["done"], true);
}

#[test]
fn template_fallback_wraps_prose_verbatim() {
    let content = "I could not produce the requested output.";
    let recovery = recover_json(content);
    assert_eq!(recovery.strategy, RecoveryStrategy::TemplateFallback);
    assert!(recovery.warning.is_some());
    // The original content survives verbatim inside the template.
    assert_eq!(recovery.value["result"], content);

    // The content field is itself valid JSON.
    let reparsed: serde_json::Value = serde_json::from_str(&recovery.content).unwrap();
    assert_eq!(reparsed["result"], content);
}

#[test]
fn empty_content_yields_error_report() {
    for content in ["", "   \n  "] {
        let recovery = recover_json(content);
        assert_eq!(recovery.strategy, RecoveryStrategy::ErrorReport, "{content:?}");
        assert!(recovery.warning.is_some());
        assert_eq!(recovery.value["error"], "unrecoverable_output_format");
        assert!(serde_json::from_str::<serde_json::Value>(&recovery.content).is_ok());
    }
}

#[test]
fn ladder_always_terminates_in_valid_json() {
    for content in [
        r#"{"ok":true}"#,
        "prose only",
        "{broken",
        "",
        "\"key\": garbage value",
    ] {
        let recovery = recover_json(content);
        assert!(
            serde_json::from_str::<serde_json::Value>(&recovery.content).is_ok(),
            "{content:?} produced invalid JSON: {}",
            recovery.content
        );
    }
}

#[test]
fn error_report_is_valid_json_with_preview() {
    let report = error_report("raw garbage output");
    assert_eq!(report["error"], "unrecoverable_output_format");
    assert_eq!(report["raw_preview"], "raw garbage output");
}

#[test]
fn error_report_truncates_long_content() {
    let long = "y".repeat(5000);
    let report = error_report(&long);
    assert_eq!(report["raw_preview"].as_str().unwrap().len(), 2000);
}
