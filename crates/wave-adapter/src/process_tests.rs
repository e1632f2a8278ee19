use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use wave_core::FailureReason;
use wave_core::stream::StreamEventKind;

use super::*;
use crate::config::AdapterRunConfig;

fn sh(script: &str) -> Command {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(script);
    cmd
}

fn config(timeout: Duration) -> AdapterRunConfig {
    let mut config = AdapterRunConfig::new("test", std::env::temp_dir(), "prompt");
    config.timeout = timeout;
    config
}

const RESULT_LINE: &str = r#"{"type":"result","subtype":"success","result":"{\"ok\":true}","usage":{"input_tokens":10,"output_tokens":5,"cache_read_input_tokens":0,"cache_creation_input_tokens":0}}"#;

#[tokio::test]
async fn happy_path_single_result_line() {
    let cmd = sh(&format!("echo '{RESULT_LINE}'"));
    let result = supervise(cmd, &config(Duration::from_secs(10)), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.tokens_used, 15);
    assert_eq!(result.result_content.as_deref(), Some(r#"{"ok":true}"#));
    assert!(result.failure.is_none());
    assert!(result.stdout.contains("result"));
}

#[tokio::test]
async fn stream_callback_sees_events_in_order() {
    let seen: Arc<std::sync::Mutex<Vec<StreamEventKind>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);

    let mut config = config(Duration::from_secs(10));
    config.on_event = Some(Arc::new(move |event| {
        seen_clone.lock().unwrap().push(event.kind);
    }));

    let script = format!(
        r#"echo '{{"type":"system","subtype":"init"}}'
echo '{{"type":"assistant","message":{{"content":[{{"type":"tool_use","name":"Bash","input":{{"command":"ls"}}}}],"usage":{{"input_tokens":5,"output_tokens":1}}}}}}'
echo '{RESULT_LINE}'"#
    );
    supervise(sh(&script), &config, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            StreamEventKind::System,
            StreamEventKind::ToolUse,
            StreamEventKind::Result
        ]
    );
}

#[tokio::test]
async fn timeout_recovers_buffered_diagnostics() {
    // The child reports 20 input tokens, then hangs far past the deadline.
    let script = r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"thinking"}],"usage":{"input_tokens":20,"output_tokens":0}}}'
sleep 60"#;

    let started = Instant::now();
    let err = supervise(
        sh(script),
        &config(Duration::from_millis(100)),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.reason, FailureReason::Timeout);
    assert_eq!(err.tokens_used, 20);
    assert!(err.remediation().starts_with("Consider increasing the step timeout"));
    // SIGTERM -> grace -> SIGKILL -> drain stays well under 4s of wall time.
    assert!(
        started.elapsed() < Duration::from_secs(4),
        "teardown took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn sigterm_ignoring_child_is_force_killed() {
    // Trap and ignore TERM; only SIGKILL can end this child.
    let script = r#"trap '' TERM
sleep 60"#;

    let started = Instant::now();
    let err = supervise(
        sh(script),
        &config(Duration::from_millis(100)),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.reason, FailureReason::Timeout);
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "escalation took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn cancellation_is_distinct_from_timeout() {
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let err = supervise(sh("sleep 60"), &config(Duration::from_secs(30)), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.reason, FailureReason::Cancelled);
}

#[tokio::test]
async fn nonzero_exit_with_rate_limit_content() {
    let script = r#"echo '{"type":"result","subtype":"error_during_execution","result":"You'\''ve hit your limit","usage":{"input_tokens":7,"output_tokens":2,"cache_read_input_tokens":0,"cache_creation_input_tokens":0}}'
exit 1"#;

    let err = supervise(sh(script), &config(Duration::from_secs(10)), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.reason, FailureReason::RateLimit);
    assert_eq!(err.tokens_used, 9);
    assert_eq!(err.subtype.as_deref(), Some("error_during_execution"));
}

#[tokio::test]
async fn context_exhaustion_from_subtype_on_nonzero_exit() {
    let script = r#"echo '{"type":"result","subtype":"error_max_turns","result":"","usage":{"input_tokens":150000,"output_tokens":0,"cache_read_input_tokens":200000,"cache_creation_input_tokens":5000}}'
exit 1"#;

    let err = supervise(sh(script), &config(Duration::from_secs(10)), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.reason, FailureReason::ContextExhaustion);
    // cache_read excluded: 150000 + 0 + 5000.
    assert_eq!(err.tokens_used, 155_000);
    assert!(err.remediation().contains("compaction"));
}

#[tokio::test]
async fn zero_exit_with_error_subtype_reports_failure() {
    let script = r#"echo '{"type":"result","subtype":"error_max_turns","result":"","usage":{"input_tokens":100,"output_tokens":0,"cache_read_input_tokens":0,"cache_creation_input_tokens":0}}'"#;

    let result = supervise(sh(script), &config(Duration::from_secs(10)), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.failure, Some(FailureReason::ContextExhaustion));
}

#[tokio::test]
async fn plain_nonzero_exit_is_general_error_with_stderr_summary() {
    let err = supervise(
        sh("echo 'something broke' >&2; exit 7"),
        &config(Duration::from_secs(10)),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.reason, FailureReason::GeneralError);
    assert!(err.message.contains("something broke"), "{}", err.message);
}

#[tokio::test]
async fn signal_terminated_child_maps_to_128_plus_signal() {
    // The child TERMs itself; classification is a general error.
    let err = supervise(
        sh("kill -TERM $$; sleep 5"),
        &config(Duration::from_secs(10)),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.reason, FailureReason::GeneralError);
    assert!(err.message.contains("143"), "{}", err.message);
}

#[tokio::test]
async fn grandchildren_die_with_the_group() {
    // The child spawns a background grandchild writing to a file; after
    // group teardown the file must stop growing.
    let tmp = tempfile::tempdir().unwrap();
    let marker = tmp.path().join("beats");
    let script = format!(
        "(while true; do echo beat >> {}; sleep 0.1; done) & sleep 60",
        marker.display()
    );

    let err = supervise(
        sh(&script),
        &config(Duration::from_millis(200)),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.reason, FailureReason::Timeout);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let size_a = std::fs::metadata(&marker).map(|m| m.len()).unwrap_or(0);
    tokio::time::sleep(Duration::from_millis(400)).await;
    let size_b = std::fs::metadata(&marker).map(|m| m.len()).unwrap_or(0);
    assert_eq!(size_a, size_b, "grandchild survived group teardown");
}

#[tokio::test]
async fn non_json_stdout_is_buffered_but_ignored_by_decoder() {
    let result = supervise(
        sh("echo plain output; echo more"),
        &config(Duration::from_secs(10)),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(result.exit_code, 0);
    assert!(result.result_content.is_none());
    assert_eq!(result.stdout, "plain output\nmore\n");
}
