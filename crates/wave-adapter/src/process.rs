//! Child-process supervision.
//!
//! Children run in their own process group (`setsid` before exec) so
//! signals reach every descendant. Stdout is consumed line-by-line through
//! the stream decoder; stderr is buffered concurrently. Teardown is an
//! explicit two-phase protocol:
//!
//! ```text
//!   SIGTERM -> wait(grace 3s) -> SIGKILL -> drain stdout(1s) -> wait
//! ```
//!
//! The drain pass recovers diagnostics (token counts, subtype) the child
//! already wrote before it died.

use std::process::Stdio;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, warn};
use wave_core::error::{FailureReason, StepError};

use crate::classify::classify_exit;
use crate::config::{AdapterResult, AdapterRunConfig};
use crate::stream::{MAX_LINE_BYTES, StreamDecoder};

/// Grace between SIGTERM and SIGKILL.
pub const TERM_GRACE: Duration = Duration::from_secs(3);

/// Budget for draining already-emitted stdout after the kill.
pub const DRAIN_BUDGET: Duration = Duration::from_secs(1);

/// Cap on buffered stderr.
const MAX_STDERR_BYTES: u64 = 256 * 1024;

enum Ending {
    /// Stdout reached EOF; the child is exiting on its own.
    Eof,
    Timeout,
    Cancelled,
}

/// Spawn `cmd` in its own process group and supervise it to completion.
///
/// Returns `Ok` only for a zero exit; deadline expiry, cancellation and
/// non-zero exits surface as classified [`StepError`]s carrying best-effort
/// diagnostics recovered from the stream.
pub(crate) async fn supervise(
    mut cmd: Command,
    config: &AdapterRunConfig,
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<AdapterResult, StepError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // SAFETY: setsid() is async-signal-safe and runs before exec.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|e| {
        StepError::new(
            FailureReason::GeneralError,
            format!("failed to spawn adapter process: {e}"),
        )
    })?;

    let stdout = child.stdout.take().ok_or_else(|| {
        StepError::new(FailureReason::GeneralError, "child stdout was not piped")
    })?;
    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(stderr) = stderr {
            let _ = stderr.take(MAX_STDERR_BYTES).read_to_string(&mut buf).await;
        }
        buf
    });

    let mut frames = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let mut decoder = StreamDecoder::new();
    let mut stdout_buf = String::new();
    let deadline = Instant::now() + config.timeout;

    let ending = loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(line)) => {
                    stdout_buf.push_str(&line);
                    stdout_buf.push('\n');
                    for event in decoder.decode_line(&line) {
                        config.emit(&event);
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "stdout frame error; treating stream as closed");
                    break Ending::Eof;
                }
                None => break Ending::Eof,
            },
            _ = tokio::time::sleep_until(deadline) => break Ending::Timeout,
            _ = cancel.cancelled() => break Ending::Cancelled,
        }
    };

    match ending {
        Ending::Eof => {
            // Stdout closed; give the child until the deadline to exit.
            let status = tokio::select! {
                status = child.wait() => status,
                _ = tokio::time::sleep_until(deadline) => {
                    teardown(&mut child, &mut frames, &mut decoder, &mut stdout_buf, config).await;
                    return Err(deadline_error(&decoder, config, FailureReason::Timeout));
                }
                _ = cancel.cancelled() => {
                    teardown(&mut child, &mut frames, &mut decoder, &mut stdout_buf, config).await;
                    return Err(deadline_error(&decoder, config, FailureReason::Cancelled));
                }
            };
            let status = status.map_err(|e| {
                StepError::new(FailureReason::GeneralError, format!("wait failed: {e}"))
            })?;
            let stderr_buf = stderr_task.await.unwrap_or_default();
            finish(status_code(&status), decoder, stdout_buf, stderr_buf)
        }
        Ending::Timeout => {
            teardown(&mut child, &mut frames, &mut decoder, &mut stdout_buf, config).await;
            Err(deadline_error(&decoder, config, FailureReason::Timeout))
        }
        Ending::Cancelled => {
            teardown(&mut child, &mut frames, &mut decoder, &mut stdout_buf, config).await;
            Err(deadline_error(&decoder, config, FailureReason::Cancelled))
        }
    }
}

/// TERM the group, escalate to KILL after the grace period, then drain
/// stdout briefly to recover diagnostics, then reap.
async fn teardown(
    child: &mut Child,
    frames: &mut FramedRead<tokio::process::ChildStdout, LinesCodec>,
    decoder: &mut StreamDecoder,
    stdout_buf: &mut String,
    config: &AdapterRunConfig,
) {
    signal_group(child, libc::SIGTERM);

    let graceful = tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok();
    if !graceful {
        debug!("child ignored SIGTERM; escalating to SIGKILL");
        signal_group(child, libc::SIGKILL);
    }

    let drain_deadline = Instant::now() + DRAIN_BUDGET;
    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(line)) => {
                    stdout_buf.push_str(&line);
                    stdout_buf.push('\n');
                    for event in decoder.decode_line(&line) {
                        config.emit(&event);
                    }
                }
                _ => break,
            },
            _ = tokio::time::sleep_until(drain_deadline) => break,
        }
    }

    let _ = child.wait().await;
}

/// Broadcast a signal to the child's process group.
fn signal_group(child: &mut Child, signal: i32) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: kill() is async-signal-safe; a negative PID targets
            // the whole process group created by setsid.
            unsafe {
                libc::kill(-(pid as i32), signal);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal;
        let _ = child.start_kill();
    }
}

fn deadline_error(
    decoder: &StreamDecoder,
    config: &AdapterRunConfig,
    reason: FailureReason,
) -> StepError {
    let message = match reason {
        FailureReason::Timeout => format!(
            "deadline of {}s expired",
            config.timeout.as_secs()
        ),
        _ => "cancelled before completion".to_string(),
    };
    let mut err = StepError::new(reason, message).with_tokens(decoder.tokens_total());
    if let Some(subtype) = decoder.subtype() {
        err = err.with_subtype(subtype.as_str());
    }
    err
}

/// Exit code following UNIX conventions: `128 + signal` for
/// signal-terminated children.
fn status_code(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

fn finish(
    exit_code: i32,
    mut decoder: StreamDecoder,
    stdout: String,
    stderr: String,
) -> Result<AdapterResult, StepError> {
    let content = decoder.result_content().unwrap_or("").to_string();
    let subtype = decoder.subtype().cloned();

    if exit_code != 0 {
        let reason = classify_exit(exit_code, subtype.as_ref(), &content)
            .unwrap_or(FailureReason::GeneralError);
        let mut err = StepError::new(reason, failure_summary(&stdout, &stderr, exit_code))
            .with_tokens(decoder.tokens_total());
        if let Some(subtype) = &subtype {
            err = err.with_subtype(subtype.as_str());
        }
        return Err(err);
    }

    let failure = classify_exit(exit_code, subtype.as_ref(), &content);
    Ok(AdapterResult {
        exit_code,
        tokens_used: decoder.tokens_total(),
        result_content: decoder.result_content().map(String::from),
        subtype,
        files_modified: decoder.take_files_modified(),
        failure,
        format_warning: None,
        stdout,
    })
}

/// Summary for failed executions: last non-empty stdout line, else last
/// non-empty stderr line, else the exit code.
fn failure_summary(stdout: &str, stderr: &str, exit_code: i32) -> String {
    for source in [stdout, stderr] {
        if let Some(line) = source.lines().rev().find(|l| !l.trim().is_empty()) {
            return truncate(line.trim(), 200);
        }
    }
    format!("exit code {exit_code}")
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().nth(max).is_none() {
        s.to_string()
    } else {
        let shortened: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{shortened}...")
    }
}

#[cfg(test)]
#[path = "process_tests.rs"]
mod tests;
