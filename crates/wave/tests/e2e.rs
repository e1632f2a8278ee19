//! End-to-end tests driving the compiled `wave` binary.

use std::path::Path;
use std::process::Command;

use tempfile::TempDir;

const MANIFEST: &str = r#"
[pipeline]
name = "e2e-demo"
description = "Single mock step"

[[pipeline.steps]]
step_id = "analyze"
persona = "echo"
exec = { prompt = "{{input}}", timeout_secs = 30, output_format = "json" }

[[personas]]
name = "echo"
adapter = "mock"
"#;

fn wave(tmp: &TempDir) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_wave"));
    cmd.env("WAVE_STATE_DIR", tmp.path().join("state"));
    cmd.env("WAVE_LOG", "warn");
    cmd
}

fn write_manifest(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("pipeline.toml");
    std::fs::write(&path, MANIFEST).unwrap();
    path
}

#[test]
fn run_status_events_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let manifest = write_manifest(tmp.path());

    let output = wave(&tmp)
        .args(["run"])
        .arg(&manifest)
        .args(["--input", r#"{"ok":true}"#])
        .args(["--project-root"])
        .arg(tmp.path())
        .args(["--workspace-root"])
        .arg(tmp.path().join("ws"))
        .args(["--tag", "env=e2e"])
        .output()
        .unwrap();

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        output.status.success(),
        "run failed: {stdout}\n{}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(stdout.contains("status: completed"), "{stdout}");
    assert!(stdout.contains("tokens: 15"), "{stdout}");

    let run_id = stdout
        .lines()
        .find_map(|l| l.strip_prefix("run:"))
        .unwrap()
        .trim()
        .to_string();

    // Status shows the run and its aggregate.
    let status = wave(&tmp).args(["status"]).output().unwrap();
    let status_out = String::from_utf8_lossy(&status.stdout);
    assert!(status.status.success());
    assert!(status_out.contains("e2e-demo"), "{status_out}");
    assert!(status_out.contains(&run_id), "{status_out}");

    // The event log survived and carries the step lifecycle.
    let events = wave(&tmp).args(["events", &run_id]).output().unwrap();
    let events_out = String::from_utf8_lossy(&events.stdout);
    assert!(events.status.success());
    assert!(events_out.contains("step_started"), "{events_out}");
    assert!(events_out.contains("step_completed"), "{events_out}");
}

#[test]
fn failed_run_exits_nonzero() {
    let tmp = TempDir::new().unwrap();
    let manifest_path = tmp.path().join("pipeline.toml");
    // The mock echoes the prompt, which can never satisfy a JSON format
    // contract, so the run fails after the retry budget.
    std::fs::write(
        &manifest_path,
        r#"
[pipeline]
name = "e2e-fail"

[[pipeline.steps]]
step_id = "analyze"
persona = "echo"
exec = { prompt = "not json" }
contract = { kind = "format", format = "json", must_pass = true, max_retries = 0 }

[[personas]]
name = "echo"
adapter = "mock"
"#,
    )
    .unwrap();

    let output = wave(&tmp)
        .args(["run"])
        .arg(&manifest_path)
        .args(["--project-root"])
        .arg(tmp.path())
        .args(["--workspace-root"])
        .arg(tmp.path().join("ws"))
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("status: failed"), "{stdout}");
    assert!(stdout.contains("contract failed"), "{stdout}");
}

#[test]
fn invalid_manifest_is_rejected_before_any_state() {
    let tmp = TempDir::new().unwrap();
    let manifest_path = tmp.path().join("pipeline.toml");
    std::fs::write(
        &manifest_path,
        r#"
[pipeline]
name = "cyclic"

[[pipeline.steps]]
step_id = "a"
persona = "echo"
depends_on = ["b"]
exec = { prompt = "x" }

[[pipeline.steps]]
step_id = "b"
persona = "echo"
depends_on = ["a"]
exec = { prompt = "x" }

[[personas]]
name = "echo"
adapter = "mock"
"#,
    )
    .unwrap();

    let output = wave(&tmp)
        .args(["run"])
        .arg(&manifest_path)
        .args(["--project-root"])
        .arg(tmp.path())
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cycle"), "{stderr}");

    // No run was recorded.
    let status = wave(&tmp).args(["status"]).output().unwrap();
    let status_out = String::from_utf8_lossy(&status.stdout);
    assert!(status_out.contains("runs: 0"), "{status_out}");
}
