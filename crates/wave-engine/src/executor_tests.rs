use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use wave_core::types::{
    ArtifactDef, Contract, ContractKind, ExecConfig, InjectedArtifact, Manifest, OutputFormat,
    Persona, Pipeline, Step,
};
use wave_state::MemoryStateStore;

use super::*;

struct Harness {
    executor: Executor,
    store: Arc<dyn StateStore>,
    _tmp: TempDir,
    ws_root: PathBuf,
}

fn harness() -> Harness {
    let tmp = TempDir::new().unwrap();
    let ws_root = tmp.path().join("ws");
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let config = ExecutorConfig::new(tmp.path(), &ws_root);
    Harness {
        executor: Executor::new(Arc::clone(&store), config),
        store,
        _tmp: tmp,
        ws_root,
    }
}

fn harness_parallel(max_parallel: usize) -> Harness {
    let tmp = TempDir::new().unwrap();
    let ws_root = tmp.path().join("ws");
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let mut config = ExecutorConfig::new(tmp.path(), &ws_root);
    config.max_parallel = max_parallel;
    Harness {
        executor: Executor::new(Arc::clone(&store), config),
        store,
        _tmp: tmp,
        ws_root,
    }
}

fn persona(name: &str, adapter: &str) -> Persona {
    Persona {
        name: name.to_string(),
        adapter: adapter.to_string(),
        binary: None,
        model: None,
        temperature: None,
        system_prompt: None,
        system_prompt_path: None,
        allowed_tools: Vec::new(),
        denied_tools: Vec::new(),
        sandbox: None,
        env_passthrough: Vec::new(),
        skills: Vec::new(),
        max_subagents: None,
    }
}

fn step(id: &str, persona: &str, prompt: &str, deps: &[&str]) -> Step {
    Step {
        step_id: id.to_string(),
        persona: persona.to_string(),
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        workspace: Default::default(),
        memory: Default::default(),
        inject: Vec::new(),
        outputs: Vec::new(),
        exec: ExecConfig {
            prompt: prompt.to_string(),
            timeout_secs: 30,
            output_format: OutputFormat::Text,
        },
        contract: None,
    }
}

fn manifest(steps: Vec<Step>, personas: Vec<Persona>) -> Manifest {
    Manifest {
        pipeline: Pipeline {
            name: "test-pipeline".to_string(),
            description: String::new(),
            input_schema: None,
            steps,
            fail_fast: false,
        },
        personas,
    }
}

/// An executable shell script the process adapter can run as its binary.
fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

async fn run(
    h: &Harness,
    manifest: Manifest,
    input: &str,
) -> RunOutcome {
    h.executor
        .run(
            manifest,
            input,
            BTreeMap::new(),
            CancellationToken::new(),
        )
        .await
        .unwrap()
}

fn step_state(outcome: &RunOutcome, step_id: &str) -> StepState {
    outcome
        .steps
        .iter()
        .find(|s| s.step_id == step_id)
        .unwrap()
        .state
}

// ── Happy path ──────────────────────────────────────────────────────

#[tokio::test]
async fn single_mock_step_json_happy_path() {
    let h = harness();
    let mut s = step("analyze", "echo", r#"{{input}}"#, &[]);
    s.exec.output_format = OutputFormat::Json;
    let m = manifest(vec![s], vec![persona("echo", "mock")]);

    let outcome = run(&h, m, r#"{"ok":true}"#).await;
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.total_tokens, 15);
    assert_eq!(step_state(&outcome, "analyze"), StepState::Completed);

    let run_record = h.store.get_run(&outcome.run_id).await.unwrap().unwrap();
    assert_eq!(run_record.status, RunStatus::Completed);
    assert_eq!(run_record.total_tokens, 15);
    assert!(run_record.completed_at.is_some());
    assert!(run_record.error_message.is_none());

    let events = h.store.events_for_run(&outcome.run_id).await.unwrap();
    let states: Vec<&str> = events.iter().map(|e| e.state.as_str()).collect();
    assert!(states.contains(&"step_started"));
    assert!(states.contains(&"step_completed"));
    assert!(!states.iter().any(|s| s.contains("failed")));
}

#[tokio::test]
async fn event_timestamps_monotonic_and_step_ordered() {
    let h = harness();
    let m = manifest(
        vec![
            step("a", "echo", "one", &[]),
            step("b", "echo", "two", &["a"]),
        ],
        vec![persona("echo", "mock")],
    );

    let outcome = run(&h, m, "x").await;
    assert_eq!(outcome.status, RunStatus::Completed);

    let events = h.store.events_for_run(&outcome.run_id).await.unwrap();
    assert!(
        events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp),
        "timestamps must be non-decreasing within a run"
    );

    // Per step: step_started strictly before step_completed.
    for id in ["a", "b"] {
        let started = events
            .iter()
            .position(|e| e.step_id.as_deref() == Some(id) && e.state == "step_started")
            .unwrap();
        let finished = events
            .iter()
            .position(|e| e.step_id.as_deref() == Some(id) && e.state == "step_completed")
            .unwrap();
        assert!(started < finished, "{id}");
    }
}

// ── Artifacts ───────────────────────────────────────────────────────

#[tokio::test]
async fn artifact_flows_from_producer_to_consumer() {
    let h = harness();
    let script = write_script(
        h._tmp.path(),
        "producer.sh",
        "mkdir -p out && printf 'the spec body' > out/spec.md",
    );

    let mut producer_persona = persona("producer", "process");
    producer_persona.binary = Some(script);

    let mut a = step("analyze", "producer", "produce", &[]);
    a.outputs.push(ArtifactDef {
        name: "spec".to_string(),
        path: "out/spec.md".to_string(),
        content_type: "markdown".to_string(),
        required: true,
    });
    let mut b = step(
        "review",
        "echo",
        "review {{artifact:input-spec.md}}",
        &["analyze"],
    );
    b.inject.push(InjectedArtifact {
        from_step: "analyze".to_string(),
        artifact: "spec".to_string(),
        as_name: "input-spec.md".to_string(),
    });

    let m = manifest(vec![a, b], vec![producer_persona, persona("echo", "mock")]);
    let outcome = run(&h, m, "x").await;
    assert_eq!(outcome.status, RunStatus::Completed);

    // Byte-equal copy in the consumer's artifacts directory.
    let injected = h
        .ws_root
        .join("test-pipeline/review/artifacts/input-spec.md");
    assert_eq!(fs::read_to_string(injected).unwrap(), "the spec body");

    // The producer's artifact row records the real size.
    let artifacts = h
        .store
        .artifacts_for_run(&outcome.run_id, Some("analyze"))
        .await
        .unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].name, "spec");
    assert_eq!(artifacts[0].size, 13);
}

#[tokio::test]
async fn missing_required_artifact_fails_producer_and_skips_consumer() {
    let h = harness();
    // Echo adapter produces no files, so the required artifact is missing
    // even though the adapter exited cleanly.
    let mut a = step("analyze", "echo", "produce", &[]);
    a.outputs.push(ArtifactDef {
        name: "spec".to_string(),
        path: "out/spec.md".to_string(),
        content_type: "markdown".to_string(),
        required: true,
    });
    let mut b = step("review", "echo", "review {{artifact:s.md}}", &["analyze"]);
    b.inject.push(InjectedArtifact {
        from_step: "analyze".to_string(),
        artifact: "spec".to_string(),
        as_name: "s.md".to_string(),
    });

    let m = manifest(vec![a, b], vec![persona("echo", "mock")]);
    let outcome = run(&h, m, "x").await;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(step_state(&outcome, "analyze"), StepState::Failed);
    assert_eq!(step_state(&outcome, "review"), StepState::Skipped);

    let analyze = h
        .store
        .get_step(&outcome.run_id, "analyze")
        .await
        .unwrap()
        .unwrap();
    let message = analyze.error_message.unwrap();
    assert!(message.contains("required artifact 'spec' missing"), "{message}");
}

// ── Failure propagation ─────────────────────────────────────────────

#[tokio::test]
async fn failure_skips_transitive_dependents() {
    let h = harness();
    let error_record = r#"{"type":"result","subtype":"error_during_execution","result":"boom","usage":{"input_tokens":3,"output_tokens":1,"cache_read_input_tokens":0,"cache_creation_input_tokens":0}}"#;
    let script = write_script(
        h._tmp.path(),
        "fail.sh",
        &format!("echo '{error_record}'; exit 1"),
    );
    let mut failing = persona("failing", "process");
    failing.binary = Some(script);

    let m = manifest(
        vec![
            step("a", "failing", "x", &[]),
            step("b", "echo", "x", &["a"]),
            step("c", "echo", "x", &["b"]),
        ],
        vec![failing, persona("echo", "mock")],
    );

    let outcome = run(&h, m, "x").await;
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(step_state(&outcome, "a"), StepState::Failed);
    assert_eq!(step_state(&outcome, "b"), StepState::Skipped);
    assert_eq!(step_state(&outcome, "c"), StepState::Skipped);

    let run_record = h.store.get_run(&outcome.run_id).await.unwrap().unwrap();
    assert!(run_record.error_message.unwrap().contains("step 'a'"));
}

#[tokio::test]
async fn fail_fast_cancels_running_peers() {
    let h = harness_parallel(2);
    let slow = write_script(h._tmp.path(), "slow.sh", "sleep 30");
    let fail = write_script(h._tmp.path(), "fail.sh", "echo nope >&2; exit 2");

    let mut slow_persona = persona("slow", "process");
    slow_persona.binary = Some(slow);
    let mut fail_persona = persona("failing", "process");
    fail_persona.binary = Some(fail);

    let mut m = manifest(
        vec![
            step("doomed", "failing", "x", &[]),
            step("slowpoke", "slow", "x", &[]),
        ],
        vec![fail_persona, slow_persona],
    );
    m.pipeline.fail_fast = true;

    let started = Instant::now();
    let outcome = run(&h, m, "x").await;
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "fail-fast should not wait for the slow step"
    );
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(step_state(&outcome, "doomed"), StepState::Failed);
    assert_eq!(step_state(&outcome, "slowpoke"), StepState::Cancelled);
}

// ── Concurrency ─────────────────────────────────────────────────────

#[tokio::test]
async fn independent_steps_run_in_parallel() {
    let h = harness_parallel(2);
    let script = write_script(h._tmp.path(), "sleepy.sh", "sleep 1");
    let mut p = persona("sleepy", "process");
    p.binary = Some(script);

    let m = manifest(
        vec![step("a", "sleepy", "x", &[]), step("b", "sleepy", "x", &[])],
        vec![p],
    );

    let started = Instant::now();
    let outcome = run(&h, m, "x").await;
    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(
        started.elapsed() < Duration::from_millis(1800),
        "two 1s steps with parallelism 2 took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn serial_default_respects_dependency_order() {
    let h = harness();
    let m = manifest(
        vec![
            step("c", "echo", "x", &["b"]),
            step("a", "echo", "x", &[]),
            step("b", "echo", "x", &["a"]),
        ],
        vec![persona("echo", "mock")],
    );
    let outcome = run(&h, m, "x").await;
    assert_eq!(outcome.status, RunStatus::Completed);

    let events = h.store.events_for_run(&outcome.run_id).await.unwrap();
    let starts: Vec<&str> = events
        .iter()
        .filter(|e| e.state == "step_started")
        .filter_map(|e| e.step_id.as_deref())
        .collect();
    assert_eq!(starts, vec!["a", "b", "c"]);
}

// ── Cancellation ────────────────────────────────────────────────────

#[tokio::test]
async fn cancellation_marks_run_and_steps_cancelled() {
    let h = harness();
    let script = write_script(h._tmp.path(), "slow.sh", "sleep 30");
    let mut p = persona("slow", "process");
    p.binary = Some(script);
    let m = manifest(
        vec![
            step("running", "slow", "x", &[]),
            step("queued", "slow", "x", &["running"]),
        ],
        vec![p],
    );

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let outcome = h
        .executor
        .run(m, "x", BTreeMap::new(), cancel)
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert_eq!(step_state(&outcome, "running"), StepState::Cancelled);
    assert_eq!(step_state(&outcome, "queued"), StepState::Cancelled);

    let run_record = h.store.get_run(&outcome.run_id).await.unwrap().unwrap();
    assert!(run_record.cancelled_at.is_some());
}

// ── Contracts & retries ─────────────────────────────────────────────

#[tokio::test]
async fn contract_pass_completes_step() {
    let h = harness();
    let mut s = step("analyze", "echo", r#"{"verdict":"pass"}"#, &[]);
    s.exec.output_format = OutputFormat::Json;
    s.contract = Some(Contract {
        kind: ContractKind::Format {
            format: OutputFormat::Json,
        },
        must_pass: true,
        max_retries: 0,
    });
    let m = manifest(vec![s], vec![persona("echo", "mock")]);
    let outcome = run(&h, m, "x").await;
    assert_eq!(outcome.status, RunStatus::Completed);
}

#[tokio::test]
async fn contract_failure_retries_then_fails() {
    let h = harness();
    // The echo adapter returns the prompt itself, which is never JSON, so
    // every attempt fails the contract.
    let mut s = step("analyze", "echo", "definitely not json", &[]);
    s.contract = Some(Contract {
        kind: ContractKind::Format {
            format: OutputFormat::Json,
        },
        must_pass: true,
        max_retries: 2,
    });
    let m = manifest(vec![s], vec![persona("echo", "mock")]);

    let outcome = run(&h, m, "x").await;
    assert_eq!(outcome.status, RunStatus::Failed);

    let record = h
        .store
        .get_step(&outcome.run_id, "analyze")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, StepState::Failed);
    assert_eq!(record.retry_count, 2);
    assert!(record.error_message.unwrap().contains("contract failed"));

    // Each retry leaves a warning event.
    let events = h.store.events_for_run(&outcome.run_id).await.unwrap();
    let warnings = events.iter().filter(|e| e.state == "warning").count();
    assert!(warnings >= 2, "expected retry warnings, saw {warnings}");
}

#[tokio::test]
async fn advisory_contract_completes_with_warning() {
    let h = harness();
    let mut s = step("analyze", "echo", "prose output", &[]);
    s.contract = Some(Contract {
        kind: ContractKind::Format {
            format: OutputFormat::Json,
        },
        must_pass: false,
        max_retries: 0,
    });
    let m = manifest(vec![s], vec![persona("echo", "mock")]);

    let outcome = run(&h, m, "x").await;
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(step_state(&outcome, "analyze"), StepState::Completed);

    let events = h.store.events_for_run(&outcome.run_id).await.unwrap();
    assert!(
        events
            .iter()
            .any(|e| e.state == "warning" && e.message.contains("contract warning"))
    );
}

// ── Permission audit ────────────────────────────────────────────────

#[tokio::test]
async fn denied_tool_use_is_audited() {
    let h = harness();
    let transcript = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"rm -rf /tmp/x"}}],"usage":{"input_tokens":5,"output_tokens":1}}}
{"type":"result","subtype":"success","result":"done","usage":{"input_tokens":6,"output_tokens":2,"cache_read_input_tokens":0,"cache_creation_input_tokens":0}}"#;
    let script = write_script(h._tmp.path(), "agent.sh", &format!("cat <<'EOF'\n{transcript}\nEOF"));

    let mut p = persona("restricted", "process");
    p.binary = Some(script);
    p.allowed_tools = vec!["Read".into(), "Bash".into()];
    p.denied_tools = vec!["Bash(rm -rf*)".into()];

    let m = manifest(vec![step("audit", "restricted", "x", &[])], vec![p]);
    let outcome = run(&h, m, "x").await;
    assert_eq!(outcome.status, RunStatus::Completed);

    let events = h.store.events_for_run(&outcome.run_id).await.unwrap();
    let audit = events
        .iter()
        .find(|e| e.state == "warning" && e.message.contains("blocked by deny pattern"))
        .expect("expected a permission audit warning");
    assert!(audit.message.contains("Bash(rm -rf*)"), "{}", audit.message);
}

// ── Input schema ────────────────────────────────────────────────────

#[tokio::test]
async fn input_schema_rejects_bad_input() {
    let h = harness();
    let mut m = manifest(
        vec![step("a", "echo", "x", &[])],
        vec![persona("echo", "mock")],
    );
    m.pipeline.input_schema = Some(r#"{"type":"object","required":["task"]}"#.to_string());

    let err = h
        .executor
        .run(m, r#"{"not_task": 1}"#, BTreeMap::new(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InputRejected(_)));
}

// ── Resume ──────────────────────────────────────────────────────────

#[tokio::test]
async fn resume_of_terminal_run_is_a_no_op() {
    let h = harness();
    let m = manifest(
        vec![step("a", "echo", "x", &[])],
        vec![persona("echo", "mock")],
    );
    let outcome = run(&h, m.clone(), "x").await;
    assert_eq!(outcome.status, RunStatus::Completed);

    let events_before = h.store.events_for_run(&outcome.run_id).await.unwrap().len();
    let resumed = h
        .executor
        .resume(&outcome.run_id, m, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.total_tokens, outcome.total_tokens);

    let events_after = h.store.events_for_run(&outcome.run_id).await.unwrap().len();
    assert_eq!(events_before, events_after, "no-op resume must not write");
}

#[tokio::test]
async fn resume_reruns_interrupted_steps_and_honors_completed() {
    let h = harness();
    let m = manifest(
        vec![
            step("a", "echo", "one", &[]),
            step("b", "echo", "two", &["a"]),
        ],
        vec![persona("echo", "mock")],
    );

    // Simulate a crash: run record stuck running, step a completed, step b
    // was mid-flight.
    let run_id = "01TESTRESUME000000000000RR".to_string();
    let mut run_record = wave_state::RunRecord::new(&run_id, "test-pipeline", "x");
    run_record.status = RunStatus::Running;
    run_record.started_at = Some(chrono::Utc::now());
    run_record.total_tokens = 15;
    h.store.create_run(&run_record).await.unwrap();

    let mut a = wave_state::StepStateRecord::new(&run_id, "a");
    a.state = StepState::Completed;
    h.store.upsert_step(&a).await.unwrap();
    let mut b = wave_state::StepStateRecord::new(&run_id, "b");
    b.state = StepState::Running;
    b.retry_count = 1;
    h.store.upsert_step(&b).await.unwrap();

    let outcome = h
        .executor
        .resume(&run_id, m, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(step_state(&outcome, "a"), StepState::Completed);
    assert_eq!(step_state(&outcome, "b"), StepState::Completed);

    // Only b ran again: tokens grew by one mock invocation.
    let run_record = h.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run_record.total_tokens, 30);

    let events = h.store.events_for_run(&run_id).await.unwrap();
    let started: Vec<&str> = events
        .iter()
        .filter(|e| e.state == "step_started")
        .filter_map(|e| e.step_id.as_deref())
        .collect();
    assert_eq!(started, vec!["b"], "completed steps must not re-run");
}

#[tokio::test]
async fn resume_unknown_run_errors() {
    let h = harness();
    let m = manifest(
        vec![step("a", "echo", "x", &[])],
        vec![persona("echo", "mock")],
    );
    let err = h
        .executor
        .resume("01GHOST00000000000000000RR", m, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::RunNotFound(_)));
}

#[tokio::test]
async fn resume_rejects_mismatched_pipeline() {
    let h = harness();
    let run_id = "01TESTMISMATCH0000000000RR".to_string();
    let mut run_record = wave_state::RunRecord::new(&run_id, "other-pipeline", "x");
    run_record.status = RunStatus::Running;
    h.store.create_run(&run_record).await.unwrap();

    let m = manifest(
        vec![step("a", "echo", "x", &[])],
        vec![persona("echo", "mock")],
    );
    let err = h
        .executor
        .resume(&run_id, m, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PipelineMismatch { .. }));
}

// ── Performance records ─────────────────────────────────────────────

#[tokio::test]
async fn performance_metrics_recorded_per_step() {
    let h = harness();
    let m = manifest(
        vec![step("a", "echo", "x", &[])],
        vec![persona("echo", "mock")],
    );
    let outcome = run(&h, m, "x").await;

    let metrics = h
        .store
        .performance_for_run(&outcome.run_id)
        .await
        .unwrap();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].step_id, "a");
    assert_eq!(metrics[0].persona, "echo");
    assert!(metrics[0].success);
    assert_eq!(metrics[0].tokens_used, 15);
}
