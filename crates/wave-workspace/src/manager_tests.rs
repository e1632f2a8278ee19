use std::fs;
use std::path::Path;

use tempfile::TempDir;
use wave_core::types::{ArtifactDef, Mount};

use super::*;

fn manager(root: &Path) -> WorkspaceManager {
    WorkspaceManager::new(WorkspaceConfig::new(root))
}

fn mount(source: &Path, readonly: bool) -> Mount {
    Mount {
        source: source.to_path_buf(),
        target: None,
        readonly,
    }
}

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

#[test]
fn create_makes_workspace_and_artifacts_dir() {
    let tmp = TempDir::new().unwrap();
    let ws_root = tmp.path().join("ws");
    let report = manager(&ws_root)
        .create("review", "analyze", &[], tmp.path())
        .unwrap();

    assert_eq!(report.path, ws_root.join("review").join("analyze"));
    assert!(report.path.join("artifacts").is_dir());
    assert!(report.skipped_files.is_empty());
}

#[test]
fn workspace_path_is_stable() {
    let tmp = TempDir::new().unwrap();
    let m = manager(tmp.path());
    assert_eq!(
        m.workspace_path("review", "analyze"),
        m.workspace_path("review", "analyze")
    );
}

#[test]
fn mount_copies_tree_recursively() {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path().join("project");
    write(&project.join("src/main.rs"), "fn main() {}");
    write(&project.join("README.md"), "# hello");

    let m = manager(&tmp.path().join("ws"));
    let report = m
        .create("p", "s", &[mount(&project, false)], tmp.path())
        .unwrap();

    assert_eq!(
        fs::read_to_string(report.path.join("project/src/main.rs")).unwrap(),
        "fn main() {}"
    );
    assert_eq!(
        fs::read_to_string(report.path.join("project/README.md")).unwrap(),
        "# hello"
    );
}

#[test]
fn mount_respects_target_name() {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path().join("project");
    write(&project.join("a.txt"), "a");

    let m = manager(&tmp.path().join("ws"));
    let report = m
        .create(
            "p",
            "s",
            &[Mount {
                source: project,
                target: Some("code".to_string()),
                readonly: false,
            }],
            tmp.path(),
        )
        .unwrap();

    assert!(report.path.join("code/a.txt").is_file());
}

#[test]
fn skip_dirs_are_not_copied() {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path().join("project");
    write(&project.join("src/lib.rs"), "");
    write(&project.join("node_modules/pkg/index.js"), "junk");
    write(&project.join("target/debug/bin"), "junk");

    let m = manager(&tmp.path().join("ws"));
    let report = m
        .create("p", "s", &[mount(&project, false)], tmp.path())
        .unwrap();

    assert!(report.path.join("project/src/lib.rs").is_file());
    assert!(!report.path.join("project/node_modules").exists());
    assert!(!report.path.join("project/target").exists());
}

#[test]
fn oversized_file_skipped_not_truncated() {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path().join("project");
    write(&project.join("small.txt"), "ok");
    write(&project.join("big.bin"), &"x".repeat(128));

    let mut config = WorkspaceConfig::new(tmp.path().join("ws"));
    config.max_file_bytes = 64;
    let m = WorkspaceManager::new(config);

    let report = m
        .create("p", "s", &[mount(&project, false)], tmp.path())
        .unwrap();

    assert!(report.path.join("project/small.txt").is_file());
    // Skipped entirely — no partial copy on disk.
    assert!(!report.path.join("project/big.bin").exists());
    assert_eq!(report.skipped_files.len(), 1);
    assert_eq!(report.skipped_files[0].size, 128);
}

#[test]
fn missing_mount_source_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let m = manager(&tmp.path().join("ws"));
    let err = m
        .create(
            "p",
            "s",
            &[mount(&tmp.path().join("does-not-exist"), false)],
            tmp.path(),
        )
        .unwrap_err();
    assert!(matches!(err, WorkspaceError::MissingMountSource(_)));
}

#[cfg(unix)]
#[test]
fn symlink_escaping_project_root_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    write(&outside.path().join("secret.txt"), "secret");

    let project = tmp.path().join("project");
    write(&project.join("ok.txt"), "ok");
    std::os::unix::fs::symlink(
        outside.path().join("secret.txt"),
        project.join("escape.txt"),
    )
    .unwrap();

    let m = manager(&tmp.path().join("ws"));
    let err = m
        .create("p", "s", &[mount(&project, false)], tmp.path())
        .unwrap_err();
    assert!(matches!(err, WorkspaceError::PathTraversal { .. }));
}

#[cfg(unix)]
#[test]
fn internal_symlink_is_resolved_and_copied() {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path().join("project");
    write(&project.join("real.txt"), "content");
    std::os::unix::fs::symlink(project.join("real.txt"), project.join("link.txt")).unwrap();

    let m = manager(&tmp.path().join("ws"));
    let report = m
        .create("p", "s", &[mount(&project, false)], tmp.path())
        .unwrap();

    let copied = report.path.join("project/link.txt");
    assert!(copied.is_file());
    assert!(!copied.is_symlink());
    assert_eq!(fs::read_to_string(copied).unwrap(), "content");
}

#[cfg(unix)]
#[test]
fn readonly_mount_is_stamped() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = TempDir::new().unwrap();
    let project = tmp.path().join("project");
    write(&project.join("src/lib.rs"), "");

    let m = manager(&tmp.path().join("ws"));
    let report = m
        .create("p", "s", &[mount(&project, true)], tmp.path())
        .unwrap();

    let file_mode = fs::metadata(report.path.join("project/src/lib.rs"))
        .unwrap()
        .permissions()
        .mode();
    let dir_mode = fs::metadata(report.path.join("project/src"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(file_mode & 0o777, 0o444);
    assert_eq!(dir_mode & 0o777, 0o555);
}

#[test]
fn inject_artifact_copies_bytes() {
    let tmp = TempDir::new().unwrap();
    let m = manager(&tmp.path().join("ws"));
    let report = m.create("p", "consumer", &[], tmp.path()).unwrap();

    let source = tmp.path().join("producer-out/spec.md");
    write(&source, "# the spec");

    let dest = m
        .inject_artifact(&report.path, "analyze", "spec", "input-spec.md", &source)
        .unwrap();
    assert_eq!(dest, report.path.join("artifacts/input-spec.md"));
    assert_eq!(fs::read_to_string(&dest).unwrap(), "# the spec");
}

#[test]
fn inject_missing_artifact_fails() {
    let tmp = TempDir::new().unwrap();
    let m = manager(&tmp.path().join("ws"));
    let report = m.create("p", "consumer", &[], tmp.path()).unwrap();

    let err = m
        .inject_artifact(
            &report.path,
            "analyze",
            "spec",
            "input-spec.md",
            &tmp.path().join("missing.md"),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        WorkspaceError::InjectionSourceMissing { from_step, .. } if from_step == "analyze"
    ));
}

#[test]
fn inject_rejects_traversal_names() {
    let tmp = TempDir::new().unwrap();
    let m = manager(&tmp.path().join("ws"));
    let report = m.create("p", "s", &[], tmp.path()).unwrap();
    let source = tmp.path().join("a.md");
    write(&source, "x");

    for bad in ["../escape.md", "a/b.md", ""] {
        let err = m
            .inject_artifact(&report.path, "x", "y", bad, &source)
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::InvalidArtifactName(_)), "{bad}");
    }
}

#[test]
fn collect_outputs_records_sizes() {
    let tmp = TempDir::new().unwrap();
    let m = manager(&tmp.path().join("ws"));
    let report = m.create("p", "s", &[], tmp.path()).unwrap();
    write(&report.path.join("out/spec.md"), "12345");

    let defs = vec![
        ArtifactDef {
            name: "spec".into(),
            path: "out/spec.md".into(),
            content_type: "markdown".into(),
            required: true,
        },
        ArtifactDef {
            name: "notes".into(),
            path: "out/notes.md".into(),
            content_type: "markdown".into(),
            required: false,
        },
    ];

    let collected = m.collect_outputs(&report.path, &defs).unwrap();
    assert_eq!(collected.len(), 2);
    assert!(collected[0].exists);
    assert_eq!(collected[0].size, 5);
    assert!(!collected[1].exists);
    assert_eq!(collected[1].size, 0);
}

#[test]
fn missing_required_output_errors() {
    let tmp = TempDir::new().unwrap();
    let m = manager(&tmp.path().join("ws"));
    let report = m.create("p", "s", &[], tmp.path()).unwrap();

    let defs = vec![ArtifactDef {
        name: "spec".into(),
        path: "out/spec.md".into(),
        content_type: "markdown".into(),
        required: true,
    }];

    let err = m.collect_outputs(&report.path, &defs).unwrap_err();
    assert!(matches!(
        err,
        WorkspaceError::ArtifactMissing { name, .. } if name == "spec"
    ));
}

#[test]
fn cleanup_removes_readonly_trees() {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path().join("project");
    write(&project.join("a.txt"), "a");

    let m = manager(&tmp.path().join("ws"));
    let report = m
        .create("p", "s", &[mount(&project, true)], tmp.path())
        .unwrap();
    assert!(report.path.exists());

    m.cleanup_step("p", "s").unwrap();
    assert!(!report.path.exists());

    // Removing an already-clean pipeline is a no-op.
    m.cleanup_pipeline("p").unwrap();
}
