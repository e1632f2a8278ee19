use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use wave_core::types::{ArtifactDef, Mount};

pub const DEFAULT_MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Directory names never copied into a workspace. Vendor, package and cache
/// trees dwarf the code they accompany and the agent can regenerate them.
pub const DEFAULT_SKIP_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "vendor",
    "dist",
    "build",
    "__pycache__",
    ".venv",
    ".cache",
];

/// Configuration for workspace materialization.
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// Root under which all workspaces live.
    pub root: PathBuf,

    /// Directory names skipped during mount copies.
    pub skip_dirs: Vec<String>,

    /// Files above this size are skipped (not partially copied) with a
    /// warning.
    pub max_file_bytes: u64,
}

impl WorkspaceConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            skip_dirs: DEFAULT_SKIP_DIRS.iter().map(|s| s.to_string()).collect(),
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("mount source '{0}' does not exist")]
    MissingMountSource(PathBuf),

    #[error("path '{path}' resolves outside the project root '{root}'")]
    PathTraversal { path: PathBuf, root: PathBuf },

    #[error("injected artifact '{artifact}' from step '{from_step}' missing at '{path}'")]
    InjectionSourceMissing {
        from_step: String,
        artifact: String,
        path: PathBuf,
    },

    #[error("invalid artifact name '{0}': must be a bare file name")]
    InvalidArtifactName(String),

    #[error("required artifact '{name}' missing at '{path}'")]
    ArtifactMissing { name: String, path: PathBuf },

    #[error("io error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl WorkspaceError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

type Result<T> = std::result::Result<T, WorkspaceError>;

/// A file skipped during materialization because it exceeded the size cap.
#[derive(Debug, Clone)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub size: u64,
}

/// Outcome of materializing a workspace.
#[derive(Debug)]
pub struct MaterializeReport {
    /// Absolute workspace path.
    pub path: PathBuf,
    pub skipped_files: Vec<SkippedFile>,
}

/// A declared output evaluated after step completion.
#[derive(Debug, Clone)]
pub struct OutputArtifact {
    pub name: String,
    /// Absolute path within the workspace.
    pub path: PathBuf,
    pub content_type: String,
    pub size: u64,
    pub exists: bool,
}

/// Materializes and cleans per-step workspace directories.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    config: WorkspaceConfig,
}

impl WorkspaceManager {
    pub fn new(config: WorkspaceConfig) -> Self {
        Self { config }
    }

    /// Absolute workspace path for `(pipeline_id, step_id)`.
    pub fn workspace_path(&self, pipeline_id: &str, step_id: &str) -> PathBuf {
        self.config.root.join(pipeline_id).join(step_id)
    }

    /// Create the workspace directory and apply the declared mounts.
    ///
    /// Mount sources are canonicalized before copying: a missing source is
    /// fatal, and a source resolving outside `project_root` is fatal. Files
    /// above the size cap are skipped and reported.
    pub fn create(
        &self,
        pipeline_id: &str,
        step_id: &str,
        mounts: &[Mount],
        project_root: &Path,
    ) -> Result<MaterializeReport> {
        let workspace = self.workspace_path(pipeline_id, step_id);
        fs::create_dir_all(&workspace).map_err(|e| WorkspaceError::io(&workspace, e))?;
        fs::create_dir_all(workspace.join("artifacts"))
            .map_err(|e| WorkspaceError::io(&workspace, e))?;

        let project_root = fs::canonicalize(project_root)
            .map_err(|e| WorkspaceError::io(project_root, e))?;

        let mut skipped_files = Vec::new();
        for mount in mounts {
            let source = resolve_mount_source(&mount.source, &project_root)?;
            let target_name = match &mount.target {
                Some(t) => t.clone(),
                None => source
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "mount".to_string()),
            };
            let dest = workspace.join(&target_name);

            if source.is_dir() {
                self.copy_tree(&source, &dest, &project_root, &mut skipped_files)?;
            } else {
                self.copy_file(&source, &dest, &mut skipped_files)?;
            }

            if mount.readonly {
                stamp_readonly(&dest)?;
            }

            debug!(
                source = %source.display(),
                dest = %dest.display(),
                readonly = mount.readonly,
                "mount materialized"
            );
        }

        Ok(MaterializeReport {
            path: workspace,
            skipped_files,
        })
    }

    /// Copy one upstream artifact into this workspace's `artifacts/` area
    /// under `as_name`. The source must exist.
    pub fn inject_artifact(
        &self,
        workspace: &Path,
        from_step: &str,
        artifact: &str,
        as_name: &str,
        source_path: &Path,
    ) -> Result<PathBuf> {
        if as_name.is_empty() || as_name.contains(['/', '\\']) || as_name.contains("..") {
            return Err(WorkspaceError::InvalidArtifactName(as_name.to_string()));
        }
        if !source_path.is_file() {
            return Err(WorkspaceError::InjectionSourceMissing {
                from_step: from_step.to_string(),
                artifact: artifact.to_string(),
                path: source_path.to_path_buf(),
            });
        }

        let dest_dir = workspace.join("artifacts");
        fs::create_dir_all(&dest_dir).map_err(|e| WorkspaceError::io(&dest_dir, e))?;
        let dest = dest_dir.join(as_name);
        fs::copy(source_path, &dest).map_err(|e| WorkspaceError::io(&dest, e))?;
        Ok(dest)
    }

    /// Evaluate each declared output after step completion. Required outputs
    /// that do not exist produce an artifact-missing error; optional ones
    /// are reported with `exists = false`.
    pub fn collect_outputs(
        &self,
        workspace: &Path,
        outputs: &[ArtifactDef],
    ) -> Result<Vec<OutputArtifact>> {
        let mut collected = Vec::with_capacity(outputs.len());
        for def in outputs {
            let path = workspace.join(&def.path);
            let size = fs::metadata(&path).map(|m| m.len()).ok();
            if size.is_none() && def.required {
                return Err(WorkspaceError::ArtifactMissing {
                    name: def.name.clone(),
                    path,
                });
            }
            collected.push(OutputArtifact {
                name: def.name.clone(),
                path,
                content_type: def.content_type.clone(),
                size: size.unwrap_or(0),
                exists: size.is_some(),
            });
        }
        Ok(collected)
    }

    /// Remove one step workspace. Read-only trees are made writable first so
    /// removal succeeds.
    pub fn cleanup_step(&self, pipeline_id: &str, step_id: &str) -> Result<()> {
        let workspace = self.workspace_path(pipeline_id, step_id);
        remove_tree(&workspace)
    }

    /// Remove every workspace belonging to a pipeline.
    pub fn cleanup_pipeline(&self, pipeline_id: &str) -> Result<()> {
        remove_tree(&self.config.root.join(pipeline_id))
    }

    fn copy_tree(
        &self,
        src: &Path,
        dst: &Path,
        project_root: &Path,
        skipped: &mut Vec<SkippedFile>,
    ) -> Result<()> {
        fs::create_dir_all(dst).map_err(|e| WorkspaceError::io(dst, e))?;

        let entries = fs::read_dir(src).map_err(|e| WorkspaceError::io(src, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| WorkspaceError::io(src, e))?;
            let name = entry.file_name();
            let src_path = entry.path();
            let file_type = entry
                .file_type()
                .map_err(|e| WorkspaceError::io(&src_path, e))?;

            // Symlinks are resolved before copying so the workspace holds
            // real files; a link escaping the project root is fatal.
            let resolved = if file_type.is_symlink() {
                let resolved = fs::canonicalize(&src_path)
                    .map_err(|e| WorkspaceError::io(&src_path, e))?;
                if !resolved.starts_with(project_root) {
                    return Err(WorkspaceError::PathTraversal {
                        path: resolved,
                        root: project_root.to_path_buf(),
                    });
                }
                resolved
            } else {
                src_path.clone()
            };

            let dst_path = dst.join(&name);
            if resolved.is_dir() {
                let dir_name = name.to_string_lossy();
                if self.config.skip_dirs.iter().any(|s| s == dir_name.as_ref()) {
                    debug!(dir = %src_path.display(), "skipping excluded directory");
                    continue;
                }
                self.copy_tree(&resolved, &dst_path, project_root, skipped)?;
            } else {
                self.copy_file(&resolved, &dst_path, skipped)?;
            }
        }
        Ok(())
    }

    fn copy_file(&self, src: &Path, dst: &Path, skipped: &mut Vec<SkippedFile>) -> Result<()> {
        let size = fs::metadata(src)
            .map_err(|e| WorkspaceError::io(src, e))?
            .len();
        if size > self.config.max_file_bytes {
            warn!(
                path = %src.display(),
                size,
                cap = self.config.max_file_bytes,
                "file exceeds copy cap; skipping"
            );
            skipped.push(SkippedFile {
                path: src.to_path_buf(),
                size,
            });
            return Ok(());
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| WorkspaceError::io(parent, e))?;
        }
        fs::copy(src, dst).map_err(|e| WorkspaceError::io(dst, e))?;
        Ok(())
    }
}

/// Resolve and vet a mount source path.
fn resolve_mount_source(source: &Path, project_root: &Path) -> Result<PathBuf> {
    let absolute = if source.is_absolute() {
        source.to_path_buf()
    } else {
        project_root.join(source)
    };
    if !absolute.exists() {
        return Err(WorkspaceError::MissingMountSource(source.to_path_buf()));
    }
    let resolved = fs::canonicalize(&absolute).map_err(|e| WorkspaceError::io(&absolute, e))?;
    if !resolved.starts_with(project_root) {
        return Err(WorkspaceError::PathTraversal {
            path: resolved,
            root: project_root.to_path_buf(),
        });
    }
    Ok(resolved)
}

/// Stamp a materialized tree read-only: files 0o444, directories 0o555.
fn stamp_readonly(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let meta = fs::metadata(path).map_err(|e| WorkspaceError::io(path, e))?;
        if meta.is_dir() {
            for entry in fs::read_dir(path).map_err(|e| WorkspaceError::io(path, e))? {
                let entry = entry.map_err(|e| WorkspaceError::io(path, e))?;
                stamp_readonly(&entry.path())?;
            }
            fs::set_permissions(path, fs::Permissions::from_mode(0o555))
                .map_err(|e| WorkspaceError::io(path, e))?;
        } else {
            fs::set_permissions(path, fs::Permissions::from_mode(0o444))
                .map_err(|e| WorkspaceError::io(path, e))?;
        }
    }
    #[cfg(not(unix))]
    {
        let mut perms = fs::metadata(path)
            .map_err(|e| WorkspaceError::io(path, e))?
            .permissions();
        perms.set_readonly(true);
        fs::set_permissions(path, perms).map_err(|e| WorkspaceError::io(path, e))?;
    }
    Ok(())
}

/// Remove a tree, restoring write permission first so read-only mounts do
/// not wedge cleanup.
fn remove_tree(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    make_writable(path)?;
    fs::remove_dir_all(path).map_err(|e| WorkspaceError::io(path, e))
}

fn make_writable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let meta = fs::symlink_metadata(path).map_err(|e| WorkspaceError::io(path, e))?;
        if meta.is_dir() {
            fs::set_permissions(path, fs::Permissions::from_mode(0o755))
                .map_err(|e| WorkspaceError::io(path, e))?;
            for entry in fs::read_dir(path).map_err(|e| WorkspaceError::io(path, e))? {
                let entry = entry.map_err(|e| WorkspaceError::io(path, e))?;
                make_writable(&entry.path())?;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
