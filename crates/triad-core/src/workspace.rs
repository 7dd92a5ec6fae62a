use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::types::{AgentKey, JobId, SourceSpec};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("workspace already exists: {0}")]
    AlreadyExists(String),
    #[error("source not found: {0}")]
    SourceMissing(String),
    #[error("workspace quota exceeded: {size} bytes > {limit} bytes")]
    QuotaExceeded { size: u64, limit: u64 },
    #[error("git clone failed: {0}")]
    Git(String),
    #[error("path escapes workspace root: {0}")]
    OutsideRoot(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

// ---------------------------------------------------------------------------
// GitRunner trait (for testability)
// ---------------------------------------------------------------------------

/// Abstraction over git CLI operations so they can be mocked in tests.
pub trait GitRunner: Send + Sync {
    /// Run a git command in the given directory and return its outcome.
    fn run_git(&self, dir: &Path, args: &[&str]) -> std::result::Result<GitOutput, String>;
}

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Real git runner that shells out to the `git` binary.
pub struct RealGitRunner;

impl GitRunner for RealGitRunner {
    fn run_git(&self, dir: &Path, args: &[&str]) -> std::result::Result<GitOutput, String> {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| e.to_string())?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// WorkspaceManager
// ---------------------------------------------------------------------------

/// Allocates and releases per-job, per-agent filesystem sandboxes.
///
/// Each agent of a job gets its own materialized copy of the source tree at
/// `{root}/{job_id}/{agent_key}`; agents mutate their copies freely, so no
/// hardlink sharing. Workspaces are never reused across jobs.
pub struct WorkspaceManager {
    root: PathBuf,
    size_limit_bytes: u64,
    git: Box<dyn GitRunner>,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, size_limit_bytes: u64) -> Self {
        Self {
            root: root.into(),
            size_limit_bytes,
            git: Box::new(RealGitRunner),
        }
    }

    /// Create a manager with a custom git runner (for testing).
    pub fn with_git_runner(
        root: impl Into<PathBuf>,
        size_limit_bytes: u64,
        git: Box<dyn GitRunner>,
    ) -> Self {
        Self {
            root: root.into(),
            size_limit_bytes,
            git,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory that would hold the given agent's workspace.
    pub fn path_for(&self, job_id: &JobId, key: AgentKey) -> PathBuf {
        self.root.join(job_id.as_str()).join(key.as_str())
    }

    /// Materialize a fresh workspace for one agent.
    ///
    /// Fails closed when the target directory already exists non-empty.
    /// Remote sources are cloned shallow and single-branch; local sources
    /// are copied recursively. The size quota is checked before copying a
    /// local tree and after cloning a remote one (removing the clone when
    /// it is over budget). Quota breaches are not retryable.
    pub fn allocate(
        &self,
        job_id: &JobId,
        key: AgentKey,
        source: &SourceSpec,
    ) -> Result<PathBuf> {
        let target = self.path_for(job_id, key);

        if target.exists() && std::fs::read_dir(&target)?.next().is_some() {
            return Err(WorkspaceError::AlreadyExists(target.display().to_string()));
        }
        let parent = target
            .parent()
            .expect("workspace path always has a parent");
        std::fs::create_dir_all(parent)?;

        info!(job_id = %job_id, agent = %key, target = %target.display(), "allocating workspace");

        match source {
            SourceSpec::Local { path } => {
                if !path.is_dir() {
                    return Err(WorkspaceError::SourceMissing(path.display().to_string()));
                }
                let size = dir_size(path)?;
                if size > self.size_limit_bytes {
                    return Err(WorkspaceError::QuotaExceeded {
                        size,
                        limit: self.size_limit_bytes,
                    });
                }
                copy_tree(path, &target)?;
            }
            SourceSpec::Remote { url, branch } => {
                let mut args: Vec<&str> = vec!["clone", "--depth", "1", "--single-branch"];
                if let Some(branch) = branch {
                    args.push("--branch");
                    args.push(branch);
                }
                let target_str = target.to_string_lossy();
                args.push(url);
                args.push(&target_str);

                match self.git.run_git(parent, &args) {
                    Ok(out) if out.success => {}
                    Ok(out) => {
                        let _ = std::fs::remove_dir_all(&target);
                        return Err(WorkspaceError::Git(out.stderr.trim().to_string()));
                    }
                    Err(e) => {
                        let _ = std::fs::remove_dir_all(&target);
                        return Err(WorkspaceError::Git(e));
                    }
                }

                let size = dir_size(&target)?;
                if size > self.size_limit_bytes {
                    let _ = std::fs::remove_dir_all(&target);
                    return Err(WorkspaceError::QuotaExceeded {
                        size,
                        limit: self.size_limit_bytes,
                    });
                }
            }
        }

        Ok(target)
    }

    /// Remove one workspace directory. Idempotent: releasing a path that is
    /// already gone is a no-op. Paths outside the managed root are refused.
    pub fn release(&self, path: &Path) -> Result<()> {
        if !path.starts_with(&self.root) {
            return Err(WorkspaceError::OutsideRoot(path.display().to_string()));
        }
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the whole per-job directory (all agent workspaces). Idempotent.
    pub fn release_job(&self, job_id: &JobId) -> Result<()> {
        let dir = self.root.join(job_id.as_str());
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(job_id = %job_id, "workspaces released");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "workspace release failed");
                Err(e.into())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Total size of regular files under `path`, not following symlinks.
pub fn dir_size(path: &Path) -> std::io::Result<u64> {
    let mut total = 0u64;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.path().symlink_metadata()?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else if meta.is_file() {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

/// Recursive copy of a directory tree. Symlinks are skipped; agents get a
/// plain materialized copy they can mutate.
fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    let mut stack = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = stack.pop() {
        for entry in std::fs::read_dir(&from)? {
            let entry = entry?;
            let meta = entry.path().symlink_metadata()?;
            let target = to.join(entry.file_name());
            if meta.is_dir() {
                std::fs::create_dir_all(&target)?;
                stack.push((entry.path(), target));
            } else if meta.is_file() {
                std::fs::copy(entry.path(), &target)?;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
