//! Workspace allocation for agent isolation.
//!
//! Every managed instance gets its own git worktree, giving it an isolated
//! working directory and index while sharing the object store of the main
//! repository. Workspace paths are deterministic from the instance identity,
//! so no two live instances can collide on a checkout.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by workspace operations. Messages embed the failing git
/// command and its stderr so the root cause survives propagation.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// The configured repository path is not a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// A git subprocess could not be launched.
    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A git subprocess exited non-zero.
    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// A checkout could not be removed even after the forced-delete fallback.
    #[error("failed to remove checkout at {path}: {detail}")]
    RemovalFailed { path: PathBuf, detail: String },

    /// `git worktree list --porcelain` produced output we could not parse.
    #[error("failed to parse checkout list output: {0}")]
    ParseError(String),
}

/// One live checkout as reported by the VCS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutInfo {
    /// Absolute path of the checkout.
    pub path: PathBuf,
    /// HEAD commit SHA.
    pub head: String,
    /// Checked-out branch, if any.
    pub branch: Option<String>,
    /// HEAD is detached (no branch).
    pub detached: bool,
    /// The backing directory vanished out-of-band; eligible for pruning.
    pub prunable: bool,
}

/// Allocates and releases isolated checkouts for managed instances.
///
/// Git serialises worktree mutations through a lock file on the shared
/// object store, so all mutating operations here go through one internal
/// mutex rather than racing on that lock. Calls for the *same* workspace
/// are expected to be serialised by the caller (the supervisor owns each
/// instance exclusively).
#[derive(Debug)]
pub struct WorkspaceAllocator {
    /// Path to the main git repository.
    repo_path: PathBuf,
    /// Directory under which instance checkouts are created.
    checkout_base: PathBuf,
    git_lock: Arc<Mutex<()>>,
}

impl Clone for WorkspaceAllocator {
    fn clone(&self) -> Self {
        Self {
            repo_path: self.repo_path.clone(),
            checkout_base: self.checkout_base.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

impl WorkspaceAllocator {
    /// Create an allocator rooted at `repo_path`.
    ///
    /// `checkout_base` defaults to a sibling directory of the repository
    /// named `<repo-name>-agents`.
    ///
    /// # Errors
    ///
    /// [`WorkspaceError::NotAGitRepo`] if `repo_path` is not a git repo.
    pub fn new(
        repo_path: impl Into<PathBuf>,
        checkout_base: Option<PathBuf>,
    ) -> Result<Self, WorkspaceError> {
        let repo_path = repo_path.into();

        let output = Command::new("git")
            .arg("rev-parse")
            .arg("--git-dir")
            .current_dir(&repo_path)
            .output()
            .map_err(|e| WorkspaceError::GitCommand {
                message: "failed to run git rev-parse".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(WorkspaceError::NotAGitRepo(repo_path));
        }

        let checkout_base = checkout_base.unwrap_or_else(|| {
            let repo_name = repo_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("repo");
            let base_name = format!("{repo_name}-agents");
            repo_path
                .parent()
                .map(|p| p.join(&base_name))
                .unwrap_or_else(|| PathBuf::from(base_name))
        });

        Ok(Self {
            repo_path,
            checkout_base,
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Directory under which instance checkouts are created.
    pub fn checkout_base(&self) -> &Path {
        &self.checkout_base
    }

    /// The main repository path.
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Deterministic checkout path for an instance identity.
    pub fn path_for(&self, instance_id: Uuid) -> PathBuf {
        self.checkout_base.join(format!("agent-{instance_id}"))
    }

    /// Create a fresh isolated checkout for `instance_id`.
    ///
    /// Checks out `branch` when given (creating it from HEAD if it does not
    /// exist yet), otherwise a detached copy of the current HEAD. On failure
    /// the partially created directory is rolled back and stale worktree
    /// references are pruned before the error is returned.
    pub fn allocate(
        &self,
        instance_id: Uuid,
        branch: Option<&str>,
    ) -> Result<PathBuf, WorkspaceError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let checkout_path = self.path_for(instance_id);

        if !self.checkout_base.exists() {
            std::fs::create_dir_all(&self.checkout_base).map_err(|e| {
                WorkspaceError::GitCommand {
                    message: format!(
                        "failed to create checkout base directory: {}",
                        self.checkout_base.display()
                    ),
                    source: e,
                }
            })?;
        }

        let output = match branch {
            Some(branch) if self.branch_exists(branch)? => Command::new("git")
                .args(["worktree", "add"])
                .arg(&checkout_path)
                .arg(branch)
                .current_dir(&self.repo_path)
                .output(),
            Some(branch) => Command::new("git")
                .args(["worktree", "add", "-b"])
                .arg(branch)
                .arg(&checkout_path)
                .current_dir(&self.repo_path)
                .output(),
            None => Command::new("git")
                .args(["worktree", "add", "--detach"])
                .arg(&checkout_path)
                .current_dir(&self.repo_path)
                .output(),
        }
        .map_err(|e| WorkspaceError::GitCommand {
            message: "failed to run git worktree add".into(),
            source: e,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            self.rollback_partial(&checkout_path);
            return Err(WorkspaceError::GitExit {
                command: "worktree add".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        tracing::info!(
            instance_id = %instance_id,
            path = %checkout_path.display(),
            branch = branch.unwrap_or("<detached>"),
            "allocated workspace"
        );

        Ok(checkout_path)
    }

    /// Remove the checkout at `path`.
    ///
    /// `git worktree remove --force` is the primary mechanism; if git
    /// refuses, the directory is force-deleted and stale references pruned.
    /// Fails with [`WorkspaceError::RemovalFailed`] only when both paths
    /// fail.
    pub fn release(&self, path: &Path) -> Result<(), WorkspaceError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let output = Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(path)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorkspaceError::GitCommand {
                message: "failed to run git worktree remove".into(),
                source: e,
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if stderr.contains("is not a working tree") && !path.exists() {
            // Already gone; releasing twice is a caller-level no-op.
            return Ok(());
        }

        tracing::warn!(
            path = %path.display(),
            stderr = %stderr.trim(),
            "worktree remove failed, falling back to forced delete"
        );

        if path.exists() {
            if let Err(e) = std::fs::remove_dir_all(path) {
                return Err(WorkspaceError::RemovalFailed {
                    path: path.to_path_buf(),
                    detail: format!("git: {}; fs: {e}", stderr.trim()),
                });
            }
        }
        self.prune_locked()?;

        Ok(())
    }

    /// Query the VCS for all live checkouts of the repository, including the
    /// main working tree.
    pub fn list_allocated(&self) -> Result<Vec<CheckoutInfo>, WorkspaceError> {
        let output = Command::new("git")
            .args(["worktree", "list", "--porcelain"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorkspaceError::GitCommand {
                message: "failed to run git worktree list".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorkspaceError::GitExit {
                command: "worktree list".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_porcelain_output(&stdout)
    }

    /// Remove every checkout whose backing directory vanished out-of-band.
    pub fn prune_orphaned(&self) -> Result<(), WorkspaceError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.prune_locked()
    }

    /// `git worktree prune`; callers must hold `git_lock`.
    fn prune_locked(&self) -> Result<(), WorkspaceError> {
        let output = Command::new("git")
            .args(["worktree", "prune"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorkspaceError::GitCommand {
                message: "failed to run git worktree prune".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorkspaceError::GitExit {
                command: "worktree prune".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    fn branch_exists(&self, branch: &str) -> Result<bool, WorkspaceError> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify"])
            .arg(format!("refs/heads/{branch}"))
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorkspaceError::GitCommand {
                message: "failed to run git rev-parse --verify".into(),
                source: e,
            })?;

        Ok(output.status.success())
    }

    /// Best-effort rollback of a partially created checkout directory.
    fn rollback_partial(&self, path: &Path) {
        if path.exists() {
            tracing::warn!(
                path = %path.display(),
                "rolling back partial checkout directory"
            );
            let _ = std::fs::remove_dir_all(path);
        }
        let _ = self.prune_locked();
    }
}

/// Parse `git worktree list --porcelain` output.
///
/// Blocks are separated by blank lines:
///
/// ```text
/// worktree <path>
/// HEAD <sha>
/// branch refs/heads/<name> | detached
/// [prunable <reason>]
/// ```
fn parse_porcelain_output(output: &str) -> Result<Vec<CheckoutInfo>, WorkspaceError> {
    #[derive(Default)]
    struct Block {
        path: Option<PathBuf>,
        head: Option<String>,
        branch: Option<String>,
        detached: bool,
        prunable: bool,
    }

    fn commit(block: &mut Block, out: &mut Vec<CheckoutInfo>) -> Result<(), WorkspaceError> {
        let block = std::mem::take(block);
        let Some(path) = block.path else {
            return Ok(());
        };
        let head = block.head.ok_or_else(|| {
            WorkspaceError::ParseError(format!(
                "checkout entry for {} has no HEAD line",
                path.display()
            ))
        })?;
        out.push(CheckoutInfo {
            path,
            head,
            branch: block.branch,
            detached: block.detached,
            prunable: block.prunable,
        });
        Ok(())
    }

    let mut checkouts = Vec::new();
    let mut block = Block::default();

    for line in output.lines() {
        if line.is_empty() {
            commit(&mut block, &mut checkouts)?;
            continue;
        }

        if let Some(rest) = line.strip_prefix("worktree ") {
            block.path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            block.head = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            block.branch = Some(rest.strip_prefix("refs/heads/").unwrap_or(rest).to_string());
        } else if line == "detached" {
            block.detached = true;
        } else if line == "prunable" || line.starts_with("prunable ") {
            block.prunable = true;
        }
        // `bare`, `locked` and anything newer is ignored.
    }

    // Porcelain output may not end with a blank line.
    commit(&mut block, &mut checkouts)?;

    Ok(checkouts)
}
