//! Git worktree lifecycle for task isolation.
//!
//! Each task-execution attempt runs in its own worktree keyed by
//! `(agent, task)`, checked out from the project's integration branch on a
//! per-task feature branch. Worktrees share the object store of the main
//! repository but have independent working directories, so two agents can
//! never alias the same on-disk path.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use uuid::Uuid;

/// Directory that holds all agent worktrees, as a sibling of the project
/// root.
const WORKTREE_DIR_NAME: &str = ".git-worktrees";

/// Errors that can occur during workspace operations.
///
/// Creation failures are retryable: the attempt fails, the task is
/// released, and a later cycle tries again.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// The project path does not exist or is not a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// A git command failed to execute.
    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited with a non-zero status.
    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// Filesystem error while sweeping or cleaning.
    #[error("workspace filesystem error at {path}: {source}")]
    Fs {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// An isolated checkout for one task attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    /// Absolute path of the worktree directory.
    pub path: PathBuf,
    /// The feature branch checked out in the worktree.
    pub branch: String,
}

/// Manages the worktree tree under `<projectRoot>/../.git-worktrees/`.
///
/// Git does not support concurrent worktree mutations on one repository
/// (it locks the shared object store), so all mutating operations are
/// serialised through an internal mutex.
#[derive(Debug)]
pub struct WorkspaceManager {
    /// Path to the project's main repository.
    project_root: PathBuf,
    /// Branch worktrees are checked out from (`main` or configured).
    integration_branch: String,
    git_lock: Arc<Mutex<()>>,
}

impl Clone for WorkspaceManager {
    fn clone(&self) -> Self {
        Self {
            project_root: self.project_root.clone(),
            integration_branch: self.integration_branch.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

impl WorkspaceManager {
    /// Create a manager for a project.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::NotAGitRepo`] if `project_root` is not a
    /// git repository.
    pub fn new(
        project_root: impl Into<PathBuf>,
        integration_branch: impl Into<String>,
    ) -> Result<Self, WorkspaceError> {
        let project_root = project_root.into();

        let output = Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&project_root)
            .output()
            .map_err(|e| WorkspaceError::GitCommand {
                message: "failed to run git rev-parse".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(WorkspaceError::NotAGitRepo(project_root));
        }

        Ok(Self {
            project_root,
            integration_branch: integration_branch.into(),
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Base directory under which all worktrees are created: a sibling of
    /// the project root named `.git-worktrees`.
    pub fn worktree_base(&self) -> PathBuf {
        self.project_root
            .parent()
            .map(|p| p.join(WORKTREE_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from(WORKTREE_DIR_NAME))
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Worktree path for an `(agent, task)` pair:
    /// `<base>/agent-<id8>/task-<id8>`.
    pub fn workspace_path(&self, agent_id: Uuid, task_id: Uuid) -> PathBuf {
        self.worktree_base()
            .join(format!("agent-{}", short_id(agent_id)))
            .join(format!("task-{}", short_id(task_id)))
    }

    /// Feature branch name for a task: `feature/<agentName>/task-<taskId>`.
    pub fn branch_name(agent_name: &str, task_id: Uuid) -> String {
        format!("feature/{agent_name}/task-{task_id}")
    }

    /// Create the worktree for a task attempt, checked out from the
    /// integration branch on a fresh feature branch.
    ///
    /// Idempotent: if the worktree already exists at the expected path it
    /// is reused (a retried attempt continues on the same branch). Partial
    /// state from a failed creation is cleaned up on a best-effort basis.
    pub fn create(
        &self,
        agent_id: Uuid,
        agent_name: &str,
        task_id: Uuid,
    ) -> Result<Workspace, WorkspaceError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let path = self.workspace_path(agent_id, task_id);
        let branch = Self::branch_name(agent_name, task_id);

        if path.exists() {
            tracing::info!(
                path = %path.display(),
                branch = %branch,
                "worktree already exists, reusing"
            );
            return Ok(Workspace { path, branch });
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WorkspaceError::Fs {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let branch_exists = self.branch_exists(&branch)?;

        let output = if branch_exists {
            // Retry after a swept worktree: check out the surviving branch.
            Command::new("git")
                .args(["worktree", "add"])
                .arg(&path)
                .arg(&branch)
                .current_dir(&self.project_root)
                .output()
        } else {
            Command::new("git")
                .args(["worktree", "add", "-b"])
                .arg(&branch)
                .arg(&path)
                .arg(&self.integration_branch)
                .current_dir(&self.project_root)
                .output()
        }
        .map_err(|e| WorkspaceError::GitCommand {
            message: "failed to run git worktree add".into(),
            source: e,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            self.cleanup_partial(&path);
            return Err(WorkspaceError::GitExit {
                command: "worktree add".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(Workspace { path, branch })
    }

    /// Remove a worktree and prune its registration.
    ///
    /// Idempotent: removing a path that is not a registered worktree (or
    /// does not exist at all) is a no-op.
    pub fn remove(&self, path: &Path) -> Result<(), WorkspaceError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.remove_locked(path)
    }

    fn remove_locked(&self, path: &Path) -> Result<(), WorkspaceError> {
        let output = Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(path)
            .current_dir(&self.project_root)
            .output()
            .map_err(|e| WorkspaceError::GitCommand {
                message: "failed to run git worktree remove".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("is not a working tree") || stderr.contains("No such file") {
                // Not registered. Clean up a stray directory if present.
                if path.exists() {
                    tracing::warn!(
                        path = %path.display(),
                        "directory exists but is not a registered worktree, removing"
                    );
                    let _ = std::fs::remove_dir_all(path);
                }
                let _ = self.prune();
                return Ok(());
            }
            return Err(WorkspaceError::GitExit {
                command: "worktree remove".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        // Drop the now-empty agent directory so the sweep does not see it.
        if let Some(parent) = path.parent() {
            let _ = std::fs::remove_dir(parent);
        }

        Ok(())
    }

    /// Remove worktrees older than the cutoff (scheduler orphan sweep).
    ///
    /// Age is judged by the worktree directory's modification time.
    /// Returns the paths removed.
    pub fn sweep_orphans(&self, older_than: Duration) -> Result<Vec<PathBuf>, WorkspaceError> {
        let base = self.worktree_base();
        if !base.exists() {
            return Ok(Vec::new());
        }

        let cutoff = SystemTime::now() - older_than;
        let mut removed = Vec::new();

        let agent_dirs = std::fs::read_dir(&base).map_err(|e| WorkspaceError::Fs {
            path: base.clone(),
            source: e,
        })?;

        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        for agent_dir in agent_dirs.flatten() {
            let task_dirs = match std::fs::read_dir(agent_dir.path()) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for task_dir in task_dirs.flatten() {
                let path = task_dir.path();
                let modified = task_dir
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                if modified < cutoff {
                    tracing::info!(path = %path.display(), "sweeping orphan worktree");
                    if self.remove_locked(&path).is_ok() {
                        removed.push(path);
                    }
                }
            }
            // Remove agent directories emptied by the sweep.
            let _ = std::fs::remove_dir(agent_dir.path());
        }

        Ok(removed)
    }

    /// Delete a task's feature branch after its pull request merges.
    ///
    /// Idempotent: deleting a branch that does not exist is a no-op.
    pub fn delete_branch(&self, branch: &str) -> Result<(), WorkspaceError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let output = Command::new("git")
            .args(["branch", "-D", branch])
            .current_dir(&self.project_root)
            .output()
            .map_err(|e| WorkspaceError::GitCommand {
                message: "failed to run git branch -D".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("not found") {
                return Ok(());
            }
            return Err(WorkspaceError::GitExit {
                command: "branch -D".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    /// Check whether a branch exists in the repository.
    pub fn branch_exists(&self, branch: &str) -> Result<bool, WorkspaceError> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify"])
            .arg(format!("refs/heads/{branch}"))
            .current_dir(&self.project_root)
            .output()
            .map_err(|e| WorkspaceError::GitCommand {
                message: "failed to run git rev-parse --verify".into(),
                source: e,
            })?;

        Ok(output.status.success())
    }

    /// Prune stale worktree registrations whose directories are gone.
    pub fn prune(&self) -> Result<(), WorkspaceError> {
        let output = Command::new("git")
            .args(["worktree", "prune"])
            .current_dir(&self.project_root)
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

    fn cleanup_partial(&self, path: &Path) {
        if path.exists() {
            tracing::warn!(
                path = %path.display(),
                "cleaning up partial worktree directory"
            );
            let _ = std::fs::remove_dir_all(path);
        }
        let _ = self.prune();
    }
}

/// First eight hex characters of a UUID, used in worktree path segments.
fn short_id(id: Uuid) -> String {
    id.simple().to_string()[..8].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Create a temporary git repository with an initial commit on `main`.
    fn create_temp_repo() -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("failed to create temp dir");
        // Nest the repo one level down so the worktree base lands inside
        // the TempDir rather than in the system temp root.
        let repo_path = dir.path().join("project");
        std::fs::create_dir(&repo_path).unwrap();

        let run = |args: &[&str]| {
            let output = Command::new("git")
                .args(args)
                .current_dir(&repo_path)
                .output()
                .unwrap_or_else(|e| panic!("git {} failed: {e}", args.join(" ")));
            assert!(
                output.status.success(),
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            );
        };

        run(&["init", "-b", "main"]);
        run(&["config", "user.email", "test@foreman.dev"]);
        run(&["config", "user.name", "Foreman Test"]);
        std::fs::write(repo_path.join("README.md"), "# Test\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "Initial commit"]);

        (dir, repo_path)
    }

    #[test]
    fn new_rejects_non_repo() {
        let dir = TempDir::new().unwrap();
        let result = WorkspaceManager::new(dir.path(), "main");
        assert!(matches!(result, Err(WorkspaceError::NotAGitRepo(_))));
    }

    #[test]
    fn worktree_base_is_sibling_of_project() {
        let (_dir, repo) = create_temp_repo();
        let mgr = WorkspaceManager::new(&repo, "main").unwrap();
        assert_eq!(
            mgr.worktree_base(),
            repo.parent().unwrap().join(".git-worktrees")
        );
    }

    #[test]
    fn branch_name_format() {
        let task_id = Uuid::new_v4();
        assert_eq!(
            WorkspaceManager::branch_name("rust-dev", task_id),
            format!("feature/rust-dev/task-{task_id}")
        );
    }

    #[test]
    fn create_checks_out_integration_branch_content() {
        let (_dir, repo) = create_temp_repo();
        let mgr = WorkspaceManager::new(&repo, "main").unwrap();

        let agent_id = Uuid::new_v4();
        let task_id = Uuid::new_v4();
        let ws = mgr.create(agent_id, "worker", task_id).expect("create failed");

        assert!(ws.path.exists());
        assert!(ws.path.join("README.md").exists());
        assert_eq!(ws.branch, WorkspaceManager::branch_name("worker", task_id));

        // Path encodes both ids.
        let path_str = ws.path.to_string_lossy().into_owned();
        assert!(path_str.contains(&format!("agent-{}", short_id(agent_id))));
        assert!(path_str.contains(&format!("task-{}", short_id(task_id))));
    }

    #[test]
    fn create_is_idempotent() {
        let (_dir, repo) = create_temp_repo();
        let mgr = WorkspaceManager::new(&repo, "main").unwrap();

        let agent_id = Uuid::new_v4();
        let task_id = Uuid::new_v4();
        let ws1 = mgr.create(agent_id, "worker", task_id).unwrap();
        let ws2 = mgr.create(agent_id, "worker", task_id).unwrap();
        assert_eq!(ws1, ws2);
    }

    #[test]
    fn different_tasks_never_share_a_worktree() {
        let (_dir, repo) = create_temp_repo();
        let mgr = WorkspaceManager::new(&repo, "main").unwrap();

        let agent_id = Uuid::new_v4();
        let ws1 = mgr.create(agent_id, "worker", Uuid::new_v4()).unwrap();
        let ws2 = mgr.create(agent_id, "worker", Uuid::new_v4()).unwrap();
        assert_ne!(ws1.path, ws2.path);
    }

    #[test]
    fn worktree_edits_are_isolated_from_project() {
        let (_dir, repo) = create_temp_repo();
        let mgr = WorkspaceManager::new(&repo, "main").unwrap();

        let ws = mgr.create(Uuid::new_v4(), "worker", Uuid::new_v4()).unwrap();
        std::fs::write(ws.path.join("agent-output.txt"), "work\n").unwrap();
        assert!(!repo.join("agent-output.txt").exists());
    }

    #[test]
    fn remove_is_idempotent() {
        let (_dir, repo) = create_temp_repo();
        let mgr = WorkspaceManager::new(&repo, "main").unwrap();

        let ws = mgr.create(Uuid::new_v4(), "worker", Uuid::new_v4()).unwrap();
        mgr.remove(&ws.path).expect("first remove failed");
        assert!(!ws.path.exists());
        mgr.remove(&ws.path).expect("second remove should be a no-op");
    }

    #[test]
    fn create_after_remove_reuses_surviving_branch() {
        let (_dir, repo) = create_temp_repo();
        let mgr = WorkspaceManager::new(&repo, "main").unwrap();

        let agent_id = Uuid::new_v4();
        let task_id = Uuid::new_v4();
        let ws1 = mgr.create(agent_id, "worker", task_id).unwrap();
        mgr.remove(&ws1.path).unwrap();

        // The branch survives removal; a retry attempt checks it out again.
        let ws2 = mgr.create(agent_id, "worker", task_id).unwrap();
        assert_eq!(ws1.branch, ws2.branch);
        assert!(ws2.path.exists());
    }

    #[test]
    fn sweep_removes_only_old_worktrees() {
        let (_dir, repo) = create_temp_repo();
        let mgr = WorkspaceManager::new(&repo, "main").unwrap();

        let ws = mgr.create(Uuid::new_v4(), "worker", Uuid::new_v4()).unwrap();

        // Nothing is older than an hour yet.
        let removed = mgr.sweep_orphans(Duration::from_secs(3600)).unwrap();
        assert!(removed.is_empty());
        assert!(ws.path.exists());

        // With a zero cutoff everything is an orphan.
        let removed = mgr.sweep_orphans(Duration::ZERO).unwrap();
        assert_eq!(removed, vec![ws.path.clone()]);
        assert!(!ws.path.exists());
    }

    #[test]
    fn delete_branch_is_idempotent() {
        let (_dir, repo) = create_temp_repo();
        let mgr = WorkspaceManager::new(&repo, "main").unwrap();

        let task_id = Uuid::new_v4();
        let ws = mgr.create(Uuid::new_v4(), "worker", task_id).unwrap();
        mgr.remove(&ws.path).unwrap();

        assert!(mgr.branch_exists(&ws.branch).unwrap());
        mgr.delete_branch(&ws.branch).unwrap();
        assert!(!mgr.branch_exists(&ws.branch).unwrap());
        mgr.delete_branch(&ws.branch)
            .expect("deleting a missing branch should not fail");
    }
}
