// Branch/merge coordination over a shared git working tree
//
// The working tree and current branch are process-wide state, so every
// mutating operation goes through one coordinator holding an async mutex:
// agent work runs in parallel, integration runs strictly one merge at a
// time. Git itself is driven via subprocess commands, never reimplemented.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::{ForemanError, Result};

/// Options applied to a merge, composed in order: no-commit, squash, message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOptions {
    pub no_commit: bool,
    pub squash: bool,
    pub message: Option<String>,
}

/// Outcome of one merge attempt. `conflict_files` is empty on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    pub source: String,
    pub target: String,
    pub conflict_files: Vec<String>,
    /// Raw output of the underlying git merge command.
    pub tool_output: String,
}

impl MergeResult {
    pub fn success(&self) -> bool {
        self.conflict_files.is_empty()
    }
}

/// Where HEAD pointed before a speculative operation.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Checkout {
    Branch(String),
    Detached(String),
}

pub struct MergeCoordinator {
    repo_path: PathBuf,
    /// Serializes every mutating git operation. See module docs.
    op_lock: Mutex<()>,
}

impl MergeCoordinator {
    pub fn new(repo_path: impl AsRef<Path>) -> Self {
        Self {
            repo_path: repo_path.as_ref().to_path_buf(),
            op_lock: Mutex::new(()),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Merge `source` into `target`. Requires a valid repository and a clean
    /// working tree. Pull failures are ignored (local-only repositories have
    /// no remote). On conflict, raises `MergeConflict` with the file list.
    pub async fn merge_branch(
        &self,
        source: &str,
        target: &str,
        options: &MergeOptions,
    ) -> Result<MergeResult> {
        let _guard = self.op_lock.lock().await;
        self.ensure_repository().await?;
        self.ensure_clean_tree().await?;

        self.run_checked(&["checkout", target]).await?;

        // Local-only repos have no remote; a failed pull is not an error.
        let pull = self.run(&["pull", "--ff-only"]).await?;
        if !pull.status.success() {
            log::debug!(
                "[MergeCoordinator] pull failed (ignored): {}",
                String::from_utf8_lossy(&pull.stderr).trim()
            );
        }

        let mut args: Vec<String> = vec!["merge".to_string()];
        if options.no_commit {
            args.push("--no-commit".to_string());
        }
        if options.squash {
            args.push("--squash".to_string());
        }
        if let Some(message) = &options.message {
            args.push("-m".to_string());
            args.push(message.clone());
        }
        args.push(source.to_string());

        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let output = self.run(&arg_refs).await?;

        if output.status.success() {
            log::info!(
                "[MergeCoordinator] Merged '{}' into '{}'",
                source,
                target
            );
            return Ok(MergeResult {
                source: source.to_string(),
                target: target.to_string(),
                conflict_files: Vec::new(),
                tool_output: String::from_utf8_lossy(&output.stdout).to_string(),
            });
        }

        // Merge failed: distinguish conflicts from other git errors.
        let conflicts = self.conflicted_files().await?;
        if !conflicts.is_empty() {
            return Err(ForemanError::MergeConflict {
                source_branch: source.to_string(),
                target: target.to_string(),
                files: conflicts,
            });
        }
        Err(ForemanError::Git {
            command: "merge".to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Speculative conflict check: attempts a no-commit/no-ff merge, always
    /// aborts it, and restores whatever was checked out beforehand, detached
    /// HEAD included. Never mutates history.
    pub async fn can_merge(&self, source: &str, target: &str) -> Result<bool> {
        let _guard = self.op_lock.lock().await;
        self.ensure_repository().await?;
        self.ensure_clean_tree().await?;

        let original = self.current_checkout().await?;

        self.run_checked(&["checkout", target]).await?;
        let merge = self
            .run(&["merge", "--no-commit", "--no-ff", source])
            .await?;
        let clean = merge.status.success();

        // Undo the speculative merge regardless of how it ended.
        let _ = self.run(&["merge", "--abort"]).await;
        // A --no-commit merge that succeeded leaves staged changes behind.
        let _ = self.run(&["reset", "--hard", "HEAD"]).await;

        match &original {
            Checkout::Branch(name) => {
                self.run_checked(&["checkout", name]).await?;
            }
            Checkout::Detached(sha) => {
                self.run_checked(&["checkout", "--detach", sha]).await?;
            }
        }

        Ok(clean)
    }

    /// Currently conflicted files, if any.
    pub async fn get_conflicts(&self) -> Result<Vec<String>> {
        let _guard = self.op_lock.lock().await;
        self.conflicted_files().await
    }

    /// Abort an in-progress merge.
    pub async fn abort_merge(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.run_checked(&["merge", "--abort"]).await?;
        Ok(())
    }

    /// Commit a manually resolved merge. Refuses while conflicted files
    /// remain.
    pub async fn complete_merge(&self, message: &str) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let conflicts = self.conflicted_files().await?;
        if !conflicts.is_empty() {
            return Err(ForemanError::MergeConflict {
                source_branch: String::new(),
                target: String::new(),
                files: conflicts,
            });
        }
        self.run_checked(&["commit", "--no-edit", "-m", message])
            .await?;
        Ok(())
    }

    /// Whether a merge is currently in progress (MERGE_HEAD exists).
    pub async fn is_merge_in_progress(&self) -> Result<bool> {
        let output = self
            .run(&["rev-parse", "-q", "--verify", "MERGE_HEAD"])
            .await?;
        Ok(output.status.success())
    }

    /// Create a branch at the given start point.
    pub async fn create_branch(&self, name: &str, start_point: &str) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.ensure_repository().await?;
        let output = self.run(&["branch", name, start_point]).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if stderr.contains("already exists") {
            // Resuming a run reuses the item's branch.
            log::debug!("[MergeCoordinator] Branch '{}' already exists, reusing", name);
            return Ok(());
        }
        Err(ForemanError::Git {
            command: "branch".to_string(),
            stderr,
        })
    }

    /// Delete a branch after a successful merge.
    pub async fn delete_branch(&self, name: &str) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.run_checked(&["branch", "-D", name]).await?;
        Ok(())
    }

    async fn ensure_repository(&self) -> Result<()> {
        let output = self.run(&["rev-parse", "--git-dir"]).await?;
        if !output.status.success() {
            return Err(ForemanError::NotARepository {
                path: self.repo_path.clone(),
            });
        }
        Ok(())
    }

    async fn ensure_clean_tree(&self) -> Result<()> {
        let output = self.run_checked(&["status", "--porcelain"]).await?;
        if !output.stdout.is_empty() {
            return Err(ForemanError::DirtyTree {
                path: self.repo_path.clone(),
            });
        }
        Ok(())
    }

    async fn current_checkout(&self) -> Result<Checkout> {
        let output = self.run(&["symbolic-ref", "--short", "-q", "HEAD"]).await?;
        if output.status.success() {
            let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
            return Ok(Checkout::Branch(name));
        }
        let output = self.run_checked(&["rev-parse", "HEAD"]).await?;
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Checkout::Detached(sha))
    }

    async fn conflicted_files(&self) -> Result<Vec<String>> {
        let output = self
            .run_checked(&["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    async fn run(&self, args: &[&str]) -> Result<Output> {
        log::debug!(
            "[MergeCoordinator] git {} (in {})",
            args.join(" "),
            self.repo_path.display()
        );
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output()
            .await?;
        Ok(output)
    }

    async fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(ForemanError::Git {
                command: args.first().unwrap_or(&"git").to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(output)
    }
}

/// Render the user-facing remediation text for a merge conflict. This is
/// the only place conflict instructions are assembled.
pub fn format_conflict_guidance(source: &str, target: &str, files: &[String]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Merging '{}' into '{}' produced conflicts in {} file(s):\n",
        source,
        target,
        files.len()
    ));
    for file in files {
        out.push_str(&format!("  - {}\n", file));
    }
    out.push_str("\nResolve the conflicts in the files above, then complete the merge:\n");
    out.push_str(&format!(
        "  git add {} && git commit -m \"Merge {} into {}\"\n",
        files.join(" "),
        source,
        target
    ));
    out.push_str("\nOr abort and retry later:\n");
    out.push_str("  git merge --abort\n");
    out
}
