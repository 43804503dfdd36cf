//! Git adapter used by the commit gate and the scheduler.
//!
//! The engine commits deterministically, so we keep a small, explicit wrapper around
//! `git` subprocess calls behind the [`GitClient`] trait.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Version-control operations the engine needs.
pub trait GitClient: Sync {
    /// Stage `pathspec` (the gate always stages `.`).
    fn add(&self, pathspec: &str) -> Result<()>;
    /// Commit staged changes. Returns `Ok(false)` when nothing was staged.
    fn commit(&self, message: &str) -> Result<bool>;
    /// Check out `branch`, creating it at HEAD when it does not exist yet.
    fn checkout_task_branch(&self, branch: &str) -> Result<()>;
}

/// Wrapper for executing git commands in a working directory.
///
/// Commits are serialized through an internal lock so parallel tasks never interleave
/// `add` and `commit`.
#[derive(Debug)]
pub struct Git {
    workdir: PathBuf,
    lock: Mutex<()>,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

impl GitClient for Git {
    fn add(&self, pathspec: &str) -> Result<()> {
        let _guard = self.guard();
        self.run_checked(&["add", "-A", "--", pathspec])?;
        Ok(())
    }

    #[instrument(skip_all)]
    fn commit(&self, message: &str) -> Result<bool> {
        let _guard = self.guard();
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!(message, "committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    #[instrument(skip_all, fields(branch))]
    fn checkout_task_branch(&self, branch: &str) -> Result<()> {
        let _guard = self.guard();
        if self.branch_exists(branch)? {
            debug!(branch, "checking out existing branch");
            self.run_checked(&["checkout", branch])?;
        } else {
            debug!(branch, "creating and checking out new branch");
            self.run_checked(&["checkout", "-b", branch])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn init_repo(root: &Path) -> Option<Git> {
        let git = Git::new(root);
        let steps: [&[&str]; 4] = [
            &["init", "-q"],
            &["config", "user.email", "ralph@example.test"],
            &["config", "user.name", "ralph"],
            &["commit", "-q", "--allow-empty", "-m", "init"],
        ];
        for args in steps {
            // Skip when git is unavailable in the test environment.
            git.run_checked(args).ok()?;
        }
        Some(git)
    }

    #[test]
    fn commit_reports_whether_anything_was_staged() {
        let temp = tempfile::tempdir().expect("tempdir");
        let Some(git) = init_repo(temp.path()) else {
            return;
        };
        git.add(".").expect("add");
        assert!(!git.commit("RALPH-T-1: nothing").expect("commit"));

        fs::write(temp.path().join("a.txt"), "a").expect("write");
        git.add(".").expect("add");
        assert!(git.commit("RALPH-T-1: add a").expect("commit"));
        let log = git.run_capture(&["log", "-1", "--format=%s"]).expect("log");
        assert_eq!(log.trim(), "RALPH-T-1: add a");
    }

    #[test]
    fn checkout_task_branch_creates_then_reuses() {
        let temp = tempfile::tempdir().expect("tempdir");
        let Some(git) = init_repo(temp.path()) else {
            return;
        };
        let original = git.current_branch().expect("branch");
        git.checkout_task_branch("ralph/T-1").expect("create");
        assert_eq!(git.current_branch().expect("branch"), "ralph/T-1");
        git.checkout_task_branch(&original).expect("back");
        git.checkout_task_branch("ralph/T-1").expect("reuse");
        assert!(git.branch_exists("ralph/T-1").expect("exists"));
    }
}
