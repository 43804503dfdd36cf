//! Executor abstraction and the policy-gated sandbox.
//!
//! The [`Executor`] trait is the only way iterations, the completion checker and the
//! commit gate touch the workspace. [`SandboxedExecutor`] interposes the policy engine
//! on every operation, buffers file changes in an [`OverlayFs`] and records every
//! denial in an append-only violation log. Tests use `test_support::MockExecutor`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::paths::is_within;
use crate::core::policy::{
    PolicyViolation, RalphPolicy, builtin_command_denial, check_command, check_file_read,
    check_file_write, read_denied_by_rule, requires_approval,
};
use crate::core::types::BashOutput;
use crate::io::config::SandboxConfig;
use crate::io::overlay::OverlayFs;
use crate::io::process::{ShellRequest, run_shell};

/// Exit code returned for commands refused by policy.
pub const DENIED_EXIT_CODE: i32 = 126;

/// Environment variable that grants permission to modify the engine's own files.
pub const SELF_MODIFY_ENV: &str = "RALPH_APPROVE_SELF_MODIFY";

/// Contract between the engine and whatever executes agent actions.
pub trait Executor {
    fn bash(&mut self, command: &str) -> Result<BashOutput>;
    /// Fails when the file is absent.
    fn read_file(&mut self, path: &str) -> Result<String>;
    fn write_file(&mut self, path: &str, content: &str) -> Result<()>;
    fn delete_file(&mut self, path: &str) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    /// Discard buffered changes. Never touches disk.
    fn rollback(&mut self);
    /// Restore the paths written or deleted by the most recent flush.
    fn revert_last_flush(&mut self) -> Result<()>;
    fn pending_changes(&self) -> Vec<String>;
    /// Engine-side existence check: true when the file resolves to non-empty content.
    fn file_exists(&mut self, path: &str) -> bool {
        self.read_file(path).is_ok_and(|content| !content.is_empty())
    }
}

/// Errors the scheduler distinguishes from ordinary I/O failures.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("{violation}")]
    PolicyViolation { violation: PolicyViolation },
    #[error("self-modification blocked: {path} is protected (set {SELF_MODIFY_ENV}=true to allow)")]
    SelfModification { path: String },
}

/// Capability to write protected paths, read once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SelfModifyApproval(pub bool);

impl SelfModifyApproval {
    pub fn from_env() -> Self {
        let raw = std::env::var(SELF_MODIFY_ENV).ok();
        Self(parse_self_modify_flag(raw.as_deref()))
    }
}

/// Only `"true"` (any case, surrounding whitespace ignored) grants the capability.
pub fn parse_self_modify_flag(raw: Option<&str>) -> bool {
    raw.is_some_and(|value| value.trim().eq_ignore_ascii_case("true"))
}

#[derive(Debug, Clone)]
pub struct SandboxOptions {
    pub allow_self_modify: bool,
    /// Workdir-relative paths that are never writable without approval.
    pub protected_paths: Vec<String>,
    pub command_timeout: Duration,
    pub output_limit_bytes: usize,
    /// Extra environment for shell commands.
    pub env: BTreeMap<String, String>,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self::from_config(&SandboxConfig::default(), SelfModifyApproval::default())
    }
}

impl SandboxOptions {
    pub fn from_config(config: &SandboxConfig, approval: SelfModifyApproval) -> Self {
        Self {
            allow_self_modify: approval.0,
            protected_paths: config.protected_paths.clone(),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
            env: BTreeMap::new(),
        }
    }
}

/// Policy-enforcing executor over a buffered overlay of `workdir`.
#[derive(Debug)]
pub struct SandboxedExecutor {
    workdir: PathBuf,
    overlay: OverlayFs,
    policy: Option<Arc<RalphPolicy>>,
    options: SandboxOptions,
    violations: Vec<PolicyViolation>,
}

impl SandboxedExecutor {
    pub fn new(
        workdir: impl Into<PathBuf>,
        policy: Option<Arc<RalphPolicy>>,
        options: SandboxOptions,
    ) -> Self {
        let workdir = workdir.into();
        Self {
            overlay: OverlayFs::new(workdir.clone()),
            workdir,
            policy,
            options,
            violations: Vec::new(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn policy(&self) -> Option<&Arc<RalphPolicy>> {
        self.policy.as_ref()
    }

    /// Swap the policy reference. Already-recorded violations are kept.
    pub fn set_policy(&mut self, policy: Option<Arc<RalphPolicy>>) {
        debug!(has_policy = policy.is_some(), "policy replaced");
        self.policy = policy;
    }

    pub fn violations(&self) -> &[PolicyViolation] {
        &self.violations
    }

    fn deny(&mut self, violation: PolicyViolation) -> SandboxError {
        warn!(
            violation_type = violation.violation_type.as_str(),
            rule = %violation.rule,
            detail = %violation.detail,
            "policy violation"
        );
        self.violations.push(violation.clone());
        SandboxError::PolicyViolation { violation }
    }

    fn gate_write(&mut self, path: &str) -> Result<()> {
        if let Some(policy) = self.policy.clone() {
            let decision = check_file_write(&policy, Path::new(path), &self.workdir);
            if let Some(violation) = decision.violation {
                return Err(self.deny(violation).into());
            }
        }
        if self.options.allow_self_modify {
            return Ok(());
        }
        let protected = self
            .options
            .protected_paths
            .iter()
            .any(|rule| is_within(Path::new(path), Path::new(rule), &self.workdir));
        if protected {
            warn!(path, "self-modification blocked");
            return Err(SandboxError::SelfModification {
                path: path.to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn command_denial(&self, command: &str) -> Option<PolicyViolation> {
        match &self.policy {
            Some(policy) => check_command(policy, command).violation,
            None => builtin_command_denial(command).and_then(|decision| decision.violation),
        }
    }
}

impl Executor for SandboxedExecutor {
    #[instrument(skip_all, fields(command = %command))]
    fn bash(&mut self, command: &str) -> Result<BashOutput> {
        if let Some(violation) = self.command_denial(command) {
            let stderr = format!(
                "Policy violation: {} ({}): {}",
                violation.violation_type.as_str(),
                violation.rule,
                command
            );
            self.deny(violation);
            return Ok(BashOutput {
                stdout: String::new(),
                stderr,
                exit_code: DENIED_EXIT_CODE,
            });
        }

        if let Some(policy) = &self.policy {
            let approval = requires_approval(policy, command);
            if let Some(class) = approval.approval_class {
                warn!(
                    approval_class = class.as_str(),
                    "command requires approval, running anyway"
                );
            }
        }

        let output = run_shell(&ShellRequest {
            command,
            workdir: &self.workdir,
            env: &self.options.env,
            timeout: self.options.command_timeout,
            output_limit_bytes: self.options.output_limit_bytes,
        })?;
        let exit_code = output.exit_code();
        debug!(exit_code, "command finished");
        Ok(BashOutput {
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            exit_code,
        })
    }

    fn read_file(&mut self, path: &str) -> Result<String> {
        if let Some(policy) = self.policy.clone() {
            let decision = check_file_read(&policy, Path::new(path), &self.workdir);
            if let Some(violation) = decision.violation {
                return Err(self.deny(violation).into());
            }
        }
        self.overlay.read(path)
    }

    fn write_file(&mut self, path: &str, content: &str) -> Result<()> {
        self.gate_write(path)?;
        debug!(path, bytes = content.len(), "buffered write");
        self.overlay.write(path, content)
    }

    fn delete_file(&mut self, path: &str) -> Result<()> {
        self.gate_write(path)?;
        debug!(path, "buffered delete");
        self.overlay.delete(path)
    }

    fn flush(&mut self) -> Result<()> {
        let pending = self.overlay.pending_changes().len();
        self.overlay.flush()?;
        if pending > 0 {
            info!(changes = pending, "flushed buffered changes");
        }
        Ok(())
    }

    fn rollback(&mut self) {
        let pending = self.overlay.pending_changes().len();
        self.overlay.discard();
        if pending > 0 {
            info!(changes = pending, "rolled back buffered changes");
        }
    }

    fn revert_last_flush(&mut self) -> Result<()> {
        self.overlay.revert_last_flush()?;
        info!("reverted last flush");
        Ok(())
    }

    fn pending_changes(&self) -> Vec<String> {
        self.overlay.pending_changes()
    }

    /// Only `files.denyRead` applies; the read allow-list governs the agent, not the
    /// engine's own completion checks. Nothing is recorded as a violation.
    fn file_exists(&mut self, path: &str) -> bool {
        if let Some(policy) = &self.policy {
            if let Some(rule) = read_denied_by_rule(policy, Path::new(path), &self.workdir) {
                debug!(path, rule, "existence check hidden by deny rule");
                return false;
            }
        }
        match self.overlay.read(path) {
            Ok(content) => !content.is_empty(),
            Err(err) => {
                debug!(path, err = %err, "existence check read failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::{PolicyMode, ViolationType, default_policy};
    use std::fs;

    fn delivery_policy() -> RalphPolicy {
        let mut policy = default_policy();
        policy.mode = PolicyMode::Delivery;
        policy.files.allow_read = vec!["src".to_string()];
        policy.files.allow_write = vec!["src".to_string()];
        policy.commands.allow = vec!["npm test".to_string()];
        policy
    }

    fn sandbox(root: &Path, policy: Option<RalphPolicy>) -> SandboxedExecutor {
        SandboxedExecutor::new(root, policy.map(Arc::new), SandboxOptions::default())
    }

    #[test]
    fn delivery_mode_denies_unlisted_command_with_126() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut exec = sandbox(temp.path(), Some(delivery_policy()));
        let out = exec.bash("python x.py").expect("bash");
        assert_eq!(out.exit_code, DENIED_EXIT_CODE);
        assert_eq!(
            out.stderr,
            "Policy violation: command denied (commands.allow): python x.py"
        );
        assert_eq!(exec.violations().len(), 1);
        assert_eq!(
            exec.violations()[0].violation_type,
            ViolationType::CommandDenied
        );
    }

    #[cfg(unix)]
    #[test]
    fn core_mode_forwards_real_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut policy = delivery_policy();
        policy.mode = PolicyMode::Core;
        let mut exec = sandbox(temp.path(), Some(policy));
        let out = exec.bash("exit 7").expect("bash");
        assert_eq!(out.exit_code, 7);
        assert!(exec.violations().is_empty());
    }

    #[test]
    fn core_mode_still_applies_configured_denies() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut policy = default_policy();
        policy.commands.deny = vec!["git push".to_string()];
        let mut exec = sandbox(temp.path(), Some(policy));
        let out = exec.bash("git push origin main").expect("bash");
        assert_eq!(out.exit_code, DENIED_EXIT_CODE);
        assert!(out.stderr.contains("(git push)"));
    }

    #[test]
    fn builtin_denies_apply_without_policy() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut exec = sandbox(temp.path(), None);
        let out = exec.bash("rm -rf / --no-preserve-root").expect("bash");
        assert_eq!(out.exit_code, DENIED_EXIT_CODE);
        assert_eq!(exec.violations().len(), 1);
    }

    #[test]
    fn denied_read_records_violation_and_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("secret.txt"), "s").expect("seed");
        let mut exec = sandbox(temp.path(), Some(delivery_policy()));
        let err = exec.read_file("secret.txt").expect_err("denied");
        assert!(err.to_string().starts_with("Policy violation: file read denied"));
        assert!(matches!(
            err.downcast_ref::<SandboxError>(),
            Some(SandboxError::PolicyViolation { .. })
        ));
        assert_eq!(exec.violations().len(), 1);
    }

    #[test]
    fn existence_check_ignores_read_allow_list_but_honors_deny() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut policy = delivery_policy();
        policy.files.allow_read = Vec::new();
        policy.files.deny_read = vec!["src/secret".to_string()];
        let mut exec = sandbox(temp.path(), Some(policy));
        exec.write_file("src/x.ts", "export const x = 1;").expect("write");
        exec.write_file("src/secret/key.txt", "k").expect("write");

        assert!(exec.file_exists("src/x.ts"));
        assert!(!exec.file_exists("src/missing.ts"));
        assert!(!exec.file_exists("src/secret/key.txt"));
        assert!(exec.violations().is_empty());
        assert!(exec.read_file("src/x.ts").is_err());
    }

    #[test]
    fn denied_write_is_not_buffered() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut exec = sandbox(temp.path(), Some(delivery_policy()));
        let err = exec.write_file("docs/readme.md", "x").expect_err("denied");
        assert!(err.to_string().contains("Policy violation: file write denied"));
        assert!(exec.pending_changes().is_empty());
        exec.write_file("src/lib.rs", "ok").expect("allowed");
        assert_eq!(exec.pending_changes(), vec!["src/lib.rs".to_string()]);
    }

    #[test]
    fn self_modification_is_blocked_regardless_of_allow_write() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut exec = sandbox(temp.path(), Some(default_policy()));
        let err = exec
            .write_file("runtime/loop.ts", "x")
            .expect_err("protected");
        assert!(err.to_string().contains("self-modification blocked"));
        assert!(matches!(
            err.downcast_ref::<SandboxError>(),
            Some(SandboxError::SelfModification { .. })
        ));
        assert!(exec.delete_file("./state/tasks.jsonl").is_err());
        assert!(exec.write_file("runtimes/ok.ts", "x").is_ok());
        assert!(exec.violations().is_empty());
    }

    #[test]
    fn self_modification_gate_runs_without_policy() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut exec = sandbox(temp.path(), None);
        assert!(exec.write_file("ralph.toml", "x").is_err());
    }

    #[test]
    fn approval_capability_unlocks_protected_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        let options = SandboxOptions {
            allow_self_modify: true,
            ..SandboxOptions::default()
        };
        let mut exec =
            SandboxedExecutor::new(temp.path(), Some(Arc::new(default_policy())), options);
        exec.write_file("runtime/loop.ts", "x").expect("approved");
        assert_eq!(exec.pending_changes(), vec!["runtime/loop.ts".to_string()]);
    }

    #[test]
    fn flush_and_rollback_go_through_the_overlay() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut exec = sandbox(temp.path(), None);
        exec.write_file("a.txt", "a").expect("write");
        exec.rollback();
        assert!(exec.pending_changes().is_empty());
        assert!(!temp.path().join("a.txt").exists());

        exec.write_file("b.txt", "b").expect("write");
        exec.flush().expect("flush");
        assert_eq!(
            fs::read_to_string(temp.path().join("b.txt")).expect("read"),
            "b"
        );
    }

    #[test]
    fn set_policy_swaps_rules_and_keeps_violations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut exec = sandbox(temp.path(), Some(delivery_policy()));
        exec.bash("python x.py").expect("bash");
        exec.set_policy(None);
        assert!(exec.policy().is_none());
        assert_eq!(exec.violations().len(), 1);
        exec.write_file("docs/readme.md", "x").expect("no policy");
    }

    #[test]
    fn self_modify_flag_parsing() {
        assert!(parse_self_modify_flag(Some("true")));
        assert!(parse_self_modify_flag(Some("TRUE")));
        assert!(!parse_self_modify_flag(Some("1")));
        assert!(!parse_self_modify_flag(Some("yes")));
        assert!(!parse_self_modify_flag(None));
    }
}
