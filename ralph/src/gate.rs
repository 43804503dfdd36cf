//! Pre-commit gate: flush buffered changes, run required checks, then commit or roll back.

use std::sync::{Mutex, MutexGuard};

use tracing::{error, info, instrument, warn};

use crate::core::types::Task;
use crate::io::executor::Executor;
use crate::io::progress::ProgressEvent;
use crate::looping::LoopContext;

/// One required check as it ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRun {
    pub name: String,
    pub command: String,
    pub passed: bool,
    pub exit_code: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateOutcome {
    pub success: bool,
    /// True only when a commit was actually created.
    pub committed: bool,
    pub checks: Vec<CheckRun>,
    pub error: Option<String>,
}

impl GateOutcome {
    fn passed(committed: bool, checks: Vec<CheckRun>) -> Self {
        Self {
            success: true,
            committed,
            checks,
            error: None,
        }
    }

    fn failed(error: String, checks: Vec<CheckRun>) -> Self {
        Self {
            success: false,
            committed: false,
            checks,
            error: Some(error),
        }
    }
}

fn lock_workspace(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Commit message for a task. The prefix and id are concatenated verbatim.
pub fn commit_message(prefix: &str, task: &Task) -> String {
    format!("{}{}: {}", prefix, task.id, task.title)
}

/// Run the gate for a task whose iteration reported completion.
///
/// Flush always happens before any required check so checks observe real files. In
/// dry-run the direct path neither flushes nor commits; with required checks the
/// checks still run against flushed files, which are reverted afterwards.
#[instrument(skip_all, fields(task_id = %task.id, dry_run))]
pub fn run_policy_checks_before_commit<E: Executor>(
    context: &mut LoopContext<'_, E>,
    task: &Task,
    dry_run: bool,
) -> GateOutcome {
    let checks = context
        .policy
        .as_ref()
        .map(|policy| policy.checks.clone())
        .unwrap_or_default();

    if checks.required.is_empty() {
        if dry_run {
            info!(
                pending = ?context.executor.pending_changes(),
                "dry run: would flush and commit"
            );
            return GateOutcome::passed(false, Vec::new());
        }
        let _workspace = context.workspace_lock.map(lock_workspace);
        let files = context.executor.pending_changes();
        if let Err(err) = context.executor.flush() {
            error!(err = %format!("{err:#}"), "flush failed");
            return GateOutcome::failed(format!("flush failed: {err:#}"), Vec::new());
        }
        return commit_changes(context, task, files, Vec::new());
    }

    let _workspace = context.workspace_lock.map(lock_workspace);
    let files = context.executor.pending_changes();
    if let Err(err) = context.executor.flush() {
        error!(err = %format!("{err:#}"), "flush failed");
        return GateOutcome::failed(format!("flush failed: {err:#}"), Vec::new());
    }

    let mut runs = Vec::with_capacity(checks.required.len());
    for name in &checks.required {
        let command = checks.command_for(name);
        let exit_code = match context.executor.bash(&command) {
            Ok(out) => out.exit_code,
            Err(err) => {
                warn!(check = %name, err = %format!("{err:#}"), "check could not run");
                -1
            }
        };
        let passed = exit_code == 0;
        if passed {
            info!("[PASS {name}]");
        } else {
            warn!(exit_code, "[FAIL {name}]");
        }
        runs.push(CheckRun {
            name: name.clone(),
            command,
            passed,
            exit_code,
        });
    }

    let failed: Vec<&str> = runs
        .iter()
        .filter(|run| !run.passed)
        .map(|run| run.name.as_str())
        .collect();
    if !failed.is_empty() {
        let detail = format!("required checks failed: {}", failed.join(", "));
        context.progress.record(ProgressEvent::PolicyViolation {
            task_id: task.id.clone(),
            rule: "checks.required".to_string(),
            detail: detail.clone(),
        });
        if checks.rollback_on_fail || dry_run {
            discard_flushed(context, files.len());
        }
        return GateOutcome::failed(detail, runs);
    }

    if dry_run {
        info!("dry run: checks passed, skipping commit");
        discard_flushed(context, files.len());
        return GateOutcome::passed(false, runs);
    }
    commit_changes(context, task, files, runs)
}

fn discard_flushed<E: Executor>(context: &mut LoopContext<'_, E>, files: usize) {
    context.executor.rollback();
    match context.executor.revert_last_flush() {
        Ok(()) => info!(files, "changes discarded"),
        Err(err) => error!(err = %format!("{err:#}"), "failed to discard flushed changes"),
    }
}

fn commit_changes<E: Executor>(
    context: &LoopContext<'_, E>,
    task: &Task,
    files: Vec<String>,
    checks: Vec<CheckRun>,
) -> GateOutcome {
    if !context.config.git.auto_commit {
        info!("auto_commit disabled, leaving changes uncommitted");
        return GateOutcome::passed(false, checks);
    }
    let message = commit_message(&context.config.git.commit_prefix, task);
    let result = context
        .git
        .add(".")
        .and_then(|()| context.git.commit(&message));
    match result {
        Ok(committed) => {
            if committed {
                info!(message = %message, "committed");
                context.progress.record(ProgressEvent::GitActivity {
                    task_id: task.id.clone(),
                    message,
                    files,
                });
            } else {
                info!("nothing to commit");
            }
            GateOutcome::passed(committed, checks)
        }
        Err(err) => {
            error!(err = %format!("{err:#}"), "commit failed");
            GateOutcome::failed(format!("commit failed: {err:#}"), checks)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::{PolicyMode, RalphPolicy, default_policy};
    use crate::io::config::RuntimeConfig;
    use crate::io::progress::ProgressLog;
    use crate::test_support::{MockExecutor, RecordingGit, bash_fail, task};
    use std::sync::Arc;

    struct Fixture {
        _temp: tempfile::TempDir,
        config: RuntimeConfig,
        git: RecordingGit,
        progress: ProgressLog,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempfile::tempdir().expect("tempdir");
            let progress = ProgressLog::in_state_dir(temp.path());
            Self {
                _temp: temp,
                config: RuntimeConfig::default(),
                git: RecordingGit::default(),
                progress,
            }
        }

        fn context(
            &self,
            executor: MockExecutor,
            policy: Option<RalphPolicy>,
        ) -> LoopContext<'_, MockExecutor> {
            LoopContext {
                executor,
                git: &self.git,
                policy: policy.map(Arc::new),
                config: &self.config,
                progress: &self.progress,
                provider: None,
                hooks: None,
                workspace_lock: None,
            }
        }
    }

    fn checked_policy(required: &[&str]) -> RalphPolicy {
        let mut policy = default_policy();
        policy.mode = PolicyMode::Delivery;
        policy.checks.required = required.iter().map(|s| s.to_string()).collect();
        policy
    }

    fn pending_executor() -> MockExecutor {
        let mut executor = MockExecutor::new();
        executor.write_file("src/x.ts", "export {}").expect("write");
        executor
    }

    #[test]
    fn commits_directly_without_policy() {
        let fx = Fixture::new();
        let mut ctx = fx.context(pending_executor(), None);
        let t = task("RALPH-001");
        let outcome = run_policy_checks_before_commit(&mut ctx, &t, false);
        assert!(outcome.success && outcome.committed);
        assert_eq!(ctx.executor.calls.last().map(String::as_str), Some("flush"));
        assert_eq!(fx.git.calls(), vec!["add:.", "commit:RALPH-RALPH-001: RALPH-001 title"]);
        assert!(ctx.executor.bash_calls().is_empty());
    }

    #[test]
    fn dry_run_direct_path_touches_nothing() {
        let fx = Fixture::new();
        let mut ctx = fx.context(pending_executor(), Some(default_policy()));
        let outcome = run_policy_checks_before_commit(&mut ctx, &task("T-1"), true);
        assert!(outcome.success);
        assert!(!outcome.committed);
        assert!(!ctx.executor.calls.contains(&"flush".to_string()));
        assert!(fx.git.calls().is_empty());
    }

    #[test]
    fn flushes_before_running_checks_then_commits() {
        let fx = Fixture::new();
        let mut ctx = fx.context(pending_executor(), Some(checked_policy(&["test", "lint"])));
        let t = task("T-1");
        let outcome = run_policy_checks_before_commit(&mut ctx, &t, false);
        assert!(outcome.success && outcome.committed);
        assert_eq!(
            ctx.executor.calls,
            vec!["write:src/x.ts", "flush", "bash:npm test", "bash:npm run lint"]
        );
        assert_eq!(outcome.checks.len(), 2);
        assert!(outcome.checks.iter().all(|run| run.passed));
        assert_eq!(fx.git.commits(), vec!["RALPH-T-1: T-1 title"]);

        let events = fx.progress.read_all().expect("progress");
        assert!(matches!(
            &events[0].event,
            ProgressEvent::GitActivity { files, .. } if files == &vec!["src/x.ts".to_string()]
        ));
    }

    #[test]
    fn failing_check_blocks_commit_and_reverts() {
        let fx = Fixture::new();
        let executor = pending_executor().on_bash("npm run lint", bash_fail(1, "lint errors"));
        let mut ctx = fx.context(executor, Some(checked_policy(&["test", "lint"])));
        let outcome = run_policy_checks_before_commit(&mut ctx, &task("T-1"), false);

        assert!(!outcome.success);
        assert_eq!(
            outcome.error.as_deref(),
            Some("required checks failed: lint")
        );
        assert!(fx.git.calls().is_empty());
        assert!(ctx.executor.calls.ends_with(&["rollback".to_string(), "revert".to_string()]));
        assert!(!ctx.executor.disk.contains_key("src/x.ts"));

        let events = fx.progress.read_all().expect("progress");
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0].event,
            ProgressEvent::PolicyViolation { rule, .. } if rule == "checks.required"
        ));
    }

    #[test]
    fn failing_check_without_rollback_keeps_flushed_files() {
        let fx = Fixture::new();
        let executor = pending_executor().on_bash("npm test", bash_fail(1, "1 failing"));
        let mut policy = checked_policy(&["test"]);
        policy.checks.rollback_on_fail = false;
        let mut ctx = fx.context(executor, Some(policy));
        let outcome = run_policy_checks_before_commit(&mut ctx, &task("T-1"), false);
        assert!(!outcome.success);
        assert!(!ctx.executor.calls.contains(&"rollback".to_string()));
        assert!(ctx.executor.disk.contains_key("src/x.ts"));
        assert_eq!(fx.progress.read_all().expect("progress").len(), 1);
    }

    #[test]
    fn check_commands_can_be_overridden() {
        let fx = Fixture::new();
        let mut policy = checked_policy(&["test", "fmt"]);
        policy
            .checks
            .commands
            .insert("test".to_string(), "cargo test".to_string());
        let mut ctx = fx.context(pending_executor(), Some(policy));
        run_policy_checks_before_commit(&mut ctx, &task("T-1"), false);
        assert_eq!(ctx.executor.bash_calls(), vec!["cargo test", "fmt"]);
    }

    #[test]
    fn dry_run_runs_checks_but_skips_commit() {
        let fx = Fixture::new();
        let mut ctx = fx.context(pending_executor(), Some(checked_policy(&["test"])));
        let outcome = run_policy_checks_before_commit(&mut ctx, &task("T-1"), true);
        assert!(outcome.success);
        assert!(!outcome.committed);
        assert_eq!(ctx.executor.bash_calls(), vec!["npm test"]);
        assert!(fx.git.calls().is_empty());
        assert!(ctx.executor.calls.contains(&"revert".to_string()));
        assert!(!ctx.executor.disk.contains_key("src/x.ts"));
    }

    #[test]
    fn flush_and_commit_errors_fail_the_gate() {
        let fx = Fixture::new();
        let mut executor = pending_executor();
        executor.fail_flush = true;
        let mut ctx = fx.context(executor, Some(checked_policy(&["test"])));
        let outcome = run_policy_checks_before_commit(&mut ctx, &task("T-1"), false);
        assert!(!outcome.success);
        assert!(ctx.executor.bash_calls().is_empty());

        let mut fx = Fixture::new();
        fx.git.fail_commit = true;
        let mut ctx = fx.context(pending_executor(), None);
        let outcome = run_policy_checks_before_commit(&mut ctx, &task("T-1"), false);
        assert!(!outcome.success);
        assert!(outcome.error.expect("error").starts_with("commit failed"));
    }

    #[test]
    fn auto_commit_off_succeeds_without_committing() {
        let mut fx = Fixture::new();
        fx.config.git.auto_commit = false;
        let mut ctx = fx.context(pending_executor(), None);
        let outcome = run_policy_checks_before_commit(&mut ctx, &task("T-1"), false);
        assert!(outcome.success);
        assert!(!outcome.committed);
        assert!(fx.git.calls().is_empty());
    }
}
