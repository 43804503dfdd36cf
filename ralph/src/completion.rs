//! Programmatic completion checks for a task's declared criteria.
//!
//! Checks never propagate errors: a failing or erroring command becomes an incomplete
//! [`CompletionCheckResult`] with a bounded diagnostic.

use anyhow::Result;
use tracing::{debug, instrument};

use crate::core::types::{BashOutput, CompletionCheckResult, CompletionCriteria, Task};
use crate::io::executor::Executor;

/// Longest diagnostic kept in a completion reason, in characters.
pub const MAX_REASON_CHARS: usize = 500;

/// The two capabilities completion checks need from the workspace.
pub trait CompletionContext {
    fn bash(&mut self, command: &str) -> Result<BashOutput>;
    /// True when the file can be read and has non-empty content.
    fn file_exists(&mut self, path: &str) -> bool;
}

/// Completion context backed by an executor, so checks are policy-gated and see
/// buffered writes.
pub struct ExecutorCompletionContext<'a, E: Executor + ?Sized> {
    executor: &'a mut E,
}

pub fn create_completion_context<E: Executor + ?Sized>(
    executor: &mut E,
) -> ExecutorCompletionContext<'_, E> {
    ExecutorCompletionContext { executor }
}

impl<E: Executor + ?Sized> CompletionContext for ExecutorCompletionContext<'_, E> {
    fn bash(&mut self, command: &str) -> Result<BashOutput> {
        self.executor.bash(command)
    }

    fn file_exists(&mut self, path: &str) -> bool {
        self.executor.file_exists(path)
    }
}

/// Truncate to at most [`MAX_REASON_CHARS`] characters.
pub fn truncate_reason(reason: &str) -> String {
    match reason.char_indices().nth(MAX_REASON_CHARS) {
        Some((idx, _)) => reason[..idx].to_string(),
        None => reason.to_string(),
    }
}

/// Evaluate `task.completion`. Returns `None` when the task declares no criteria.
#[instrument(skip_all, fields(task_id = %task.id))]
pub fn check_completion<C: CompletionContext + ?Sized>(
    task: &Task,
    ctx: &mut C,
) -> Option<CompletionCheckResult> {
    let criteria = task.completion.as_ref()?;
    let result = match criteria {
        CompletionCriteria::TestPassing { command, grep } => {
            let command = match command {
                Some(command) => command.clone(),
                None => {
                    let pattern = grep.as_deref().unwrap_or(&task.id);
                    format!("npm test -- --grep \"{pattern}\"")
                }
            };
            check_test_passing(ctx, &command)
        }
        CompletionCriteria::FileExists { path } => check_file_exists(ctx, path),
        CompletionCriteria::Validate { script } => check_validate(ctx, &task.id, script),
    };
    debug!(
        kind = criteria.kind(),
        complete = result.complete,
        "completion evaluated"
    );
    Some(result)
}

fn check_test_passing<C: CompletionContext + ?Sized>(
    ctx: &mut C,
    command: &str,
) -> CompletionCheckResult {
    match ctx.bash(command) {
        Ok(out) if out.success() => CompletionCheckResult {
            complete: true,
            reason: "Tests passed".to_string(),
            artifacts: Some(Vec::new()),
        },
        Ok(out) => incomplete(format!(
            "Tests failed (exit {}): {}",
            out.exit_code,
            failure_output(&out)
        )),
        Err(err) => incomplete(format!("Test command error: {}", error_message(&err))),
    }
}

fn check_file_exists<C: CompletionContext + ?Sized>(
    ctx: &mut C,
    path: &str,
) -> CompletionCheckResult {
    if ctx.file_exists(path) {
        CompletionCheckResult {
            complete: true,
            reason: truncate_reason(&format!("File exists: {path}")),
            artifacts: Some(vec![path.to_string()]),
        }
    } else {
        incomplete(format!("File not found or empty: {path}"))
    }
}

fn check_validate<C: CompletionContext + ?Sized>(
    ctx: &mut C,
    task_id: &str,
    script: &str,
) -> CompletionCheckResult {
    let command = format!("RALPH_TASK_ID={task_id} {script}");
    match ctx.bash(&command) {
        Ok(out) if out.success() => CompletionCheckResult {
            complete: true,
            reason: "Validation passed".to_string(),
            artifacts: Some(
                out.stdout
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
        },
        Ok(out) => incomplete(format!(
            "Validation failed (exit {}): {}",
            out.exit_code,
            failure_output(&out)
        )),
        Err(err) => incomplete(format!(
            "Validation script error: {}",
            error_message(&err)
        )),
    }
}

fn incomplete(reason: String) -> CompletionCheckResult {
    CompletionCheckResult {
        complete: false,
        reason: truncate_reason(&reason),
        artifacts: None,
    }
}

fn failure_output(out: &BashOutput) -> &str {
    if out.stderr.is_empty() {
        &out.stdout
    } else {
        &out.stderr
    }
}

fn error_message(err: &anyhow::Error) -> String {
    let message = format!("{err:#}");
    if message.trim().is_empty() {
        "Unknown error".to_string()
    } else {
        message
    }
}
