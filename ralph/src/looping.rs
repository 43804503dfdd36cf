//! Task scheduling: the per-task iteration loop and the multi-task run driver.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{error, info, instrument, warn};

use crate::completion::{check_completion, create_completion_context};
use crate::core::budget::{LimitKind, TaskBudget};
use crate::core::policy::RalphPolicy;
use crate::core::selector::select_runnable;
use crate::core::types::{IterationResult, Task, TaskStatus};
use crate::gate::run_policy_checks_before_commit;
use crate::hooks::{HookEvent, Hooks, invoke_hook};
use crate::io::config::{OnFailure, RuntimeConfig};
use crate::io::executor::Executor;
use crate::io::git::GitClient;
use crate::io::progress::{ProgressEvent, ProgressLog};
use crate::io::task_store::TaskStore;
use crate::iteration::{IterationRecord, execute_iteration};
use crate::provider::Provider;

/// Everything one task needs while it runs. The executor is owned; the rest is shared.
pub struct LoopContext<'a, E: Executor> {
    pub executor: E,
    pub git: &'a dyn GitClient,
    pub policy: Option<Arc<RalphPolicy>>,
    pub config: &'a RuntimeConfig,
    pub progress: &'a ProgressLog,
    pub provider: Option<&'a dyn Provider>,
    pub hooks: Option<&'a Hooks>,
    /// Held by the commit gate from flush until commit or revert. Tasks sharing one
    /// worktree pass the same lock so no task observes or commits another's
    /// unverified files.
    pub workspace_lock: Option<&'a Mutex<()>>,
}

/// Why a task's loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskStop {
    Completed,
    Blocked { blocker: String },
    GateFailed { error: String },
    IterationFailed { error: String },
    LimitReached(LimitKind),
    /// The task branch could not be checked out; no iteration ran.
    BranchFailed { error: String },
    /// Task-log write, executor setup or a worker panic kept the task from running.
    EngineFailed { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskLoopResult {
    pub task_id: String,
    pub success: bool,
    pub status: TaskStatus,
    pub iterations: u32,
    pub artifacts: Vec<String>,
    /// True when the gate created a commit.
    pub committed: bool,
    pub stop: TaskStop,
    /// The final status could not be written to the task log, so the log lags `status`.
    pub log_error: Option<String>,
}

impl TaskLoopResult {
    fn stopped(task: &Task, iterations: u32, status: TaskStatus, stop: TaskStop) -> Self {
        Self {
            task_id: task.id.clone(),
            success: false,
            status,
            iterations,
            artifacts: Vec::new(),
            committed: false,
            stop,
            log_error: None,
        }
    }

    /// Failures that abort the whole run under `on_failure = "stop"`.
    pub fn is_failure(&self) -> bool {
        self.log_error.is_some()
            || matches!(
                self.stop,
                TaskStop::GateFailed { .. }
                    | TaskStop::IterationFailed { .. }
                    | TaskStop::BranchFailed { .. }
                    | TaskStop::EngineFailed { .. }
            )
    }
}

/// Iterate on one task until it completes, blocks, fails or exhausts its budget.
///
/// The returned status is what the task should move to; a task that ran out of budget
/// or failed stays `in_progress`.
#[instrument(skip_all, fields(task_id = %task.id))]
pub fn execute_task_loop<E: Executor>(
    context: &mut LoopContext<'_, E>,
    task: &Task,
) -> TaskLoopResult {
    let scheduler = &context.config.scheduler;
    let dry_run = scheduler.dry_run;
    let on_failure = scheduler.on_failure;
    let mut budget = TaskBudget::new(
        scheduler.max_iterations_per_task,
        scheduler.max_time_per_task(),
        scheduler.max_cost_per_task_usd,
    );

    let mut previous: Option<IterationRecord> = None;
    let mut iteration = 0u32;
    loop {
        if let Some(limit) = budget.exhausted(iteration + 1) {
            warn!(limit = limit.name(), iterations = iteration, "{}", limit.describe());
            invoke_hook(context.hooks, HookEvent::LimitReached { task, limit });
            context.progress.record(ProgressEvent::LimitReached {
                task_id: Some(task.id.clone()),
                limit: limit.name().to_string(),
                detail: limit.describe(),
            });
            discard_pending(&mut context.executor);
            return TaskLoopResult::stopped(
                task,
                iteration,
                TaskStatus::InProgress,
                TaskStop::LimitReached(limit),
            );
        }
        iteration += 1;

        invoke_hook(context.hooks, HookEvent::IterationStart { task, iteration });
        let mut record = execute_iteration(context, task, iteration, previous.as_ref());
        budget.record_cost(record.cost_usd);
        if context.provider.is_some() {
            record.result = merge_completion(&mut context.executor, task, record.result);
        }
        invoke_hook(
            context.hooks,
            HookEvent::IterationEnd {
                task,
                iteration,
                result: &record.result,
            },
        );
        context.progress.record(ProgressEvent::Iteration {
            task_id: task.id.clone(),
            iteration,
            status: record.result.label().to_string(),
            detail: record.result.detail(),
            actions: record.actions.len(),
        });

        match record.result.clone() {
            IterationResult::Complete { artifacts } => {
                let gate = run_policy_checks_before_commit(context, task, dry_run);
                if !gate.success {
                    let error = gate.error.unwrap_or_else(|| "gate failed".to_string());
                    warn!(err = %error, "task stopped at commit gate");
                    discard_pending(&mut context.executor);
                    return TaskLoopResult::stopped(
                        task,
                        iteration,
                        TaskStatus::InProgress,
                        TaskStop::GateFailed { error },
                    );
                }
                invoke_hook(
                    context.hooks,
                    HookEvent::TaskComplete {
                        task,
                        artifacts: &artifacts,
                    },
                );
                let status = if gate.committed {
                    TaskStatus::Done
                } else {
                    TaskStatus::Review
                };
                info!(status = status.as_str(), iterations = iteration, "task complete");
                return TaskLoopResult {
                    task_id: task.id.clone(),
                    success: true,
                    status,
                    iterations: iteration,
                    artifacts,
                    committed: gate.committed,
                    stop: TaskStop::Completed,
                    log_error: None,
                };
            }
            IterationResult::Blocked { blocker } => {
                info!(blocker = %blocker, "task blocked");
                invoke_hook(
                    context.hooks,
                    HookEvent::TaskBlocked {
                        task,
                        blocker: &blocker,
                    },
                );
                discard_pending(&mut context.executor);
                return TaskLoopResult::stopped(
                    task,
                    iteration,
                    TaskStatus::Blocked,
                    TaskStop::Blocked { blocker },
                );
            }
            IterationResult::Failed { error } => {
                if on_failure == OnFailure::Stop {
                    warn!(err = %error, "iteration failed; stopping task");
                    discard_pending(&mut context.executor);
                    return TaskLoopResult::stopped(
                        task,
                        iteration,
                        TaskStatus::InProgress,
                        TaskStop::IterationFailed { error },
                    );
                }
                warn!(err = %error, "iteration failed; continuing");
            }
            IterationResult::Continue { .. } => {}
        }
        previous = Some(record);
    }
}

/// Let declared criteria overrule the agent's own verdict.
fn merge_completion<E: Executor>(
    executor: &mut E,
    task: &Task,
    result: IterationResult,
) -> IterationResult {
    let agent_artifacts = match &result {
        IterationResult::Complete { artifacts } => artifacts.clone(),
        IterationResult::Continue { .. } => Vec::new(),
        IterationResult::Blocked { .. } | IterationResult::Failed { .. } => return result,
    };
    let mut ctx = create_completion_context(executor);
    let Some(check) = check_completion(task, &mut ctx) else {
        return result;
    };
    if !check.complete {
        return IterationResult::Continue {
            reason: check.reason,
        };
    }
    let artifacts = match check.artifacts {
        Some(artifacts) if !artifacts.is_empty() => artifacts,
        _ => agent_artifacts,
    };
    IterationResult::Complete { artifacts }
}

fn discard_pending<E: Executor>(executor: &mut E) {
    let pending = executor.pending_changes();
    if !pending.is_empty() {
        info!(files = pending.len(), "discarding uncommitted changes");
        executor.rollback();
    }
}

/// Pushes task status changes to an external issue tracker.
pub trait Tracker: Send + Sync {
    fn sync_status(&self, task: &Task, status: TaskStatus) -> Result<()>;
}

/// Shared collaborators for a run.
pub struct RunDeps<'a> {
    pub git: &'a dyn GitClient,
    pub policy: Option<Arc<RalphPolicy>>,
    pub config: &'a RuntimeConfig,
    pub progress: &'a ProgressLog,
    pub store: &'a TaskStore,
    pub provider: Option<&'a dyn Provider>,
    pub hooks: Option<&'a Hooks>,
    pub tracker: Option<&'a dyn Tracker>,
}

/// Reason why `run_tasks` stopped scheduling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStop {
    /// Every runnable task was attempted.
    Exhausted,
    MaxTasks,
    MaxTime,
    /// A task failed under `on_failure = "stop"`.
    Aborted { task_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub results: Vec<TaskLoopResult>,
    pub stop: RunStop,
}

/// Work through the runnable subset of `tasks`, one executor per task.
///
/// With `parallelism > 1` tasks run in batches on scoped threads and their commit gates
/// are serialized. Run-level limits are checked between batches. Nothing a single task
/// does ends the run early except `on_failure = "stop"`; task-log and setup errors are
/// reported on that task's result.
#[instrument(skip_all, fields(tasks = tasks.len()))]
pub fn run_tasks<E, F>(deps: &RunDeps<'_>, tasks: &[Task], make_executor: F) -> RunSummary
where
    E: Executor + Send,
    F: Fn(&Task) -> Result<E> + Sync,
{
    let scheduler = &deps.config.scheduler;
    let started = Instant::now();
    let runnable = select_runnable(tasks);
    let batch_size = scheduler.parallelism.max(1);
    let workspace_lock = Mutex::new(());
    info!(
        runnable = runnable.len(),
        parallelism = batch_size,
        dry_run = scheduler.dry_run,
        "run started"
    );

    let mut results: Vec<TaskLoopResult> = Vec::new();
    let mut stop = RunStop::Exhausted;
    let mut next = 0usize;
    while next < runnable.len() {
        if let Some(limit) = run_limit(deps.config, started, next) {
            warn!(limit = limit.name(), "{}", limit.describe());
            deps.progress.record(ProgressEvent::LimitReached {
                task_id: None,
                limit: limit.name().to_string(),
                detail: limit.describe(),
            });
            stop = match limit {
                LimitKind::RunTasks { .. } => RunStop::MaxTasks,
                _ => RunStop::MaxTime,
            };
            break;
        }

        let mut end = (next + batch_size).min(runnable.len());
        if let Some(max) = scheduler.max_tasks_per_run {
            end = end.min(max as usize);
        }
        let batch = &runnable[next..end];
        next = end;

        let outcomes: Vec<TaskLoopResult> = if batch.len() == 1 {
            vec![run_one(deps, batch[0], &make_executor, &workspace_lock)]
        } else {
            let make_executor = &make_executor;
            let workspace_lock = &workspace_lock;
            thread::scope(|scope| {
                let handles: Vec<_> = batch
                    .iter()
                    .map(|task| {
                        let handle = scope.spawn(move || {
                            run_one(deps, task, make_executor, workspace_lock)
                        });
                        (*task, handle)
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|(task, handle)| {
                        handle.join().unwrap_or_else(|_| {
                            error!(task_id = %task.id, "task worker panicked");
                            engine_failed(task, "task worker panicked".to_string())
                        })
                    })
                    .collect()
            })
        };

        let mut aborted = None;
        for result in outcomes {
            if aborted.is_none() && scheduler.on_failure == OnFailure::Stop && result.is_failure()
            {
                aborted = Some(result.task_id.clone());
            }
            results.push(result);
        }
        if let Some(task_id) = aborted {
            warn!(task_id = %task_id, "run aborted after task failure");
            stop = RunStop::Aborted { task_id };
            break;
        }
    }

    info!(tasks = results.len(), stop = ?stop, "run finished");
    RunSummary { results, stop }
}

fn engine_failed(task: &Task, error: String) -> TaskLoopResult {
    TaskLoopResult::stopped(task, 0, task.status, TaskStop::EngineFailed { error })
}

fn run_limit(config: &RuntimeConfig, started: Instant, attempted: usize) -> Option<LimitKind> {
    let scheduler = &config.scheduler;
    if let Some(max) = scheduler.max_tasks_per_run {
        if attempted >= max as usize {
            return Some(LimitKind::RunTasks { max });
        }
    }
    if let Some(max_secs) = scheduler.max_time_per_run_secs {
        if started.elapsed() >= Duration::from_secs(max_secs) {
            return Some(LimitKind::RunTime { max_secs });
        }
    }
    None
}

fn run_one<E, F>(
    deps: &RunDeps<'_>,
    task: &Task,
    make_executor: &F,
    workspace_lock: &Mutex<()>,
) -> TaskLoopResult
where
    E: Executor,
    F: Fn(&Task) -> Result<E>,
{
    let dry_run = deps.config.scheduler.dry_run;

    if let Some(prefix) = &deps.config.git.branch_prefix {
        if !dry_run {
            let branch = format!("{prefix}{}", task.id);
            if let Err(err) = deps.git.checkout_task_branch(&branch) {
                error!(task_id = %task.id, branch = %branch, err = %format!("{err:#}"), "checkout failed");
                return TaskLoopResult::stopped(
                    task,
                    0,
                    task.status,
                    TaskStop::BranchFailed {
                        error: format!("checkout {branch}: {err:#}"),
                    },
                );
            }
        }
    }

    let executor = match make_executor(task) {
        Ok(executor) => executor,
        Err(err) => {
            error!(task_id = %task.id, err = %format!("{err:#}"), "executor setup failed");
            return engine_failed(task, format!("executor setup: {err:#}"));
        }
    };
    if let Err(err) = transition(deps, task, task.status, TaskStatus::InProgress) {
        error!(task_id = %task.id, err = %format!("{err:#}"), "could not start task");
        return engine_failed(task, format!("record status: {err:#}"));
    }
    let mut context = LoopContext {
        executor,
        git: deps.git,
        policy: deps.policy.clone(),
        config: deps.config,
        progress: deps.progress,
        provider: deps.provider,
        hooks: deps.hooks,
        workspace_lock: Some(workspace_lock),
    };
    let mut result = execute_task_loop(&mut context, task);
    if let Err(err) = transition(deps, task, TaskStatus::InProgress, result.status) {
        error!(
            task_id = %task.id,
            status = result.status.as_str(),
            err = %format!("{err:#}"),
            "final status not recorded"
        );
        result.log_error = Some(format!("{err:#}"));
    }

    if result.committed {
        if let (Some(tracker), Some(external_id)) = (deps.tracker, task.external_id.as_deref()) {
            if let Err(err) = tracker.sync_status(task, result.status) {
                warn!(task_id = %task.id, external_id, err = %format!("{err:#}"), "tracker sync failed");
            }
        }
    }
    result
}

fn transition(deps: &RunDeps<'_>, task: &Task, from: TaskStatus, to: TaskStatus) -> Result<()> {
    if from == to || deps.config.scheduler.dry_run {
        return Ok(());
    }
    deps.store.record_status(&task.id, from, to)?;
    deps.progress.record(ProgressEvent::StatusChange {
        task_id: task.id.clone(),
        from,
        to,
    });
    Ok(())
}
