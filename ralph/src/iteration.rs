//! One iteration of a task: ask the agent, execute its tool calls, classify the outcome.

use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::completion::{check_completion, create_completion_context, truncate_reason};
use crate::core::types::{Action, ActionType, IterationResult, Task};
use crate::hooks::{HookEvent, invoke_hook};
use crate::io::executor::{Executor, SandboxError};
use crate::io::prompt::{PROMPT_BUDGET_BYTES, PromptInputs, render_iteration_prompt};
use crate::looping::LoopContext;
use crate::provider::{
    ChatMessage, ChatRequest, ChatResponse, FinishReason, Provider, ToolInvocation,
    parse_tool_call, tool_specs,
};

const SYSTEM_PROMPT: &str = "You are ralph, an autonomous coding agent working in a sandboxed \
workspace. Act only through the provided tools. Call task_complete when the task's \
completion criteria hold and task_blocked when you cannot proceed.";

pub const NO_CRITERIA_BLOCKER: &str =
    "No provider configured and task declares no completion criteria";

/// What one iteration produced.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationRecord {
    pub iteration: u32,
    pub result: IterationResult,
    pub actions: Vec<Action>,
    /// Provider-reported cost of this iteration.
    pub cost_usd: f64,
}

/// Run iteration `iteration` (1-indexed) of `task`.
///
/// Never returns an error: provider and executor failures become
/// [`IterationResult::Failed`].
#[instrument(skip_all, fields(task_id = %task.id, iteration))]
pub fn execute_iteration<E: Executor>(
    context: &mut LoopContext<'_, E>,
    task: &Task,
    iteration: u32,
    previous: Option<&IterationRecord>,
) -> IterationRecord {
    let record = match context.provider {
        Some(provider) => agent_iteration(context, provider, task, iteration, previous),
        None => deterministic_iteration(context, task, iteration),
    };
    info!(
        status = record.result.label(),
        actions = record.actions.len(),
        "iteration finished"
    );
    record
}

fn deterministic_iteration<E: Executor>(
    context: &mut LoopContext<'_, E>,
    task: &Task,
    iteration: u32,
) -> IterationRecord {
    let started = Instant::now();
    let check = {
        let mut ctx = create_completion_context(&mut context.executor);
        check_completion(task, &mut ctx)
    };
    let Some(check) = check else {
        return IterationRecord {
            iteration,
            result: IterationResult::Blocked {
                blocker: NO_CRITERIA_BLOCKER.to_string(),
            },
            actions: Vec::new(),
            cost_usd: 0.0,
        };
    };

    let kind = task
        .completion
        .as_ref()
        .map(|criteria| criteria.kind())
        .unwrap_or("completion");
    let action = action(ActionType::Eval, kind, None, Some(check.reason.clone()), started);
    invoke_hook(
        context.hooks,
        HookEvent::Action {
            task,
            action: &action,
        },
    );
    let result = if check.complete {
        IterationResult::Complete {
            artifacts: check.artifacts.unwrap_or_default(),
        }
    } else {
        IterationResult::Continue {
            reason: check.reason,
        }
    };
    IterationRecord {
        iteration,
        result,
        actions: vec![action],
        cost_usd: 0.0,
    }
}

fn agent_iteration<E: Executor>(
    context: &mut LoopContext<'_, E>,
    provider: &dyn Provider,
    task: &Task,
    iteration: u32,
    previous: Option<&IterationRecord>,
) -> IterationRecord {
    let failed = |error: String| IterationRecord {
        iteration,
        result: IterationResult::Failed {
            error: truncate_reason(&error),
        },
        actions: Vec::new(),
        cost_usd: 0.0,
    };

    let inputs = PromptInputs {
        task,
        iteration,
        max_iterations: context.config.scheduler.max_iterations_per_task,
        previous: previous.map(|record| (&record.result, record.actions.as_slice())),
    };
    let prompt = match render_iteration_prompt(&inputs, PROMPT_BUDGET_BYTES) {
        Ok(prompt) => prompt,
        Err(err) => return failed(format!("Prompt error: {err:#}")),
    };
    let request = ChatRequest {
        system: SYSTEM_PROMPT.to_string(),
        messages: vec![ChatMessage::user(prompt)],
        tools: tool_specs(),
    };
    let response = match provider.chat(&request) {
        Ok(response) => response,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "provider call failed");
            return failed(format!("Provider error: {err:#}"));
        }
    };
    debug!(
        finish_reason = ?response.finish_reason,
        tool_calls = response.tool_calls.len(),
        "provider responded"
    );

    let mut outcome = ToolOutcome::default();
    for call in &response.tool_calls {
        let started = Instant::now();
        let invocation = match parse_tool_call(call) {
            Ok(invocation) => invocation,
            Err(err) => {
                warn!(tool = %call.name, err = %err, "invalid tool call skipped");
                let skipped = action(
                    ActionType::Eval,
                    &call.name,
                    Some(call.arguments.to_string()),
                    Some(err.to_string()),
                    started,
                );
                push_action(context, task, &mut outcome.actions, skipped);
                continue;
            }
        };
        match invocation {
            ToolInvocation::TaskComplete { artifacts, summary } => {
                if let Some(summary) = summary {
                    info!(summary = %summary, "agent reported completion");
                }
                outcome.complete.get_or_insert(artifacts);
            }
            ToolInvocation::TaskBlocked { reason } => {
                outcome.blocked.get_or_insert(reason);
            }
            other => {
                let (executed, policy_error) = run_tool(&mut context.executor, other, started);
                outcome.executed += 1;
                push_action(context, task, &mut outcome.actions, executed);
                if let Some(error) = policy_error {
                    outcome.failure = Some(error);
                    break;
                }
            }
        }
    }

    IterationRecord {
        iteration,
        result: outcome.classify(&response),
        actions: outcome.actions,
        cost_usd: response.cost_usd(),
    }
}

#[derive(Debug, Default)]
struct ToolOutcome {
    actions: Vec<Action>,
    executed: usize,
    complete: Option<Vec<String>>,
    blocked: Option<String>,
    failure: Option<String>,
}

impl ToolOutcome {
    fn classify(&self, response: &ChatResponse) -> IterationResult {
        if let Some(error) = &self.failure {
            return IterationResult::Failed {
                error: truncate_reason(error),
            };
        }
        if let Some(artifacts) = &self.complete {
            return IterationResult::Complete {
                artifacts: artifacts.clone(),
            };
        }
        if let Some(reason) = &self.blocked {
            return IterationResult::Blocked {
                blocker: truncate_reason(reason),
            };
        }
        match response.finish_reason {
            FinishReason::Error => IterationResult::Failed {
                error: truncate_reason(&format!("Provider error: {}", response.text)),
            },
            FinishReason::Stop if response.tool_calls.is_empty() => IterationResult::Continue {
                reason: truncate_reason(&response.text),
            },
            FinishReason::Length => IterationResult::Continue {
                reason: "Response truncated (length limit)".to_string(),
            },
            _ => IterationResult::Continue {
                reason: format!("Executed {} tool call(s)", self.executed),
            },
        }
    }
}

/// Execute a file or shell tool. The second value is set when the executor refused the
/// call on policy grounds.
fn run_tool<E: Executor>(
    executor: &mut E,
    invocation: ToolInvocation,
    started: Instant,
) -> (Action, Option<String>) {
    let (action_type, target, input, result) = match invocation {
        ToolInvocation::ReadFile { path } => {
            let result = executor.read_file(&path);
            (ActionType::Read, path, None, result)
        }
        ToolInvocation::WriteFile { path, content } => {
            let result = executor
                .write_file(&path, &content)
                .map(|()| format!("buffered {} bytes", content.len()));
            (ActionType::Write, path, Some(content), result)
        }
        ToolInvocation::DeleteFile { path } => {
            let result = executor.delete_file(&path).map(|()| "deleted".to_string());
            (ActionType::Write, path, None, result)
        }
        ToolInvocation::Bash { command } => {
            let result = executor.bash(&command).map(|out| {
                let mut text = format!("exit {}\n{}", out.exit_code, out.stdout);
                if !out.stderr.is_empty() {
                    text.push_str("\n[stderr]\n");
                    text.push_str(&out.stderr);
                }
                text
            });
            (ActionType::Bash, command, None, result)
        }
        ToolInvocation::TaskComplete { .. } | ToolInvocation::TaskBlocked { .. } => {
            return (
                action(ActionType::Eval, "signal", None, None, started),
                None,
            );
        }
    };
    match result {
        Ok(output) => (action(action_type, &target, input, Some(output), started), None),
        Err(err) => {
            let message = format!("{err:#}");
            let policy_error = err.downcast_ref::<SandboxError>().map(|e| e.to_string());
            (
                action(action_type, &target, input, Some(message), started),
                policy_error,
            )
        }
    }
}

fn push_action<E: Executor>(
    context: &LoopContext<'_, E>,
    task: &Task,
    actions: &mut Vec<Action>,
    action: Action,
) {
    invoke_hook(
        context.hooks,
        HookEvent::Action {
            task,
            action: &action,
        },
    );
    actions.push(action);
}

fn action(
    action_type: ActionType,
    target: &str,
    input: Option<String>,
    output: Option<String>,
    started: Instant,
) -> Action {
    Action {
        action_type,
        target: target.to_string(),
        input,
        output,
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        timestamp: Utc::now(),
    }
}
