//! Observer hooks fired by the scheduler.
//!
//! Hooks observe; they never steer. [`invoke_hook`] swallows both returned errors and
//! panics so a misbehaving observer cannot interrupt a run.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::{error, warn};

use crate::core::budget::LimitKind;
use crate::core::types::{Action, IterationResult, Task};

#[derive(Debug, Clone, Copy)]
pub enum HookEvent<'a> {
    IterationStart {
        task: &'a Task,
        iteration: u32,
    },
    IterationEnd {
        task: &'a Task,
        iteration: u32,
        result: &'a IterationResult,
    },
    Action {
        task: &'a Task,
        action: &'a Action,
    },
    TaskComplete {
        task: &'a Task,
        artifacts: &'a [String],
    },
    TaskBlocked {
        task: &'a Task,
        blocker: &'a str,
    },
    LimitReached {
        task: &'a Task,
        limit: LimitKind,
    },
}

impl HookEvent<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            HookEvent::IterationStart { .. } => "on_iteration_start",
            HookEvent::IterationEnd { .. } => "on_iteration_end",
            HookEvent::Action { .. } => "on_action",
            HookEvent::TaskComplete { .. } => "on_task_complete",
            HookEvent::TaskBlocked { .. } => "on_task_blocked",
            HookEvent::LimitReached { .. } => "on_limit_reached",
        }
    }

    pub fn task(&self) -> &Task {
        match self {
            HookEvent::IterationStart { task, .. }
            | HookEvent::IterationEnd { task, .. }
            | HookEvent::Action { task, .. }
            | HookEvent::TaskComplete { task, .. }
            | HookEvent::TaskBlocked { task, .. }
            | HookEvent::LimitReached { task, .. } => task,
        }
    }
}

pub type Hook = Box<dyn Fn(&HookEvent<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Optional observers, one slot per event kind.
#[derive(Default)]
pub struct Hooks {
    pub on_iteration_start: Option<Hook>,
    pub on_iteration_end: Option<Hook>,
    pub on_action: Option<Hook>,
    pub on_task_complete: Option<Hook>,
    pub on_task_blocked: Option<Hook>,
    pub on_limit_reached: Option<Hook>,
}

impl Hooks {
    /// Install the same observer in every slot.
    pub fn all<F>(hook: F) -> Self
    where
        F: Fn(&HookEvent<'_>) -> anyhow::Result<()> + Send + Sync + Clone + 'static,
    {
        Self {
            on_iteration_start: Some(Box::new(hook.clone())),
            on_iteration_end: Some(Box::new(hook.clone())),
            on_action: Some(Box::new(hook.clone())),
            on_task_complete: Some(Box::new(hook.clone())),
            on_task_blocked: Some(Box::new(hook.clone())),
            on_limit_reached: Some(Box::new(hook)),
        }
    }

    fn slot(&self, event: &HookEvent<'_>) -> Option<&Hook> {
        match event {
            HookEvent::IterationStart { .. } => self.on_iteration_start.as_ref(),
            HookEvent::IterationEnd { .. } => self.on_iteration_end.as_ref(),
            HookEvent::Action { .. } => self.on_action.as_ref(),
            HookEvent::TaskComplete { .. } => self.on_task_complete.as_ref(),
            HookEvent::TaskBlocked { .. } => self.on_task_blocked.as_ref(),
            HookEvent::LimitReached { .. } => self.on_limit_reached.as_ref(),
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("on_iteration_start", &self.on_iteration_start.is_some())
            .field("on_iteration_end", &self.on_iteration_end.is_some())
            .field("on_action", &self.on_action.is_some())
            .field("on_task_complete", &self.on_task_complete.is_some())
            .field("on_task_blocked", &self.on_task_blocked.is_some())
            .field("on_limit_reached", &self.on_limit_reached.is_some())
            .finish()
    }
}

/// Fire the hook registered for `event`, if any. Never fails.
pub fn invoke_hook(hooks: Option<&Hooks>, event: HookEvent<'_>) {
    let Some(hook) = hooks.and_then(|hooks| hooks.slot(&event)) else {
        return;
    };
    let hook_name = event.name();
    let task_id = event.task().id.as_str();
    match catch_unwind(AssertUnwindSafe(|| hook(&event))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!(hook = hook_name, task_id, err = %format!("{err:#}"), "hook returned an error");
        }
        Err(payload) => {
            warn!(
                hook = hook_name,
                task_id,
                payload = %panic_message(payload.as_ref()),
                "hook panicked"
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return (*msg).to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::task;
    use anyhow::anyhow;
    use std::sync::{Arc, Mutex};

    #[test]
    fn missing_hooks_are_no_ops() {
        let t = task("T-1");
        invoke_hook(
            None,
            HookEvent::IterationStart {
                task: &t,
                iteration: 1,
            },
        );
        invoke_hook(
            Some(&Hooks::default()),
            HookEvent::TaskBlocked {
                task: &t,
                blocker: "x",
            },
        );
    }

    #[test]
    fn dispatches_to_the_matching_slot() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let hooks = Hooks {
            on_task_complete: Some(Box::new(move |event: &HookEvent<'_>| {
                if let HookEvent::TaskComplete { artifacts, .. } = event {
                    sink.lock().expect("lock").push(artifacts.join(","));
                }
                Ok(())
            })),
            ..Hooks::default()
        };
        let t = task("T-1");
        let artifacts = vec!["a.rs".to_string(), "b.rs".to_string()];
        invoke_hook(
            Some(&hooks),
            HookEvent::IterationStart {
                task: &t,
                iteration: 1,
            },
        );
        invoke_hook(
            Some(&hooks),
            HookEvent::TaskComplete {
                task: &t,
                artifacts: &artifacts,
            },
        );
        assert_eq!(*seen.lock().expect("lock"), vec!["a.rs,b.rs".to_string()]);
    }

    #[test]
    fn errors_and_panics_are_swallowed() {
        let t = task("T-1");
        let failing = Hooks::all(|_| Err(anyhow!("observer down")));
        invoke_hook(
            Some(&failing),
            HookEvent::LimitReached {
                task: &t,
                limit: LimitKind::Iterations { max: 3 },
            },
        );

        let panicking = Hooks::all(|_| panic!("observer exploded"));
        invoke_hook(
            Some(&panicking),
            HookEvent::TaskBlocked {
                task: &t,
                blocker: "needs creds",
            },
        );
    }

    #[test]
    fn panic_message_reads_common_payloads() {
        let from_str: Box<dyn Any + Send> = Box::new("static");
        let from_string: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let other: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(from_str.as_ref()), "static");
        assert_eq!(panic_message(from_string.as_ref()), "owned");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
