//! Task status state machine.
//!
//! `discovered|pending → in_progress → {review, blocked, done, cancelled}`. `done`,
//! `cancelled` and `blocked` are terminal. Any non-terminal task may be cancelled, and
//! `review` may still settle into `done`.

use crate::core::types::TaskStatus;

pub fn is_terminal(status: TaskStatus) -> bool {
    matches!(
        status,
        TaskStatus::Done | TaskStatus::Cancelled | TaskStatus::Blocked
    )
}

/// True when the scheduler may pick a task with this status.
pub fn is_actionable(status: TaskStatus) -> bool {
    matches!(
        status,
        TaskStatus::Discovered | TaskStatus::Pending | TaskStatus::InProgress
    )
}

/// Validate a status transition. Returns a stable error message on rejection.
///
/// Re-asserting the current status is accepted as a no-op.
pub fn validate_transition(from: TaskStatus, to: TaskStatus) -> Result<(), String> {
    if from == to {
        return Ok(());
    }
    if is_terminal(from) {
        return Err(format!(
            "task is {} (terminal); cannot move to {}",
            from.as_str(),
            to.as_str()
        ));
    }
    let allowed = match (from, to) {
        (_, TaskStatus::Cancelled) => true,
        (TaskStatus::Discovered, TaskStatus::Pending) => true,
        (TaskStatus::Discovered | TaskStatus::Pending, TaskStatus::InProgress) => true,
        (
            TaskStatus::InProgress,
            TaskStatus::Review | TaskStatus::Blocked | TaskStatus::Done,
        ) => true,
        (TaskStatus::Review, TaskStatus::Done | TaskStatus::InProgress) => true,
        _ => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(format!(
            "invalid status transition {} -> {}",
            from.as_str(),
            to.as_str()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_path_is_accepted() {
        assert!(validate_transition(TaskStatus::Pending, TaskStatus::InProgress).is_ok());
        assert!(validate_transition(TaskStatus::Discovered, TaskStatus::InProgress).is_ok());
        assert!(validate_transition(TaskStatus::InProgress, TaskStatus::Done).is_ok());
        assert!(validate_transition(TaskStatus::InProgress, TaskStatus::Review).is_ok());
        assert!(validate_transition(TaskStatus::InProgress, TaskStatus::Blocked).is_ok());
        assert!(validate_transition(TaskStatus::Review, TaskStatus::Done).is_ok());
    }

    #[test]
    fn terminal_states_do_not_move() {
        let err = validate_transition(TaskStatus::Done, TaskStatus::InProgress).unwrap_err();
        assert!(err.contains("terminal"));
        assert!(validate_transition(TaskStatus::Blocked, TaskStatus::Pending).is_err());
        assert!(validate_transition(TaskStatus::Cancelled, TaskStatus::Done).is_err());
    }

    #[test]
    fn skipping_in_progress_is_rejected() {
        let err = validate_transition(TaskStatus::Pending, TaskStatus::Done).unwrap_err();
        assert_eq!(err, "invalid status transition pending -> done");
    }

    #[test]
    fn same_status_is_a_no_op() {
        assert!(validate_transition(TaskStatus::InProgress, TaskStatus::InProgress).is_ok());
        assert!(validate_transition(TaskStatus::Done, TaskStatus::Done).is_ok());
    }

    #[test]
    fn cancel_from_any_open_state() {
        for from in [
            TaskStatus::Discovered,
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Review,
        ] {
            assert!(validate_transition(from, TaskStatus::Cancelled).is_ok());
        }
    }
}
