//! Deterministic selection of the tasks a run should work on.

use crate::core::status::is_actionable;
use crate::core::types::{Task, TaskType};

/// Return actionable tasks in execution order (`created_at`, then id).
///
/// Epics are containers and are never executed directly.
pub fn select_runnable(tasks: &[Task]) -> Vec<&Task> {
    let mut runnable: Vec<&Task> = tasks
        .iter()
        .filter(|task| task.task_type != TaskType::Epic && is_actionable(task.status))
        .collect();
    runnable.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    runnable
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskStatus;
    use crate::test_support::task;
    use chrono::{Duration, Utc};

    #[test]
    fn selects_open_non_epic_tasks_oldest_first() {
        let now = Utc::now();
        let mut late = task("B-2");
        late.created_at = now;
        let mut early = task("B-1");
        early.created_at = now - Duration::seconds(10);
        let mut tie = task("A-9");
        tie.created_at = now;
        let mut epic = task("E-1");
        epic.task_type = TaskType::Epic;
        let mut done = task("D-1");
        done.status = TaskStatus::Done;
        let mut blocked = task("X-1");
        blocked.status = TaskStatus::Blocked;

        let tasks = vec![late, done, epic, tie, early, blocked];
        let ids: Vec<&str> = select_runnable(&tasks)
            .iter()
            .map(|task| task.id.as_str())
            .collect();
        assert_eq!(ids, vec!["B-1", "A-9", "B-2"]);
    }
}
