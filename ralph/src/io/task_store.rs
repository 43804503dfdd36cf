//! `state/tasks.jsonl`: the append-only task log.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use chrono::Utc;
use tracing::debug;

use crate::core::status::validate_transition;
use crate::core::task_log::{TaskChanges, TaskOp, fold_operations};
use crate::core::types::{Task, TaskStatus};
use crate::io::jsonl::{append_line, read_lines};

pub const TASKS_FILE: &str = "tasks.jsonl";

#[derive(Debug)]
pub struct TaskStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn in_state_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(TASKS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, op: &TaskOp) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        append_line(&self.path, op)
    }

    pub fn read_ops(&self) -> Result<Vec<TaskOp>> {
        read_lines(&self.path)
    }

    /// Current task state, ordered by id.
    pub fn load_tasks(&self) -> Result<Vec<Task>> {
        let ops = self.read_ops()?;
        Ok(fold_operations(&ops).into_values().collect())
    }

    pub fn create(&self, task: &Task) -> Result<()> {
        self.append(&TaskOp::Create {
            task: task.clone(),
            timestamp: Utc::now(),
        })
    }

    /// Validate and record a status transition.
    pub fn record_status(&self, id: &str, from: TaskStatus, to: TaskStatus) -> Result<()> {
        validate_transition(from, to).map_err(|msg| anyhow!("task {id}: {msg}"))?;
        if from == to {
            return Ok(());
        }
        debug!(task_id = id, from = from.as_str(), to = to.as_str(), "status change");
        self.append(&TaskOp::Update {
            id: id.to_string(),
            changes: TaskChanges::status(to),
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::task;

    #[test]
    fn records_status_changes_and_folds_them() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = TaskStore::in_state_dir(temp.path());
        store.create(&task("T-1")).expect("create");
        store.create(&task("T-2")).expect("create");
        store
            .record_status("T-1", TaskStatus::Pending, TaskStatus::InProgress)
            .expect("start");
        store
            .record_status("T-1", TaskStatus::InProgress, TaskStatus::Done)
            .expect("finish");

        let tasks = store.load_tasks().expect("load");
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, "T-1");
        assert_eq!(tasks[0].status, TaskStatus::Done);
        assert_eq!(tasks[1].status, TaskStatus::Pending);
        assert_eq!(store.read_ops().expect("ops").len(), 4);
    }

    #[test]
    fn rejects_transitions_out_of_terminal_states() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = TaskStore::in_state_dir(temp.path());
        let err = store
            .record_status("T-1", TaskStatus::Done, TaskStatus::InProgress)
            .expect_err("terminal");
        assert!(err.to_string().contains("T-1"));
        assert!(store.read_ops().expect("ops").is_empty());
    }
}
