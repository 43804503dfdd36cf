//! `state/progress.jsonl`: product-level event log read by notifications and `ralph status`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::types::TaskStatus;
use crate::io::jsonl::{append_line, read_lines};

pub const PROGRESS_FILE: &str = "progress.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    GitActivity {
        task_id: String,
        message: String,
        files: Vec<String>,
    },
    StatusChange {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    PolicyViolation {
        task_id: String,
        rule: String,
        detail: String,
    },
    AnomalyDetected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        description: String,
    },
    LimitReached {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        limit: String,
        detail: String,
    },
    Iteration {
        task_id: String,
        iteration: u32,
        status: String,
        detail: String,
        actions: usize,
    },
}

impl ProgressEvent {
    pub fn task_id(&self) -> Option<&str> {
        match self {
            ProgressEvent::GitActivity { task_id, .. }
            | ProgressEvent::StatusChange { task_id, .. }
            | ProgressEvent::PolicyViolation { task_id, .. }
            | ProgressEvent::Iteration { task_id, .. } => Some(task_id),
            ProgressEvent::AnomalyDetected { task_id, .. }
            | ProgressEvent::LimitReached { task_id, .. } => task_id.as_deref(),
        }
    }
}

/// One line of the progress log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: ProgressEvent,
}

#[derive(Debug)]
pub struct ProgressLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ProgressLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn in_state_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(PROGRESS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: ProgressEvent) -> Result<()> {
        let record = ProgressRecord {
            timestamp: Utc::now(),
            event,
        };
        let _guard = self
            .lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        append_line(&self.path, &record)
    }

    /// Append, logging instead of failing. The progress log never stops a run.
    pub fn record(&self, event: ProgressEvent) {
        if let Err(err) = self.append(event) {
            warn!(path = %self.path.display(), err = %err, "failed to append progress event");
        }
    }

    pub fn read_all(&self) -> Result<Vec<ProgressRecord>> {
        read_lines(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_carry_type_tag_and_timestamp() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = ProgressLog::in_state_dir(temp.path());
        log.record(ProgressEvent::StatusChange {
            task_id: "T-1".to_string(),
            from: TaskStatus::Pending,
            to: TaskStatus::InProgress,
        });
        log.record(ProgressEvent::LimitReached {
            task_id: Some("T-1".to_string()),
            limit: "iterations".to_string(),
            detail: "iteration limit reached (3)".to_string(),
        });

        let raw = std::fs::read_to_string(log.path()).expect("read");
        let first: serde_json::Value =
            serde_json::from_str(raw.lines().next().expect("line")).expect("json");
        assert_eq!(first["type"], "status_change");
        assert_eq!(first["to"], "in_progress");
        assert!(first["timestamp"].is_string());

        let records = log.read_all().expect("read all");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].event.task_id(), Some("T-1"));
        assert!(matches!(
            records[1].event,
            ProgressEvent::LimitReached { ref limit, .. } if limit == "iterations"
        ));
    }
}
