//! Shared deterministic types for the delivery engine.
//!
//! These types define stable contracts between the scheduler, executor, completion
//! checker and the persisted logs. They carry no I/O and serialize to the JSON shapes
//! stored under `state/`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of work a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Epic,
    Feature,
    Task,
    Subtask,
    Bug,
    Refactor,
    Docs,
    Test,
    Spike,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Epic => "epic",
            TaskType::Feature => "feature",
            TaskType::Task => "task",
            TaskType::Subtask => "subtask",
            TaskType::Bug => "bug",
            TaskType::Refactor => "refactor",
            TaskType::Docs => "docs",
            TaskType::Test => "test",
            TaskType::Spike => "spike",
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Discovered,
    Pending,
    InProgress,
    Blocked,
    Review,
    Done,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Discovered => "discovered",
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Review => "review",
            TaskStatus::Done => "done",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// Machine-checkable completion condition declared by a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompletionCriteria {
    /// Run a test command; exit 0 means complete.
    TestPassing {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        grep: Option<String>,
    },
    /// A file must exist with non-empty content.
    FileExists { path: String },
    /// Run a custom script; stdout lines become artifacts.
    Validate { script: String },
}

impl CompletionCriteria {
    pub fn kind(&self) -> &'static str {
        match self {
            CompletionCriteria::TestPassing { .. } => "test_passing",
            CompletionCriteria::FileExists { .. } => "file_exists",
            CompletionCriteria::Validate { .. } => "validate",
        }
    }
}

/// A unit of work tracked in `state/tasks.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<CompletionCriteria>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a single iteration of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IterationResult {
    Complete { artifacts: Vec<String> },
    Blocked { blocker: String },
    Failed { error: String },
    Continue { reason: String },
}

impl IterationResult {
    pub fn label(&self) -> &'static str {
        match self {
            IterationResult::Complete { .. } => "complete",
            IterationResult::Blocked { .. } => "blocked",
            IterationResult::Failed { .. } => "failed",
            IterationResult::Continue { .. } => "continue",
        }
    }

    /// Human-readable detail carried by the variant.
    pub fn detail(&self) -> String {
        match self {
            IterationResult::Complete { artifacts } => {
                if artifacts.is_empty() {
                    "no artifacts".to_string()
                } else {
                    format!("artifacts: {}", artifacts.join(", "))
                }
            }
            IterationResult::Blocked { blocker } => blocker.clone(),
            IterationResult::Failed { error } => error.clone(),
            IterationResult::Continue { reason } => reason.clone(),
        }
    }
}

/// Result of evaluating a task's completion criteria.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionCheckResult {
    pub complete: bool,
    /// Diagnostic, at most 500 characters.
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Read,
    Write,
    Bash,
    Eval,
}

/// Audit record of something the executor did on behalf of an iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Captured result of a shell command run through an executor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BashOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl BashOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_uses_camel_case_and_type_field() {
        let raw = r#"{
            "id": "RALPH-001",
            "type": "feature",
            "title": "Add parser",
            "status": "in_progress",
            "externalId": "GH-12",
            "completion": {"type": "file_exists", "path": "src/parser.rs"},
            "createdAt": "2026-01-01T00:00:00Z",
            "updatedAt": "2026-01-02T00:00:00Z"
        }"#;
        let task: Task = serde_json::from_str(raw).expect("parse task");
        assert_eq!(task.task_type, TaskType::Feature);
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.external_id.as_deref(), Some("GH-12"));
        assert_eq!(
            task.completion,
            Some(CompletionCriteria::FileExists {
                path: "src/parser.rs".to_string()
            })
        );
        assert!(task.tags.is_empty());
        assert!(task.description.is_empty());
    }

    #[test]
    fn test_passing_criteria_fields_are_optional() {
        let criteria: CompletionCriteria =
            serde_json::from_str(r#"{"type":"test_passing"}"#).expect("parse");
        assert_eq!(
            criteria,
            CompletionCriteria::TestPassing {
                command: None,
                grep: None
            }
        );
        assert_eq!(criteria.kind(), "test_passing");
    }

    #[test]
    fn iteration_result_serializes_with_status_tag() {
        let result = IterationResult::Blocked {
            blocker: "needs credentials".to_string(),
        };
        let value = serde_json::to_value(&result).expect("serialize");
        assert_eq!(value["status"], "blocked");
        assert_eq!(value["blocker"], "needs credentials");
    }
}
