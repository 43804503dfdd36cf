//! Append-only task operations and the fold that derives current task state.
//!
//! Tasks are never edited in place: `create`, `update` and `link` operations are
//! appended to `state/tasks.jsonl` and the current state is the left fold of that log.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::types::{CompletionCriteria, Task, TaskStatus};

/// Partial task update. Only `Some` fields are applied.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<CompletionCriteria>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl TaskChanges {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// One line of `state/tasks.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TaskOp {
    Create {
        task: Task,
        timestamp: DateTime<Utc>,
    },
    Update {
        id: String,
        changes: TaskChanges,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Link {
        id: String,
        external_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        external_url: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

/// Fold operations into the current task map, keyed by id.
///
/// Duplicate creates and operations on unknown ids are skipped with a warning so a
/// single bad line cannot hide the rest of the backlog.
pub fn fold_operations<'a, I>(ops: I) -> BTreeMap<String, Task>
where
    I: IntoIterator<Item = &'a TaskOp>,
{
    let mut tasks = BTreeMap::new();
    for op in ops {
        apply_operation(&mut tasks, op);
    }
    tasks
}

pub fn apply_operation(tasks: &mut BTreeMap<String, Task>, op: &TaskOp) {
    match op {
        TaskOp::Create { task, .. } => {
            if tasks.contains_key(&task.id) {
                warn!(task_id = %task.id, "duplicate create ignored");
                return;
            }
            tasks.insert(task.id.clone(), task.clone());
        }
        TaskOp::Update {
            id,
            changes,
            timestamp,
        } => {
            let Some(task) = tasks.get_mut(id) else {
                warn!(task_id = %id, "update for unknown task ignored");
                return;
            };
            if let Some(status) = changes.status {
                task.status = status;
            }
            if let Some(title) = &changes.title {
                task.title = title.clone();
            }
            if let Some(description) = &changes.description {
                task.description = description.clone();
            }
            if let Some(completion) = &changes.completion {
                task.completion = Some(completion.clone());
            }
            if let Some(tags) = &changes.tags {
                task.tags = tags.clone();
            }
            task.updated_at = *timestamp;
        }
        TaskOp::Link {
            id,
            external_id,
            external_url,
            timestamp,
        } => {
            let Some(task) = tasks.get_mut(id) else {
                warn!(task_id = %id, "link for unknown task ignored");
                return;
            };
            task.external_id = Some(external_id.clone());
            task.external_url = external_url.clone();
            task.updated_at = *timestamp;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskType;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("timestamp")
    }

    fn created(id: &str, secs: i64) -> TaskOp {
        TaskOp::Create {
            task: Task {
                id: id.to_string(),
                task_type: TaskType::Task,
                title: format!("{id} title"),
                description: String::new(),
                status: TaskStatus::Pending,
                completion: None,
                parent: None,
                spec: None,
                external_id: None,
                external_url: None,
                tags: Vec::new(),
                created_at: at(secs),
                updated_at: at(secs),
            },
            timestamp: at(secs),
        }
    }

    #[test]
    fn fold_applies_updates_and_links_in_order() {
        let ops = vec![
            created("T-1", 1),
            TaskOp::Update {
                id: "T-1".to_string(),
                changes: TaskChanges::status(TaskStatus::InProgress),
                timestamp: at(2),
            },
            TaskOp::Link {
                id: "T-1".to_string(),
                external_id: "GH-7".to_string(),
                external_url: Some("https://example.test/7".to_string()),
                timestamp: at(3),
            },
            TaskOp::Update {
                id: "T-1".to_string(),
                changes: TaskChanges::status(TaskStatus::Done),
                timestamp: at(4),
            },
        ];

        let tasks = fold_operations(&ops);
        let task = tasks.get("T-1").expect("task");
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.external_id.as_deref(), Some("GH-7"));
        assert_eq!(task.updated_at, at(4));
        assert_eq!(task.created_at, at(1));
    }

    #[test]
    fn fold_skips_unknown_ids_and_duplicate_creates() {
        let mut dup = created("T-1", 5);
        if let TaskOp::Create { task, .. } = &mut dup {
            task.title = "replacement".to_string();
        }
        let ops = vec![
            created("T-1", 1),
            dup,
            TaskOp::Update {
                id: "missing".to_string(),
                changes: TaskChanges::status(TaskStatus::Done),
                timestamp: at(2),
            },
        ];

        let tasks = fold_operations(&ops);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks["T-1"].title, "T-1 title");
    }

    #[test]
    fn ops_serialize_with_op_tag_and_camel_case() {
        let op = TaskOp::Link {
            id: "T-1".to_string(),
            external_id: "LIN-4".to_string(),
            external_url: None,
            timestamp: at(0),
        };
        let value = serde_json::to_value(&op).expect("serialize");
        assert_eq!(value["op"], "link");
        assert_eq!(value["externalId"], "LIN-4");
        assert!(value.get("externalUrl").is_none());

        let update: TaskOp = serde_json::from_str(
            r#"{"op":"update","id":"T-1","changes":{"status":"review"},"timestamp":"2026-01-01T00:00:00Z"}"#,
        )
        .expect("parse update");
        assert!(matches!(
            update,
            TaskOp::Update { ref changes, .. } if changes.status == Some(TaskStatus::Review)
        ));
    }
}
