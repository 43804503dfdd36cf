//! LLM provider abstraction and the tool-calling surface offered to the agent.
//!
//! The crate ships no transport. A [`Provider`] implementation turns a [`ChatRequest`]
//! into a [`ChatResponse`]; tool calls in the response are validated against the JSON
//! schemas from [`tool_specs`] and parsed into the closed [`ToolInvocation`] set.

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_call_id: None,
        }
    }
}

/// A tool the agent may call, with its JSON Schema for arguments.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatResponse {
    pub fn cost_usd(&self) -> f64 {
        self.usage.and_then(|usage| usage.cost_usd).unwrap_or(0.0)
    }
}

/// Blocking chat completion backend.
pub trait Provider: Send + Sync {
    fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;
}

/// A validated tool call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "tool", content = "args", rename_all = "snake_case")]
pub enum ToolInvocation {
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        content: String,
    },
    DeleteFile {
        path: String,
    },
    Bash {
        command: String,
    },
    TaskComplete {
        #[serde(default)]
        artifacts: Vec<String>,
        #[serde(default)]
        summary: Option<String>,
    },
    TaskBlocked {
        reason: String,
    },
}

/// Tools offered to the agent on every iteration.
pub fn tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "read_file",
            description: "Read a file from the workspace, including buffered changes.",
            parameters: object_schema(json!({"path": {"type": "string", "minLength": 1}}), &["path"]),
        },
        ToolSpec {
            name: "write_file",
            description: "Write a file. Changes are buffered until the task's checks pass.",
            parameters: object_schema(
                json!({
                    "path": {"type": "string", "minLength": 1},
                    "content": {"type": "string"}
                }),
                &["path", "content"],
            ),
        },
        ToolSpec {
            name: "delete_file",
            description: "Delete a file. The delete is buffered like writes.",
            parameters: object_schema(json!({"path": {"type": "string", "minLength": 1}}), &["path"]),
        },
        ToolSpec {
            name: "bash",
            description: "Run a shell command in the workspace root.",
            parameters: object_schema(
                json!({"command": {"type": "string", "minLength": 1}}),
                &["command"],
            ),
        },
        ToolSpec {
            name: "task_complete",
            description: "Declare the task complete once its completion criteria hold.",
            parameters: object_schema(
                json!({
                    "artifacts": {"type": "array", "items": {"type": "string"}},
                    "summary": {"type": "string"}
                }),
                &[],
            ),
        },
        ToolSpec {
            name: "task_blocked",
            description: "Stop work on the task because it needs outside help.",
            parameters: object_schema(
                json!({"reason": {"type": "string", "minLength": 1}}),
                &["reason"],
            ),
        },
    ]
}

fn object_schema(properties: Value, required: &[&str]) -> Value {
    let mut schema = json!({
        "type": "object",
        "properties": properties,
        "additionalProperties": false
    });
    if !required.is_empty() {
        schema["required"] = json!(required);
    }
    schema
}

/// Validate `call.arguments` against its tool's schema and parse it.
pub fn parse_tool_call(call: &ToolCall) -> Result<ToolInvocation> {
    let specs = tool_specs();
    let spec = specs
        .iter()
        .find(|spec| spec.name == call.name)
        .ok_or_else(|| anyhow!("unknown tool: {}", call.name))?;
    let validator =
        validator_for(&spec.parameters).map_err(|err| anyhow!("invalid tool schema: {err}"))?;
    if !validator.is_valid(&call.arguments) {
        let messages = validator
            .iter_errors(&call.arguments)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "invalid arguments for {}: {}",
            call.name,
            messages.join("; ")
        ));
    }
    serde_json::from_value(json!({"tool": call.name, "args": call.arguments}))
        .with_context(|| format!("parse arguments for {}", call.name))
}
