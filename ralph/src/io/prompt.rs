//! Iteration prompt rendering with a byte budget.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::types::{Action, ActionType, CompletionCriteria, IterationResult, Task};

const ITERATION_TEMPLATE: &str = include_str!("prompts/iteration.md");

/// Default prompt budget in bytes.
pub const PROMPT_BUDGET_BYTES: usize = 48_000;

/// Per-action output kept in the prompt.
const ACTION_OUTPUT_BYTES: usize = 2_000;

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker pattern is valid")
});

#[derive(Debug, Clone, Serialize)]
struct TaskContext {
    id: String,
    kind: String,
    title: String,
    description: String,
    tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ActionContext {
    kind: &'static str,
    target: String,
    output: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct PreviousContext {
    status: &'static str,
    detail: String,
    actions: Vec<ActionContext>,
}

/// Everything the iteration prompt needs.
#[derive(Debug, Clone, Copy)]
pub struct PromptInputs<'a> {
    pub task: &'a Task,
    pub iteration: u32,
    pub max_iterations: u32,
    pub previous: Option<(&'a IterationResult, &'a [Action])>,
}

/// Render the iteration prompt and fit it to `budget_bytes`.
///
/// Drop order when over budget: previous actions, then the previous result. Required
/// sections are truncated as a last resort.
pub fn render_iteration_prompt(inputs: &PromptInputs<'_>, budget_bytes: usize) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("iteration", ITERATION_TEMPLATE)
        .context("load iteration template")?;
    let template = env.get_template("iteration")?;

    let task = inputs.task;
    let previous = inputs.previous.map(|(result, actions)| PreviousContext {
        status: result.label(),
        detail: result.detail(),
        actions: actions.iter().map(action_context).collect(),
    });
    let rendered = template
        .render(context! {
            task => TaskContext {
                id: task.id.clone(),
                kind: task.task_type.as_str().to_string(),
                title: task.title.clone(),
                description: task.description.trim().to_string(),
                tags: task.tags.clone(),
            },
            iteration => inputs.iteration,
            max_iterations => inputs.max_iterations,
            criteria => task.completion.as_ref().map(describe_criteria),
            previous => previous,
        })
        .context("render iteration template")?;

    let mut sections = parse_sections(&rendered);
    apply_budget_to_sections(&mut sections, budget_bytes);
    Ok(render_sections(&sections))
}

/// One-line, human-readable description of completion criteria.
pub fn describe_criteria(criteria: &CompletionCriteria) -> String {
    match criteria {
        CompletionCriteria::TestPassing { command, grep } => match (command, grep) {
            (Some(command), _) => format!("The command `{command}` must exit 0."),
            (None, Some(grep)) => format!("Tests matching \"{grep}\" must pass."),
            (None, None) => "Tests for this task must pass.".to_string(),
        },
        CompletionCriteria::FileExists { path } => {
            format!("The file `{path}` must exist and be non-empty.")
        }
        CompletionCriteria::Validate { script } => {
            format!("The validation script `{script}` must exit 0.")
        }
    }
}

fn action_context(action: &Action) -> ActionContext {
    let kind = match action.action_type {
        ActionType::Read => "read",
        ActionType::Write => "write",
        ActionType::Bash => "bash",
        ActionType::Eval => "eval",
    };
    ActionContext {
        kind,
        target: action.target.clone(),
        output: action
            .output
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| truncate_bytes(s, ACTION_OUTPUT_BYTES)),
    }
}

fn truncate_bytes(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[truncated]", &s[..end])
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Split rendered output on `<!-- section:KEY required|droppable -->` markers.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in ["actions", "previous"] {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    if total_len(sections) <= budget {
        return;
    }
    let other_len: usize = sections
        .iter()
        .rev()
        .skip(1)
        .map(|s| s.content.len())
        .sum();
    let allowed = budget.saturating_sub(other_len);
    if let Some(last) = sections.last_mut() {
        let before_len = last.content.len();
        last.content = truncate_bytes(&last.content, allowed.saturating_sub(12));
        debug!(
            section = %last.key,
            before_len,
            after_len = last.content.len(),
            "truncated section for budget"
        );
    }
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
