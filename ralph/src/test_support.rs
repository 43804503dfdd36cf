//! Test-only doubles for the executor, git and provider, plus task and workspace builders.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde_json::Value;

use crate::core::policy::{PolicyViolation, ViolationType};
use crate::core::types::{BashOutput, Task, TaskStatus, TaskType};
use crate::io::executor::{Executor, SandboxError};
use crate::io::git::GitClient;
use crate::provider::{ChatRequest, ChatResponse, FinishReason, Provider, ToolCall};

/// Create a pending task with deterministic defaults.
pub fn task(id: &str) -> Task {
    let now = Utc::now();
    Task {
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
        created_at: now,
        updated_at: now,
    }
}

pub fn bash_ok(stdout: &str) -> BashOutput {
    BashOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: 0,
    }
}

pub fn bash_fail(exit_code: i32, stderr: &str) -> BashOutput {
    BashOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code,
    }
}

/// In-memory executor: a map of "disk" files, a pending buffer and scripted commands.
#[derive(Debug, Default)]
pub struct MockExecutor {
    /// Files as they exist "on disk".
    pub disk: BTreeMap<String, String>,
    /// Pending changes; `None` is a delete.
    buffer: BTreeMap<String, Option<String>>,
    journal: Vec<(String, Option<String>)>,
    /// Command substring → scripted result. First match wins.
    scripts: Vec<(String, std::result::Result<BashOutput, String>)>,
    denied_writes: BTreeSet<String>,
    /// Every call, in order: `bash:<cmd>`, `read:<path>`, `write:<path>`, `delete:<path>`,
    /// `flush`, `rollback`, `revert`.
    pub calls: Vec<String>,
    pub fail_flush: bool,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_disk_file(mut self, path: &str, content: &str) -> Self {
        self.disk.insert(path.to_string(), content.to_string());
        self
    }

    pub fn on_bash(mut self, pattern: &str, output: BashOutput) -> Self {
        self.scripts.push((pattern.to_string(), Ok(output)));
        self
    }

    pub fn on_bash_error(mut self, pattern: &str, message: &str) -> Self {
        self.scripts
            .push((pattern.to_string(), Err(message.to_string())));
        self
    }

    /// Writes to `path` fail with a policy violation.
    pub fn deny_write(mut self, path: &str) -> Self {
        self.denied_writes.insert(path.to_string());
        self
    }

    pub fn bash_calls(&self) -> Vec<&str> {
        self.calls
            .iter()
            .filter_map(|call| call.strip_prefix("bash:"))
            .collect()
    }

    fn gate_write(&self, path: &str) -> Result<()> {
        if self.denied_writes.contains(path) {
            return Err(SandboxError::PolicyViolation {
                violation: PolicyViolation {
                    violation_type: ViolationType::FileWriteDenied,
                    rule: "files.allowWrite".to_string(),
                    detail: path.to_string(),
                },
            }
            .into());
        }
        Ok(())
    }
}

impl Executor for MockExecutor {
    fn bash(&mut self, command: &str) -> Result<BashOutput> {
        self.calls.push(format!("bash:{command}"));
        let scripted = self
            .scripts
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, result)| result.clone());
        match scripted {
            Some(Ok(output)) => Ok(output),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(BashOutput::default()),
        }
    }

    fn read_file(&mut self, path: &str) -> Result<String> {
        self.calls.push(format!("read:{path}"));
        match self.buffer.get(path) {
            Some(Some(content)) => Ok(content.clone()),
            Some(None) => Err(anyhow!("file not found: {path}")),
            None => self
                .disk
                .get(path)
                .cloned()
                .ok_or_else(|| anyhow!("file not found: {path}")),
        }
    }

    fn write_file(&mut self, path: &str, content: &str) -> Result<()> {
        self.calls.push(format!("write:{path}"));
        self.gate_write(path)?;
        self.buffer
            .insert(path.to_string(), Some(content.to_string()));
        Ok(())
    }

    fn delete_file(&mut self, path: &str) -> Result<()> {
        self.calls.push(format!("delete:{path}"));
        self.gate_write(path)?;
        self.buffer.insert(path.to_string(), None);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.calls.push("flush".to_string());
        if self.fail_flush {
            return Err(anyhow!("scripted flush failure"));
        }
        self.journal.clear();
        for (path, change) in std::mem::take(&mut self.buffer) {
            let prior = match change {
                Some(content) => self.disk.insert(path.clone(), content),
                None => self.disk.remove(&path),
            };
            self.journal.push((path, prior));
        }
        Ok(())
    }

    fn rollback(&mut self) {
        self.calls.push("rollback".to_string());
        self.buffer.clear();
    }

    fn revert_last_flush(&mut self) -> Result<()> {
        self.calls.push("revert".to_string());
        for (path, prior) in self.journal.drain(..).rev() {
            match prior {
                Some(content) => {
                    self.disk.insert(path, content);
                }
                None => {
                    self.disk.remove(&path);
                }
            }
        }
        Ok(())
    }

    fn pending_changes(&self) -> Vec<String> {
        let writes = self
            .buffer
            .iter()
            .filter(|(_, change)| change.is_some())
            .map(|(path, _)| path.clone());
        let deletes = self
            .buffer
            .iter()
            .filter(|(_, change)| change.is_none())
            .map(|(path, _)| path.clone());
        writes.chain(deletes).collect()
    }
}

/// Git client that records calls instead of running git.
#[derive(Debug)]
pub struct RecordingGit {
    pub calls: Mutex<Vec<String>>,
    /// Value returned by `commit` (whether anything was staged).
    pub staged: bool,
    pub fail_commit: bool,
}

impl Default for RecordingGit {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            staged: true,
            fail_commit: false,
        }
    }
}

impl RecordingGit {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn commits(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| call.strip_prefix("commit:").map(str::to_string))
            .collect()
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl GitClient for RecordingGit {
    fn add(&self, pathspec: &str) -> Result<()> {
        self.record(format!("add:{pathspec}"));
        Ok(())
    }

    fn commit(&self, message: &str) -> Result<bool> {
        if self.fail_commit {
            return Err(anyhow!("scripted commit failure"));
        }
        self.record(format!("commit:{message}"));
        Ok(self.staged)
    }

    fn checkout_task_branch(&self, branch: &str) -> Result<()> {
        self.record(format!("checkout:{branch}"));
        Ok(())
    }
}

/// Provider that replays scripted responses and records each request.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<std::result::Result<ChatResponse, String>>>,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ChatResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Ok).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push_error(&self, message: &str) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push_back(Err(message.to_string()));
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }
}

impl Provider for ScriptedProvider {
    fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let next = self
            .responses
            .lock()
            .map_err(|_| anyhow!("scripted provider lock poisoned"))?
            .pop_front();
        match next {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(text_response("nothing scripted", FinishReason::Stop)),
        }
    }
}

pub fn tool_call(name: &str, arguments: Value) -> ToolCall {
    ToolCall {
        id: format!("call-{name}"),
        name: name.to_string(),
        arguments,
    }
}

pub fn tool_response(calls: Vec<ToolCall>) -> ChatResponse {
    ChatResponse {
        text: String::new(),
        tool_calls: calls,
        finish_reason: FinishReason::ToolCalls,
        usage: None,
    }
}

pub fn text_response(text: &str, finish_reason: FinishReason) -> ChatResponse {
    ChatResponse {
        text: text.to_string(),
        tool_calls: Vec::new(),
        finish_reason,
        usage: None,
    }
}

/// Temporary project directory.
#[derive(Debug)]
pub struct TestWorkspace {
    root: tempfile::TempDir,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        Ok(Self {
            root: tempfile::tempdir().context("create temp workspace")?,
        })
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root().join("state")
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<PathBuf> {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    /// Contents of `rel` on disk, or `None` when it does not exist.
    pub fn read(&self, rel: &str) -> Option<String> {
        fs::read_to_string(self.root().join(rel)).ok()
    }
}
