//! Runtime configuration (`ralph.toml`) and project policy (`.ralph/policy.toml`).

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::policy::RalphPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "ralph.toml";

/// What the scheduler does after a failed iteration or a failed commit gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    Stop,
    #[default]
    Continue,
}

/// Runtime configuration (TOML).
///
/// Edited by humans; every field has a default so a missing or partial file still
/// yields a runnable configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    #[serde(rename = "loop")]
    pub scheduler: LoopConfig,
    pub sandbox: SandboxConfig,
    pub git: GitConfig,
    pub state: StateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    pub max_iterations_per_task: u32,
    pub max_time_per_task_secs: u64,
    /// Provider-reported spend cap per task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cost_per_task_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tasks_per_run: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_time_per_run_secs: Option<u64>,
    pub on_failure: OnFailure,
    /// Number of independent tasks run concurrently.
    pub parallelism: usize,
    pub dry_run: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations_per_task: 10,
            max_time_per_task_secs: 30 * 60,
            max_cost_per_task_usd: None,
            max_tasks_per_run: None,
            max_time_per_run_secs: None,
            on_failure: OnFailure::default(),
            parallelism: 1,
            dry_run: false,
        }
    }
}

impl LoopConfig {
    pub fn max_time_per_task(&self) -> Duration {
        Duration::from_secs(self.max_time_per_task_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    pub command_timeout_secs: u64,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Workdir-relative paths the agent may not write without explicit approval.
    pub protected_paths: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 600,
            output_limit_bytes: 100_000,
            protected_paths: ["runtime", "state", ".ralph", DEFAULT_CONFIG_PATH]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    pub auto_commit: bool,
    pub commit_prefix: String,
    /// When set, each task runs on `<branch_prefix><task id>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_prefix: Option<String>,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            auto_commit: true,
            commit_prefix: "RALPH-".to_string(),
            branch_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StateConfig {
    /// Directory holding `tasks.jsonl` and `progress.jsonl`.
    pub dir: String,
    pub policy_path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: "state".to_string(),
            policy_path: ".ralph/policy.toml".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        let scheduler = &self.scheduler;
        if scheduler.max_iterations_per_task == 0 {
            return Err(anyhow!("loop.max_iterations_per_task must be > 0"));
        }
        if scheduler.max_time_per_task_secs == 0 {
            return Err(anyhow!("loop.max_time_per_task_secs must be > 0"));
        }
        if scheduler.parallelism == 0 {
            return Err(anyhow!("loop.parallelism must be > 0"));
        }
        if let Some(max_usd) = scheduler.max_cost_per_task_usd {
            if !(max_usd.is_finite() && max_usd > 0.0) {
                return Err(anyhow!("loop.max_cost_per_task_usd must be a positive number"));
            }
        }
        if scheduler.parallelism > 1 && self.git.branch_prefix.is_some() {
            return Err(anyhow!(
                "loop.parallelism > 1 cannot be combined with git.branch_prefix (tasks share one worktree)"
            ));
        }
        if scheduler.max_tasks_per_run == Some(0) {
            return Err(anyhow!("loop.max_tasks_per_run must be > 0 when set"));
        }
        if scheduler.max_time_per_run_secs == Some(0) {
            return Err(anyhow!("loop.max_time_per_run_secs must be > 0 when set"));
        }
        if self.sandbox.command_timeout_secs == 0 {
            return Err(anyhow!("sandbox.command_timeout_secs must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        if self.state.dir.trim().is_empty() {
            return Err(anyhow!("state.dir must not be empty"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RuntimeConfig::default()`.
pub fn load_config(path: &Path) -> Result<RuntimeConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = RuntimeConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RuntimeConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RuntimeConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Load the project policy. A missing file means "no policy attached".
pub fn load_policy(path: &Path) -> Result<Option<RalphPolicy>> {
    if !path.exists() {
        debug!(path = %path.display(), "no policy file");
        return Ok(None);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let policy: RalphPolicy =
        toml::from_str(&contents).with_context(|| format!("parse policy {}", path.display()))?;
    Ok(Some(policy))
}

/// Atomically write a policy file.
pub fn write_policy(path: &Path, policy: &RalphPolicy) -> Result<()> {
    let mut buf = toml::to_string_pretty(policy).context("serialize policy toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
