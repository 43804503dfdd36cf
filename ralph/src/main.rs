//! `ralph`: run the delivery loop over the task log in the current directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use ralph::core::policy::{
    RalphPolicy, check_command, check_file_read, check_file_write, default_policy,
    requires_approval,
};
use ralph::core::types::{Task, TaskStatus};
use ralph::exit_codes;
use ralph::io::config::{DEFAULT_CONFIG_PATH, RuntimeConfig, load_config, load_policy, write_policy};
use ralph::io::executor::{SandboxOptions, SandboxedExecutor, SelfModifyApproval};
use ralph::io::git::Git;
use ralph::io::progress::ProgressLog;
use ralph::io::task_store::TaskStore;
use ralph::looping::{RunDeps, RunStop, RunSummary, TaskStop, run_tasks};

#[derive(Parser)]
#[command(
    name = "ralph",
    version,
    about = "Policy-gated delivery loop for an autonomous coding agent"
)]
struct Cli {
    /// Runtime config file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Work through open tasks until they complete, block or exhaust their budget.
    Run {
        /// Evaluate and run checks without touching git or the task log.
        #[arg(long)]
        dry_run: bool,
        /// Only run this task.
        #[arg(long)]
        task: Option<String>,
    },
    /// Print task statuses.
    Status,
    /// Inspect or initialize the project policy.
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },
}

#[derive(Subcommand)]
enum PolicyCommand {
    /// Print the effective policy as TOML.
    Show,
    /// Write the default policy file.
    Init {
        /// Overwrite an existing policy.
        #[arg(short, long)]
        force: bool,
    },
    /// Check whether a shell command would be allowed.
    CheckCommand { command: String },
    /// Check whether a path may be read (or written with `--write`).
    CheckPath {
        path: String,
        #[arg(long)]
        write: bool,
    },
}

fn main() {
    ralph::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolve current directory")?;
    let config = load_config(&root.join(&cli.config))?;
    match cli.command {
        Command::Run { dry_run, task } => cmd_run(&root, config, dry_run, task.as_deref()),
        Command::Status => cmd_status(&root, &config),
        Command::Policy { command } => cmd_policy(&root, &config, command),
    }
}

fn cmd_run(
    root: &Path,
    mut config: RuntimeConfig,
    dry_run: bool,
    only: Option<&str>,
) -> Result<i32> {
    if dry_run {
        config.scheduler.dry_run = true;
    }
    let state_dir = root.join(&config.state.dir);
    let policy = load_policy(&root.join(&config.state.policy_path))?.map(Arc::new);
    let store = TaskStore::in_state_dir(&state_dir);
    let tasks = select_tasks(store.load_tasks()?, only)?;
    let progress = ProgressLog::in_state_dir(&state_dir);
    let git = Git::new(root);
    let options = SandboxOptions::from_config(&config.sandbox, SelfModifyApproval::from_env());

    let deps = RunDeps {
        git: &git,
        policy: policy.clone(),
        config: &config,
        progress: &progress,
        store: &store,
        provider: None,
        hooks: None,
        tracker: None,
    };
    let summary = run_tasks(&deps, &tasks, |_| {
        Ok(SandboxedExecutor::new(
            root,
            policy.clone(),
            options.clone(),
        ))
    });

    for result in &summary.results {
        println!(
            "{}\t{}\t{} iteration(s)\t{}",
            result.task_id,
            result.status.as_str(),
            result.iterations,
            describe_stop(&result.stop)
        );
        if let Some(err) = &result.log_error {
            eprintln!("{}: task log not updated: {err}", result.task_id);
        }
    }
    Ok(run_exit_code(&summary))
}

fn select_tasks(tasks: Vec<Task>, only: Option<&str>) -> Result<Vec<Task>> {
    let Some(id) = only else {
        return Ok(tasks);
    };
    let selected: Vec<Task> = tasks.into_iter().filter(|task| task.id == id).collect();
    if selected.is_empty() {
        bail!("unknown task: {id}");
    }
    Ok(selected)
}

fn describe_stop(stop: &TaskStop) -> String {
    match stop {
        TaskStop::Completed => "completed".to_string(),
        TaskStop::Blocked { blocker } => format!("blocked: {blocker}"),
        TaskStop::GateFailed { error } => format!("gate failed: {error}"),
        TaskStop::IterationFailed { error } => format!("failed: {error}"),
        TaskStop::LimitReached(limit) => limit.describe(),
        TaskStop::BranchFailed { error } => format!("branch failed: {error}"),
        TaskStop::EngineFailed { error } => format!("engine error: {error}"),
    }
}

fn run_exit_code(summary: &RunSummary) -> i32 {
    let hit_limit = matches!(summary.stop, RunStop::MaxTasks | RunStop::MaxTime)
        || summary
            .results
            .iter()
            .any(|result| matches!(result.stop, TaskStop::LimitReached(_)));
    if hit_limit {
        return exit_codes::LIMIT;
    }
    if summary
        .results
        .iter()
        .any(|result| !result.success || result.log_error.is_some())
    {
        return exit_codes::INCOMPLETE;
    }
    exit_codes::OK
}

fn cmd_status(root: &Path, config: &RuntimeConfig) -> Result<i32> {
    let state_dir = root.join(&config.state.dir);
    let tasks = TaskStore::in_state_dir(&state_dir).load_tasks()?;
    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for task in &tasks {
        *counts.entry(task.status.as_str()).or_default() += 1;
        println!("{}\t{}\t{}", task.id, task.status.as_str(), task.title);
    }
    let totals: Vec<String> = counts
        .iter()
        .map(|(status, count)| format!("{status}={count}"))
        .collect();
    println!("{} task(s): {}", tasks.len(), totals.join(" "));

    let events = ProgressLog::in_state_dir(&state_dir).read_all()?;
    if let Some(last) = events.last() {
        println!(
            "last event: {} {}",
            last.timestamp.to_rfc3339(),
            serde_json::to_string(&last.event).context("serialize progress event")?
        );
    }
    let open = tasks
        .iter()
        .filter(|task| matches!(task.status, TaskStatus::Pending | TaskStatus::InProgress))
        .count();
    Ok(if open == 0 {
        exit_codes::OK
    } else {
        exit_codes::INCOMPLETE
    })
}

fn cmd_policy(root: &Path, config: &RuntimeConfig, command: PolicyCommand) -> Result<i32> {
    let policy_path = root.join(&config.state.policy_path);
    match command {
        PolicyCommand::Show => {
            let policy = effective_policy(&policy_path)?;
            print!(
                "{}",
                toml::to_string_pretty(&policy).context("serialize policy toml")?
            );
            Ok(exit_codes::OK)
        }
        PolicyCommand::Init { force } => {
            if policy_path.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    policy_path.display()
                );
            }
            write_policy(&policy_path, &default_policy())?;
            println!("wrote {}", policy_path.display());
            Ok(exit_codes::OK)
        }
        PolicyCommand::CheckCommand { command } => {
            let policy = effective_policy(&policy_path)?;
            let decision = check_command(&policy, &command);
            if let Some(violation) = decision.violation {
                println!("denied: {violation}");
                return Ok(exit_codes::DENIED);
            }
            let approval = requires_approval(&policy, &command);
            match approval.approval_class {
                Some(class) if approval.requires_approval => {
                    println!("allowed (requires approval: {})", class.as_str());
                }
                _ => println!("allowed"),
            }
            Ok(exit_codes::OK)
        }
        PolicyCommand::CheckPath { path, write } => {
            let policy = effective_policy(&policy_path)?;
            let decision = if write {
                check_file_write(&policy, Path::new(&path), root)
            } else {
                check_file_read(&policy, Path::new(&path), root)
            };
            match decision.violation {
                Some(violation) => {
                    println!("denied: {violation}");
                    Ok(exit_codes::DENIED)
                }
                None => {
                    println!("allowed");
                    Ok(exit_codes::OK)
                }
            }
        }
    }
}

fn effective_policy(path: &Path) -> Result<RalphPolicy> {
    Ok(load_policy(path)?.unwrap_or_else(default_policy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ralph::core::budget::LimitKind;
    use ralph::looping::TaskLoopResult;

    fn result(id: &str, success: bool, stop: TaskStop) -> TaskLoopResult {
        TaskLoopResult {
            task_id: id.to_string(),
            success,
            status: if success {
                TaskStatus::Done
            } else {
                TaskStatus::InProgress
            },
            iterations: 1,
            artifacts: Vec::new(),
            committed: success,
            stop,
            log_error: None,
        }
    }

    #[test]
    fn parse_run_flags() {
        let cli = Cli::parse_from(["ralph", "run", "--dry-run", "--task", "RALPH-001"]);
        match cli.command {
            Command::Run { dry_run, task } => {
                assert!(dry_run);
                assert_eq!(task.as_deref(), Some("RALPH-001"));
            }
            _ => panic!("expected run"),
        }
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn parse_policy_subcommands() {
        let cli = Cli::parse_from(["ralph", "policy", "check-path", "src/x.ts", "--write"]);
        assert!(matches!(
            cli.command,
            Command::Policy {
                command: PolicyCommand::CheckPath { write: true, .. }
            }
        ));
        let cli = Cli::parse_from(["ralph", "--config", "alt.toml", "policy", "init", "-f"]);
        assert!(matches!(
            cli.command,
            Command::Policy {
                command: PolicyCommand::Init { force: true }
            }
        ));
        assert_eq!(cli.config, PathBuf::from("alt.toml"));
    }

    #[test]
    fn exit_code_reflects_run_outcome() {
        let ok = RunSummary {
            results: vec![result("T-1", true, TaskStop::Completed)],
            stop: RunStop::Exhausted,
        };
        assert_eq!(run_exit_code(&ok), exit_codes::OK);

        let blocked = RunSummary {
            results: vec![result(
                "T-1",
                false,
                TaskStop::Blocked {
                    blocker: "creds".to_string(),
                },
            )],
            stop: RunStop::Exhausted,
        };
        assert_eq!(run_exit_code(&blocked), exit_codes::INCOMPLETE);

        let limited = RunSummary {
            results: vec![result(
                "T-1",
                false,
                TaskStop::LimitReached(LimitKind::Iterations { max: 10 }),
            )],
            stop: RunStop::Exhausted,
        };
        assert_eq!(run_exit_code(&limited), exit_codes::LIMIT);
    }

    #[test]
    fn task_filter_rejects_unknown_ids() {
        let tasks = vec![ralph::test_support::task("T-1")];
        assert_eq!(select_tasks(tasks.clone(), Some("T-1")).expect("select").len(), 1);
        assert!(select_tasks(tasks, Some("T-9")).is_err());
    }
}
