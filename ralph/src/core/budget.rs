//! Cooperative budgets evaluated between iterations and between tasks.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Which budget ran out.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "limit", rename_all = "snake_case")]
pub enum LimitKind {
    Iterations { max: u32 },
    TaskTime { max_secs: u64 },
    TaskCost { max_usd: f64 },
    RunTasks { max: u32 },
    RunTime { max_secs: u64 },
}

impl LimitKind {
    pub fn name(&self) -> &'static str {
        match self {
            LimitKind::Iterations { .. } => "iterations",
            LimitKind::TaskTime { .. } => "task_time",
            LimitKind::TaskCost { .. } => "task_cost",
            LimitKind::RunTasks { .. } => "run_tasks",
            LimitKind::RunTime { .. } => "run_time",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            LimitKind::Iterations { max } => format!("iteration limit reached ({max})"),
            LimitKind::TaskTime { max_secs } => format!("task time limit reached ({max_secs}s)"),
            LimitKind::TaskCost { max_usd } => format!("task cost limit reached (${max_usd:.2})"),
            LimitKind::RunTasks { max } => format!("run task limit reached ({max})"),
            LimitKind::RunTime { max_secs } => format!("run time limit reached ({max_secs}s)"),
        }
    }
}

/// Per-task budget: iteration count, wall clock and provider cost.
#[derive(Debug, Clone)]
pub struct TaskBudget {
    started: Instant,
    max_iterations: u32,
    max_time: Duration,
    max_cost_usd: Option<f64>,
    spent_usd: f64,
}

impl TaskBudget {
    pub fn new(max_iterations: u32, max_time: Duration, max_cost_usd: Option<f64>) -> Self {
        Self::starting_at(Instant::now(), max_iterations, max_time, max_cost_usd)
    }

    pub fn starting_at(
        started: Instant,
        max_iterations: u32,
        max_time: Duration,
        max_cost_usd: Option<f64>,
    ) -> Self {
        Self {
            started,
            max_iterations,
            max_time,
            max_cost_usd,
            spent_usd: 0.0,
        }
    }

    pub fn record_cost(&mut self, usd: f64) {
        self.spent_usd += usd;
    }

    pub fn spent_usd(&self) -> f64 {
        self.spent_usd
    }

    /// Check whether iteration `next` (1-indexed) may start.
    pub fn exhausted(&self, next: u32) -> Option<LimitKind> {
        if next > self.max_iterations {
            return Some(LimitKind::Iterations {
                max: self.max_iterations,
            });
        }
        if self.started.elapsed() >= self.max_time {
            return Some(LimitKind::TaskTime {
                max_secs: self.max_time.as_secs(),
            });
        }
        if let Some(max_usd) = self.max_cost_usd {
            if self.spent_usd >= max_usd {
                return Some(LimitKind::TaskCost { max_usd });
            }
        }
        None
    }
}

/// Return the remaining time until `deadline`, or `None` once it has passed.
pub fn remaining_budget(deadline: Instant) -> Option<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return None;
    }
    Some(remaining)
}
