//! Delivery engine for an autonomous coding agent.
//!
//! A run picks open tasks from the task log and iterates on each one: the agent acts
//! through a policy-gated executor whose writes are buffered, completion criteria are
//! checked programmatically, and a commit gate runs the required checks before any
//! change reaches git. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (policy evaluation, status transitions,
//!   selection, budgets, task log folding). No I/O.
//! - **[`io`]**: Side-effecting operations (filesystem overlay, shell, git, logs,
//!   config). Isolated behind traits so tests can substitute doubles.
//!
//! Orchestration modules ([`looping`], [`iteration`], [`gate`], [`completion`]) tie the
//! two together; [`hooks`] lets callers observe a run and [`provider`] is the seam to an
//! LLM backend.

pub mod completion;
pub mod core;
pub mod exit_codes;
pub mod gate;
pub mod hooks;
pub mod io;
pub mod iteration;
pub mod logging;
pub mod looping;
pub mod provider;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
