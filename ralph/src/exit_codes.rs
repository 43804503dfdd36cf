//! Stable exit codes for ralph CLI commands.

/// Command succeeded; for `run`, every attempted task completed.
pub const OK: i32 = 0;
/// Invalid config, policy or task log, or another error.
pub const INVALID: i32 = 1;
/// `run` finished but at least one task ended blocked or failed.
pub const INCOMPLETE: i32 = 2;
/// `run` stopped on a budget (iterations, time, cost or task count).
pub const LIMIT: i32 = 3;
/// `policy check-*` denied the command or path.
pub const DENIED: i32 = 4;
