//! I/O for the delivery engine: workspace access, processes, git and persisted logs.

pub mod config;
pub mod executor;
pub mod git;
pub mod jsonl;
pub mod overlay;
pub mod process;
pub mod progress;
pub mod prompt;
pub mod task_store;
