//! Deterministic, pure logic shared by the delivery engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod paths;
pub mod policy;
pub mod selector;
pub mod status;
pub mod task_log;
pub mod types;
