//! Deterministic core logic (no I/O).

pub mod context;
pub mod prompt;
pub mod retry;
pub mod role;
pub mod task;
pub mod tool_call;
pub mod types;
