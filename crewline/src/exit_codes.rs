//! Stable exit codes for crewline CLI commands.

/// Command succeeded; for `run`, every task succeeded.
pub const OK: i32 = 0;
/// Invalid configuration, pipeline definition, inputs, or other setup errors.
pub const INVALID: i32 = 1;
/// `crewline run` aborted on a failed or cancelled task.
pub const ABORTED: i32 = 2;
