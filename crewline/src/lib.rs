//! Sequential multi-agent task orchestration.
//!
//! A pipeline is an ordered list of tasks, each bound to a role. Tasks run one
//! at a time; every task's output is threaded forward as context for the tasks
//! after it. Roles may call tools mid-task. The layout mirrors that split:
//!
//! - **[`core`]**: Pure, deterministic pieces (roles, tasks, context, prompt
//!   rendering, tool-call parsing, retry policy). No I/O.
//! - **[`io`]**: Side-effecting edges (generation backend, configuration and
//!   pipeline files, result sinks).
//! - **[`tools`]**: The tool registry shared read-only by every run.
//!
//! [`engine`] coordinates the three to run a pipeline.

pub mod core;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tools;

pub use engine::{Engine, Plan, RunEvent, RunOptions};
pub use error::{CrewError, RunError, SetupError, TaskError};
