//! Error taxonomy for pipeline setup and execution.
//!
//! Setup errors ([`SetupError`]) are returned before any task runs. Errors
//! during a run are wrapped in a [`RunError`] that always carries the outputs
//! accumulated before the failure.

use std::fmt;

use thiserror::Error;

use crate::core::types::{TaskOutput, TaskStatus};
use crate::exit_codes;

/// Errors raised by the tool registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("duplicate tool registration: {tool}")]
    DuplicateTool { tool: String },

    #[error("unknown tool: {tool}")]
    UnknownTool { tool: String },

    #[error("tool '{tool}' failed: {message}")]
    Execution { tool: String, message: String },
}

/// Classification of a failed backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendErrorKind {
    RateLimited,
    Timeout,
    Unauthorized,
    ServerError,
    /// The backend rejected the request itself (4xx other than auth/rate limits).
    InvalidRequest,
    /// The backend answered but the body could not be understood.
    InvalidResponse,
}

impl BackendErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendErrorKind::RateLimited => "rate_limited",
            BackendErrorKind::Timeout => "timeout",
            BackendErrorKind::Unauthorized => "unauthorized",
            BackendErrorKind::ServerError => "server_error",
            BackendErrorKind::InvalidRequest => "invalid_request",
            BackendErrorKind::InvalidResponse => "invalid_response",
        }
    }
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed call to the generation backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("backend error ({kind}): {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::RateLimited, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Timeout, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Unauthorized, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::ServerError, message)
    }

    /// Whether a retry may succeed. Auth and request errors never will.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            BackendErrorKind::RateLimited
                | BackendErrorKind::Timeout
                | BackendErrorKind::ServerError
        )
    }
}

/// Errors raised by the context accumulator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("output for task '{task_id}' already recorded")]
    DuplicateTaskOutput { task_id: String },
}

/// Errors detected before a run starts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SetupError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid task '{task_id}': {reason}")]
    InvalidTask { task_id: String, reason: String },

    #[error(transparent)]
    Tool(#[from] ToolError),
}

impl SetupError {
    pub fn invalid_task(task_id: impl Into<String>, reason: impl Into<String>) -> Self {
        SetupError::InvalidTask {
            task_id: task_id.into(),
            reason: reason.into(),
        }
    }
}

/// Why a single task failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("{source} (after {attempts} attempt(s))")]
    Backend {
        attempts: u32,
        #[source]
        source: BackendError,
    },

    #[error("tool-call limit exceeded: more than {rounds} tool round(s) requested")]
    ToolLoopExceeded { rounds: u32 },

    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Context(#[from] ContextError),
}

/// A run that aborted on a failed task.
///
/// `partial_outputs` holds every output recorded before the failure, in
/// execution order; `statuses` holds the final status of every task.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("run {run_id} aborted: task '{failed_task_id}' failed: {cause}")]
pub struct RunError {
    pub run_id: String,
    pub failed_task_id: String,
    #[source]
    pub cause: TaskError,
    pub partial_outputs: Vec<TaskOutput>,
    pub statuses: Vec<(String, TaskStatus)>,
}

impl RunError {
    pub fn status_of(&self, task_id: &str) -> Option<TaskStatus> {
        self.statuses
            .iter()
            .find(|(id, _)| id == task_id)
            .map(|(_, status)| *status)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cause == TaskError::Cancelled
    }
}

/// Either phase of a one-shot [`crate::Engine::run`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CrewError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Run(#[from] Box<RunError>),
}

impl CrewError {
    /// CLI exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CrewError::Setup(_) => exit_codes::INVALID,
            CrewError::Run(_) => exit_codes::ABORTED,
        }
    }
}

impl From<RunError> for CrewError {
    fn from(err: RunError) -> Self {
        CrewError::Run(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds_are_retryable() {
        assert!(BackendError::rate_limited("slow down").is_transient());
        assert!(BackendError::timeout("late").is_transient());
        assert!(BackendError::server_error("502").is_transient());
        assert!(!BackendError::unauthorized("bad key").is_transient());
        assert!(!BackendError::new(BackendErrorKind::InvalidRequest, "400").is_transient());
        assert!(!BackendError::new(BackendErrorKind::InvalidResponse, "garbage").is_transient());
    }

    #[test]
    fn backend_task_error_mentions_attempts() {
        let err = TaskError::Backend {
            attempts: 3,
            source: BackendError::rate_limited("429"),
        };
        let msg = err.to_string();
        assert!(msg.contains("rate_limited"));
        assert!(msg.contains("after 3 attempt(s)"));
    }

    #[test]
    fn crew_error_exit_codes() {
        let setup = CrewError::from(SetupError::Configuration("bad".to_string()));
        assert_eq!(setup.exit_code(), exit_codes::INVALID);

        let run = CrewError::from(RunError {
            run_id: "run-1".to_string(),
            failed_task_id: "t1".to_string(),
            cause: TaskError::Cancelled,
            partial_outputs: Vec::new(),
            statuses: vec![("t1".to_string(), TaskStatus::Failed)],
        });
        assert_eq!(run.exit_code(), exit_codes::ABORTED);
    }

    #[test]
    fn run_error_reports_statuses() {
        let err = RunError {
            run_id: "run-1".to_string(),
            failed_task_id: "b".to_string(),
            cause: TaskError::Cancelled,
            partial_outputs: Vec::new(),
            statuses: vec![
                ("a".to_string(), TaskStatus::Succeeded),
                ("b".to_string(), TaskStatus::Failed),
            ],
        };
        assert_eq!(err.status_of("a"), Some(TaskStatus::Succeeded));
        assert_eq!(err.status_of("missing"), None);
        assert!(err.is_cancelled());
    }
}
