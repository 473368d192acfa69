//! Shared deterministic types for the orchestration core.
//!
//! These types define stable contracts between the engine, sinks, and callers.
//! They do not depend on external state or I/O.

use serde::{Deserialize, Serialize};

/// Lifecycle of a task within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    /// Whether `self -> next` is a legal transition.
    ///
    /// `Pending -> Running -> {Succeeded, Failed}`. A pending task may also
    /// fail directly when the run is cancelled before it starts.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Succeeded)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }

    /// Move to `next` if the transition is legal; otherwise leave `self` as is.
    pub fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.can_transition_to(next) {
            return false;
        }
        *self = next;
        true
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }
}

/// Lifecycle of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running,
    Completed,
    Aborted,
}

/// The artifact one task produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub task_id: String,
    /// Name of the role that produced the output.
    pub role: String,
    pub output: String,
    /// Backend calls made for this task, retries included.
    pub attempts: u32,
    /// Tool invocations resolved for this task.
    pub tool_calls: u32,
}

/// Result of a fully successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub run_id: String,
    /// One entry per task, in execution order.
    pub per_task_outputs: Vec<TaskOutput>,
    /// Output of the last task.
    pub final_output: String,
}

impl RunResult {
    /// `(task_id, output)` pairs in execution order.
    pub fn pairs(&self) -> Vec<(&str, &str)> {
        self.per_task_outputs
            .iter()
            .map(|entry| (entry.task_id.as_str(), entry.output.as_str()))
            .collect()
    }

    pub fn output_of(&self, task_id: &str) -> Option<&str> {
        self.per_task_outputs
            .iter()
            .find(|entry| entry.task_id == task_id)
            .map(|entry| entry.output.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_never_returns_to_running() {
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Succeeded.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Succeeded));
    }

    #[test]
    fn transition_refuses_illegal_moves() {
        let mut status = TaskStatus::Pending;
        assert!(status.transition(TaskStatus::Running));
        assert!(status.transition(TaskStatus::Failed));
        assert!(!status.transition(TaskStatus::Running));
        assert_eq!(status, TaskStatus::Failed);
        assert!(status.is_terminal());
    }

    #[test]
    fn forward_transitions_are_allowed() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Succeeded));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Succeeded));
    }

    #[test]
    fn task_status_serializes_lowercase() {
        let json = serde_json::to_string(&TaskStatus::Succeeded).expect("serialize");
        assert_eq!(json, "\"succeeded\"");
        let state = serde_json::to_string(&RunState::NotStarted).expect("serialize");
        assert_eq!(state, "\"not_started\"");
    }

    #[test]
    fn pairs_preserve_order() {
        let result = RunResult {
            run_id: "run-1".to_string(),
            per_task_outputs: vec![
                TaskOutput {
                    task_id: "t1".to_string(),
                    role: "r".to_string(),
                    output: "OUT1".to_string(),
                    attempts: 1,
                    tool_calls: 0,
                },
                TaskOutput {
                    task_id: "t2".to_string(),
                    role: "r".to_string(),
                    output: "OUT2".to_string(),
                    attempts: 1,
                    tool_calls: 0,
                },
            ],
            final_output: "OUT2".to_string(),
        };
        assert_eq!(result.pairs(), vec![("t1", "OUT1"), ("t2", "OUT2")]);
        assert_eq!(result.output_of("t1"), Some("OUT1"));
        assert_eq!(result.output_of("t3"), None);
    }
}
