//! Context accumulator: prior task outputs threaded forward to later tasks.

use crate::core::prompt::{ContextEntry, PromptEngine};
use crate::error::ContextError;

/// Append-only, write-once-per-task log of `(task_id, output)` pairs.
///
/// One context belongs to exactly one run. Insertion order equals execution
/// order, so rendering is deterministic for a given task order.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    entries: Vec<(String, String)>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a task's output. Each task id may be recorded once.
    pub fn append(
        &mut self,
        task_id: impl Into<String>,
        output: impl Into<String>,
    ) -> Result<(), ContextError> {
        let task_id = task_id.into();
        if self.contains(&task_id) {
            return Err(ContextError::DuplicateTaskOutput { task_id });
        }
        self.entries.push((task_id, output.into()));
        Ok(())
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.entries.iter().any(|(id, _)| id == task_id)
    }

    pub fn output_of(&self, task_id: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(id, _)| id == task_id)
            .map(|(_, output)| output.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(id, output)| (id.as_str(), output.as_str()))
    }

    /// The exact prompt handed to the backend for the next task: every
    /// recorded output labelled by its task id, then the task's own
    /// description and expected output.
    pub fn render_for(
        &self,
        engine: &PromptEngine,
        description: &str,
        expected_output: &str,
    ) -> String {
        let context: Vec<ContextEntry<'_>> = self
            .entries
            .iter()
            .map(|(task_id, output)| ContextEntry {
                task_id: task_id.as_str(),
                output: output.as_str(),
            })
            .collect();
        engine.render_task(&context, description, expected_output)
    }
}
