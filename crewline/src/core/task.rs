//! Task descriptors.
//!
//! A task is a passive definition: the engine reads it, it never executes
//! itself. Run-specific state (status, output) lives in the run, so one task
//! list can back several concurrent runs.

use std::sync::Arc;

use crate::core::role::Role;
use crate::error::SetupError;

/// One unit of pipeline work bound to exactly one role.
///
/// `description` and `expected_output` are templates over the run inputs
/// (`{{ project_name }}`); they are rendered when a run is planned.
#[derive(Debug, Clone)]
pub struct Task {
    id: String,
    role: Arc<Role>,
    description: String,
    expected_output: String,
}

impl Task {
    pub fn builder(id: impl Into<String>) -> TaskBuilder {
        TaskBuilder {
            id: id.into(),
            role: None,
            description: String::new(),
            expected_output: String::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> &Arc<Role> {
        &self.role
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn expected_output(&self) -> &str {
        &self.expected_output
    }
}

/// Builder that enforces the task invariants in [`TaskBuilder::build`].
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    id: String,
    role: Option<Arc<Role>>,
    description: String,
    expected_output: String,
}

impl TaskBuilder {
    pub fn role(mut self, role: Arc<Role>) -> Self {
        self.role = Some(role);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn expected_output(mut self, expected_output: impl Into<String>) -> Self {
        self.expected_output = expected_output.into();
        self
    }

    /// Fails with [`SetupError::InvalidTask`] when the id is blank or not a
    /// plain file-name token, the description or expected output is blank,
    /// or no role was set.
    pub fn build(self) -> Result<Task, SetupError> {
        if self.id.trim().is_empty() {
            return Err(SetupError::invalid_task("", "task id must not be empty"));
        }
        if !is_valid_id(&self.id) {
            return Err(SetupError::invalid_task(
                &self.id,
                "task id may only contain ASCII letters, digits, '-' and '_'",
            ));
        }
        if self.description.trim().is_empty() {
            return Err(SetupError::invalid_task(
                &self.id,
                "description must not be empty",
            ));
        }
        if self.expected_output.trim().is_empty() {
            return Err(SetupError::invalid_task(
                &self.id,
                "expected_output must not be empty",
            ));
        }
        let role = self
            .role
            .ok_or_else(|| SetupError::invalid_task(&self.id, "role is not set"))?;
        role.validate(&self.id)?;
        Ok(Task {
            id: self.id,
            role,
            description: self.description,
            expected_output: self.expected_output,
        })
    }
}

/// Task ids name files under a run directory.
fn is_valid_id(id: &str) -> bool {
    id.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
