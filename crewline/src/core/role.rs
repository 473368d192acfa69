//! Role descriptors.

use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use crate::error::SetupError;

/// A named persona with an objective and a fixed set of tool names.
///
/// Roles are immutable once built and shared between tasks (and concurrent
/// runs) behind `Arc`. Two roles are equal when their names are equal.
#[derive(Debug, Clone)]
pub struct Role {
    name: String,
    objective: String,
    persona: String,
    tools: BTreeSet<String>,
    allow_delegation: bool,
}

impl Role {
    pub fn new(
        name: impl Into<String>,
        objective: impl Into<String>,
        persona: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            objective: objective.into(),
            persona: persona.into(),
            tools: BTreeSet::new(),
            allow_delegation: false,
        }
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools.extend(tools.into_iter().map(Into::into));
        self
    }

    pub fn with_delegation(mut self, allow: bool) -> Self {
        self.allow_delegation = allow;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn objective(&self) -> &str {
        &self.objective
    }

    pub fn persona(&self) -> &str {
        &self.persona
    }

    /// Tool names bound to this role, sorted.
    pub fn tools(&self) -> &BTreeSet<String> {
        &self.tools
    }

    pub fn has_tools(&self) -> bool {
        !self.tools.is_empty()
    }

    pub fn allows_tool(&self, tool: &str) -> bool {
        self.tools.contains(tool)
    }

    pub fn allow_delegation(&self) -> bool {
        self.allow_delegation
    }

    /// Reject roles with blank fields. `owner` names the task being checked.
    pub fn validate(&self, owner: &str) -> Result<(), SetupError> {
        let blank = [
            ("name", &self.name),
            ("objective", &self.objective),
            ("persona", &self.persona),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty());
        if let Some((field, _)) = blank {
            return Err(SetupError::invalid_task(
                owner,
                format!("role {field} must not be empty"),
            ));
        }
        if self.tools.iter().any(|tool| tool.trim().is_empty()) {
            return Err(SetupError::invalid_task(
                owner,
                format!("role '{}' lists an empty tool name", self.name),
            ));
        }
        Ok(())
    }
}

impl PartialEq for Role {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Role {}

impl Hash for Role {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn equality_is_by_name() {
        let a = Role::new("Analyst", "one objective", "one persona");
        let b = Role::new("Analyst", "other objective", "other persona").with_tools(["search"]);
        let c = Role::new("Architect", "one objective", "one persona");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<Role> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn tools_are_sorted_and_deduplicated() {
        let role = Role::new("Analyst", "objective", "persona").with_tools(["b", "a", "b"]);
        let tools: Vec<&str> = role.tools().iter().map(String::as_str).collect();
        assert_eq!(tools, vec!["a", "b"]);
        assert!(role.allows_tool("a"));
        assert!(!role.allows_tool("c"));
    }

    #[test]
    fn validate_rejects_blank_fields() {
        let role = Role::new("Analyst", "  ", "persona");
        let err = role.validate("t1").unwrap_err();
        assert_eq!(
            err,
            SetupError::invalid_task("t1", "role objective must not be empty")
        );
        assert!(
            Role::new("Analyst", "objective", "persona")
                .validate("t1")
                .is_ok()
        );
    }
}
