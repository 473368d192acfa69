//! Prompt rendering: system directives, task prompts, and input interpolation.

use std::collections::BTreeMap;

use minijinja::{Environment, UndefinedBehavior, context};
use serde::Serialize;

use crate::core::role::Role;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const TASK_TEMPLATE: &str = include_str!("prompts/task.md");

/// Run inputs substituted into task and role templates.
pub type Inputs = BTreeMap<String, String>;

/// A prior task's output as shown to later tasks.
#[derive(Debug, Clone, Serialize)]
pub struct ContextEntry<'a> {
    pub task_id: &'a str,
    pub output: &'a str,
}

/// A tool as listed in a system directive.
#[derive(Debug, Clone, Serialize)]
pub struct ToolListing<'a> {
    pub name: &'a str,
    pub description: &'a str,
}

#[derive(Debug, Clone, Serialize)]
struct RoleContext<'a> {
    name: &'a str,
    objective: &'a str,
    persona: &'a str,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_template("system.md", SYSTEM_TEMPLATE)
            .expect("system template should be valid");
        env.add_template("task.md", TASK_TEMPLATE)
            .expect("task template should be valid");
        Self { env }
    }

    /// Render the system directive for a role. `tools` is empty for roles
    /// without tools, in which case the tool protocol is omitted.
    pub fn render_system(
        &self,
        name: &str,
        objective: &str,
        persona: &str,
        tools: &[ToolListing<'_>],
    ) -> String {
        let template = self
            .env
            .get_template("system.md")
            .expect("system template is registered");
        let rendered = template
            .render(context! {
                role => RoleContext { name, objective, persona },
                tools => tools,
            })
            .expect("system template rendering should not fail");
        finish(rendered)
    }

    /// Render a task prompt: prior outputs in order, then the task itself.
    pub fn render_task(
        &self,
        context: &[ContextEntry<'_>],
        description: &str,
        expected_output: &str,
    ) -> String {
        let template = self
            .env
            .get_template("task.md")
            .expect("task template is registered");
        let rendered = template
            .render(context! {
                context => context,
                description => description.trim(),
                expected_output => expected_output.trim(),
            })
            .expect("task template rendering should not fail");
        finish(rendered)
    }
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Substitute run inputs into a user-supplied template.
///
/// Undefined variables are errors, so a pipeline that references an input the
/// caller did not provide fails before any task runs.
pub fn interpolate(source: &str, inputs: &Inputs) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.render_str(source, inputs)
}

/// Render a tool template with its single `input` variable.
pub fn render_tool_template(source: &str, input: &str) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.render_str(source, context! { input => input })
}

fn finish(mut rendered: String) -> String {
    let trimmed_len = rendered.trim_end().len();
    rendered.truncate(trimmed_len);
    rendered.push('\n');
    rendered
}

/// Tool listing for a role, in the role's (sorted) tool order.
pub fn tool_listings<'a>(
    role: &'a Role,
    describe: impl Fn(&str) -> Option<&'a str>,
) -> Vec<ToolListing<'a>> {
    role.tools()
        .iter()
        .map(|name| ToolListing {
            name: name.as_str(),
            description: describe(name).unwrap_or(""),
        })
        .collect()
}
