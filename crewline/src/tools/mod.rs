//! Tool registry.
//!
//! Tools are side-effect-free `input -> output` functions a role may call
//! mid-task. The set of tool kinds is closed ([`ToolKind`]); tools are looked
//! up by name. Registration happens before any run starts, after which the
//! registry is shared read-only (`Arc<ToolRegistry>`) by every run.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::core::prompt::render_tool_template;
use crate::error::ToolError;

/// Signature of a function-backed tool. `Err` carries a message for the model.
pub type ToolFn = dyn Fn(&str) -> Result<String, String> + Send + Sync;

/// How a tool produces its output.
#[derive(Clone)]
pub enum ToolKind {
    /// A minijinja template rendered with a single `input` variable.
    Template(String),
    /// An arbitrary pure function.
    Function(Arc<ToolFn>),
}

impl fmt::Debug for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolKind::Template(template) => f.debug_tuple("Template").field(template).finish(),
            ToolKind::Function(_) => f.write_str("Function(..)"),
        }
    }
}

/// A named tool. Identity is the name.
#[derive(Debug, Clone)]
pub struct Tool {
    name: String,
    description: String,
    kind: ToolKind,
}

impl Tool {
    pub fn template(
        name: impl Into<String>,
        description: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind: ToolKind::Template(template.into()),
        }
    }

    pub fn function<F>(name: impl Into<String>, description: impl Into<String>, f: F) -> Self
    where
        F: Fn(&str) -> Result<String, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            kind: ToolKind::Function(Arc::new(f)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn kind(&self) -> &ToolKind {
        &self.kind
    }

    fn call(&self, input: &str) -> Result<String, String> {
        match &self.kind {
            ToolKind::Template(template) => {
                render_tool_template(template, input).map_err(|err| format!("{err:#}"))
            }
            ToolKind::Function(f) => f(input),
        }
    }
}

/// Name-indexed tool collection.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool. Fails without modifying the registry if the name is taken.
    pub fn register(&mut self, tool: Tool) -> Result<(), ToolError> {
        if self.tools.contains_key(tool.name()) {
            return Err(ToolError::DuplicateTool {
                tool: tool.name().to_string(),
            });
        }
        debug!(tool = tool.name(), "registered tool");
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name).map(Arc::as_ref)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn description_of(&self, name: &str) -> Option<&str> {
        self.get(name).map(Tool::description)
    }

    /// `(name, description)` for each registered name in `names`; unknown
    /// names are skipped.
    pub fn describe<'a, I>(&'a self, names: I) -> Vec<(&'a str, &'a str)>
    where
        I: IntoIterator<Item = &'a str>,
    {
        names
            .into_iter()
            .filter_map(|name| self.get(name).map(|tool| (tool.name(), tool.description())))
            .collect()
    }

    /// Invoke a tool on the calling thread.
    ///
    /// A panic inside the tool is caught and reported as
    /// [`ToolError::Execution`].
    #[instrument(skip(self, input), fields(input_len = input.len()))]
    pub fn invoke(&self, name: &str, input: &str) -> Result<String, ToolError> {
        let tool = self.lookup(name)?;
        run_guarded(&tool, input)
    }

    /// Invoke a tool on a worker thread, giving up after `timeout`.
    ///
    /// A tool that overruns is left to finish on its own; its result is
    /// discarded.
    #[instrument(skip(self, input), fields(input_len = input.len(), timeout_ms = timeout.as_millis() as u64))]
    pub fn invoke_with_timeout(
        &self,
        name: &str,
        input: &str,
        timeout: Duration,
    ) -> Result<String, ToolError> {
        let tool = self.lookup(name)?;
        let (tx, rx) = mpsc::channel();
        let worker_tool = Arc::clone(&tool);
        let worker_input = input.to_string();
        thread::Builder::new()
            .name(format!("tool-{name}"))
            .spawn(move || {
                let _ = tx.send(run_guarded(&worker_tool, &worker_input));
            })
            .map_err(|err| ToolError::Execution {
                tool: name.to_string(),
                message: format!("spawn tool worker: {err}"),
            })?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(tool = name, "tool timed out");
                Err(ToolError::Execution {
                    tool: name.to_string(),
                    message: format!("timed out after {timeout:?}"),
                })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(ToolError::Execution {
                tool: name.to_string(),
                message: "tool worker exited without a result".to_string(),
            }),
        }
    }

    fn lookup(&self, name: &str) -> Result<Arc<Tool>, ToolError> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::UnknownTool {
                tool: name.to_string(),
            })
    }
}

fn run_guarded(tool: &Tool, input: &str) -> Result<String, ToolError> {
    match catch_unwind(AssertUnwindSafe(|| tool.call(input))) {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(message)) => Err(ToolError::Execution {
            tool: tool.name().to_string(),
            message,
        }),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(tool = tool.name(), %message, "tool panicked");
            Err(ToolError::Execution {
                tool: tool.name().to_string(),
                message: format!("panicked: {message}"),
            })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
