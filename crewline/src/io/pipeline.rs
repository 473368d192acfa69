//! Pipeline definition files (TOML).
//!
//! A pipeline file declares template tools, roles, an ordered task list, and
//! default inputs. Loading resolves every name reference; the result is ready
//! to hand to [`crate::Engine::plan`].

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::core::prompt::Inputs;
use crate::core::role::Role;
use crate::core::task::Task;
use crate::error::{SetupError, ToolError};
use crate::tools::{Tool, ToolRegistry};

pub const PIPELINE_FILE: &str = "pipeline.toml";

/// The software-architecture pipeline written by `crewline init`.
pub const SAMPLE_PIPELINE: &str = include_str!("../../pipelines/software_architecture.toml");

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineFile {
    pub inputs: BTreeMap<String, String>,
    pub tools: Vec<ToolDef>,
    pub roles: Vec<RoleDef>,
    pub tasks: Vec<TaskDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub template: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleDef {
    pub name: String,
    pub objective: String,
    pub persona: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub allow_delegation: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskDef {
    pub id: String,
    pub role: String,
    pub description: String,
    pub expected_output: String,
}

/// A resolved pipeline.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub registry: ToolRegistry,
    pub roles: Vec<Arc<Role>>,
    pub tasks: Vec<Task>,
    /// Defaults; callers may override individual keys.
    pub inputs: Inputs,
}

impl Pipeline {
    /// Resolve role and tool references.
    ///
    /// Duplicate tools, duplicate role names, tasks naming an unknown role, and
    /// roles naming an unregistered tool are all setup errors.
    pub fn from_file(file: PipelineFile) -> Result<Self, SetupError> {
        let mut registry = ToolRegistry::new();
        for def in file.tools {
            registry.register(Tool::template(def.name, def.description, def.template))?;
        }

        let mut roles: Vec<Arc<Role>> = Vec::with_capacity(file.roles.len());
        let mut seen = HashSet::new();
        for def in file.roles {
            if !seen.insert(def.name.clone()) {
                return Err(SetupError::Configuration(format!(
                    "duplicate role '{}'",
                    def.name
                )));
            }
            if let Some(missing) = def.tools.iter().find(|tool| !registry.contains(tool)) {
                return Err(ToolError::UnknownTool {
                    tool: missing.clone(),
                }
                .into());
            }
            let role = Role::new(def.name, def.objective, def.persona)
                .with_tools(def.tools)
                .with_delegation(def.allow_delegation);
            roles.push(Arc::new(role));
        }

        let tasks = file
            .tasks
            .into_iter()
            .map(|def| {
                let role = roles
                    .iter()
                    .find(|role| role.name() == def.role)
                    .cloned()
                    .ok_or_else(|| {
                        SetupError::invalid_task(&def.id, format!("unknown role '{}'", def.role))
                    })?;
                Task::builder(def.id)
                    .role(role)
                    .description(def.description)
                    .expected_output(def.expected_output)
                    .build()
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            tools = registry.len(),
            roles = roles.len(),
            tasks = tasks.len(),
            "resolved pipeline"
        );
        Ok(Self {
            registry,
            roles,
            tasks,
            inputs: file.inputs,
        })
    }

    /// Defaults overlaid with `overrides`.
    pub fn inputs_with(&self, overrides: &Inputs) -> Inputs {
        let mut inputs = self.inputs.clone();
        inputs.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        inputs
    }
}

pub fn parse_pipeline(contents: &str) -> Result<Pipeline> {
    let file: PipelineFile = toml::from_str(contents).context("parse pipeline toml")?;
    Ok(Pipeline::from_file(file)?)
}

pub fn load_pipeline(path: &Path) -> Result<Pipeline> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_pipeline(&contents).with_context(|| format!("load pipeline {}", path.display()))
}

/// Parse `key=value` pairs from the command line.
pub fn parse_input_pairs<S: AsRef<str>>(pairs: &[S]) -> Result<Inputs> {
    let mut inputs = Inputs::new();
    for pair in pairs {
        let pair = pair.as_ref();
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("input '{pair}' must look like key=value"))?;
        let key = key.trim();
        anyhow::ensure!(!key.is_empty(), "input '{pair}' has an empty key");
        inputs.insert(key.to_string(), value.to_string());
    }
    Ok(inputs)
}
