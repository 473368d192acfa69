//! Result sinks: where a finished (or aborted) run is delivered.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::core::prompt::Inputs;
use crate::core::types::{RunState, TaskOutput};
use crate::error::RunError;

/// Everything a sink learns about one executed run.
#[derive(Debug, Clone, Copy)]
pub struct RunOutcome<'a> {
    pub run_id: &'a str,
    pub state: RunState,
    /// Full outputs for a completed run, partial outputs for an aborted one.
    pub outputs: &'a [TaskOutput],
    pub inputs: &'a Inputs,
    pub error: Option<&'a RunError>,
}

/// Receives each executed run exactly once.
///
/// A failing sink never changes the run's outcome; the engine logs the error.
pub trait ResultSink {
    fn deliver(&mut self, outcome: &RunOutcome<'_>) -> Result<()>;
}

/// Owned copy of a delivered outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredRun {
    pub run_id: String,
    pub state: RunState,
    pub outputs: Vec<TaskOutput>,
    pub error: Option<RunError>,
}

/// Keeps every delivered outcome in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub delivered: Vec<DeliveredRun>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultSink for MemorySink {
    fn deliver(&mut self, outcome: &RunOutcome<'_>) -> Result<()> {
        self.delivered.push(DeliveredRun {
            run_id: outcome.run_id.to_string(),
            state: outcome.state,
            outputs: outcome.outputs.to_vec(),
            error: outcome.error.cloned(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunMeta<'a> {
    pub run_id: &'a str,
    pub state: RunState,
    pub generated_at: String,
    pub tasks_completed: usize,
    pub failed_task_id: Option<&'a str>,
    pub error: Option<String>,
    pub inputs: &'a Inputs,
}

/// Paths of one run's result directory.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub tasks_dir: PathBuf,
    pub result_path: PathBuf,
}

impl RunPaths {
    pub fn new(root: &Path, run_id: &str) -> Self {
        let dir = root.join(run_id);
        Self {
            dir: dir.clone(),
            meta_path: dir.join("meta.json"),
            tasks_dir: dir.join("tasks"),
            result_path: dir.join("result.md"),
        }
    }

    pub fn task_path(&self, index: usize, task_id: &str) -> PathBuf {
        self.tasks_dir.join(format!("{:02}-{}.md", index + 1, task_id))
    }
}

/// Writes each run under `<root>/<run_id>/`.
#[derive(Debug)]
pub struct FileSink {
    root: PathBuf,
    written: Vec<PathBuf>,
}

impl FileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            written: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Files written so far, in write order.
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }

    fn write_text(&mut self, path: &Path, contents: &str) -> Result<()> {
        fs::write(path, contents).with_context(|| format!("write {}", path.display()))?;
        self.written.push(path.to_path_buf());
        Ok(())
    }
}

impl ResultSink for FileSink {
    fn deliver(&mut self, outcome: &RunOutcome<'_>) -> Result<()> {
        let paths = RunPaths::new(&self.root, outcome.run_id);
        fs::create_dir_all(&paths.tasks_dir)
            .with_context(|| format!("create run dir {}", paths.tasks_dir.display()))?;

        let generated_at = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let meta = RunMeta {
            run_id: outcome.run_id,
            state: outcome.state,
            generated_at: generated_at.clone(),
            tasks_completed: outcome.outputs.len(),
            failed_task_id: outcome.error.map(|err| err.failed_task_id.as_str()),
            error: outcome.error.map(|err| format!("{err:#}")),
            inputs: outcome.inputs,
        };
        let mut buf = serde_json::to_string_pretty(&meta).context("serialize run meta")?;
        buf.push('\n');
        self.write_text(&paths.meta_path, &buf)?;

        for (index, output) in outcome.outputs.iter().enumerate() {
            let path = paths.task_path(index, &output.task_id);
            let body = format!(
                "# {} ({})\n\n{}\n",
                output.task_id,
                output.role,
                output.output.trim_end()
            );
            self.write_text(&path, &body)?;
        }

        let document = render_document(outcome, &generated_at);
        self.write_text(&paths.result_path, &document)?;
        info!(dir = %paths.dir.display(), "wrote run results");
        Ok(())
    }
}

/// The human-readable design document for a run.
pub fn render_document(outcome: &RunOutcome<'_>, generated_at: &str) -> String {
    let mut doc = String::new();
    doc.push_str("# Pipeline result\n\n");
    doc.push_str(&format!("- Run: `{}`\n", outcome.run_id));
    doc.push_str(&format!("- Generated: {generated_at}\n"));
    doc.push_str(&format!("- State: {}\n", state_label(outcome.state)));
    for (key, value) in outcome.inputs {
        doc.push_str(&format!("- {key}: {}\n", one_line(value)));
    }

    if let Some(err) = outcome.error {
        doc.push_str(&format!("\n## Failure\n\n{err}\n"));
    }

    for (index, output) in outcome.outputs.iter().enumerate() {
        doc.push_str(&format!(
            "\n## {}. {} ({})\n\n{}\n",
            index + 1,
            output.task_id,
            output.role,
            output.output.trim_end()
        ));
    }
    doc
}

fn state_label(state: RunState) -> &'static str {
    match state {
        RunState::NotStarted => "not started",
        RunState::Running => "running",
        RunState::Completed => "completed",
        RunState::Aborted => "aborted",
    }
}

fn one_line(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskStatus;
    use crate::error::TaskError;

    fn output(task_id: &str, text: &str) -> TaskOutput {
        TaskOutput {
            task_id: task_id.to_string(),
            role: "Architect".to_string(),
            output: text.to_string(),
            attempts: 1,
            tool_calls: 0,
        }
    }

    #[test]
    fn run_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RunPaths::new(temp.path(), "run-1");
        assert!(paths.dir.ends_with("run-1"));
        assert!(paths.meta_path.ends_with("run-1/meta.json"));
        assert!(paths.result_path.ends_with("run-1/result.md"));
        assert!(paths.task_path(0, "design").ends_with("tasks/01-design.md"));
    }

    #[test]
    fn file_sink_writes_completed_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outputs = vec![output("requirements", "R1"), output("design", "D1")];
        let inputs = Inputs::from([("project_name".to_string(), "Shop".to_string())]);
        let mut sink = FileSink::new(temp.path());
        sink.deliver(&RunOutcome {
            run_id: "run-7",
            state: RunState::Completed,
            outputs: &outputs,
            inputs: &inputs,
            error: None,
        })
        .expect("deliver");

        let paths = RunPaths::new(temp.path(), "run-7");
        assert_eq!(sink.written().len(), 4);
        let meta: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.meta_path).expect("meta"))
                .expect("json");
        assert_eq!(meta["state"], "completed");
        assert_eq!(meta["tasks_completed"], 2);
        assert_eq!(meta["inputs"]["project_name"], "Shop");

        let doc = fs::read_to_string(&paths.result_path).expect("result");
        let first = doc.find("## 1. requirements").expect("first section");
        let second = doc.find("## 2. design").expect("second section");
        assert!(first < second);
        assert!(doc.contains("- project_name: Shop"));
        assert!(!doc.contains("## Failure"));

        let task = fs::read_to_string(paths.task_path(1, "design")).expect("task file");
        assert_eq!(task, "# design (Architect)\n\nD1\n");
    }

    #[test]
    fn file_sink_records_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outputs = vec![output("requirements", "R1")];
        let err = RunError {
            run_id: "run-8".to_string(),
            failed_task_id: "design".to_string(),
            cause: TaskError::Cancelled,
            partial_outputs: outputs.clone(),
            statuses: vec![
                ("requirements".to_string(), TaskStatus::Succeeded),
                ("design".to_string(), TaskStatus::Failed),
            ],
        };
        let inputs = Inputs::new();
        let mut sink = FileSink::new(temp.path());
        sink.deliver(&RunOutcome {
            run_id: "run-8",
            state: RunState::Aborted,
            outputs: &outputs,
            inputs: &inputs,
            error: Some(&err),
        })
        .expect("deliver");

        let paths = RunPaths::new(temp.path(), "run-8");
        let meta: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.meta_path).expect("meta"))
                .expect("json");
        assert_eq!(meta["state"], "aborted");
        assert_eq!(meta["failed_task_id"], "design");
        let doc = fs::read_to_string(&paths.result_path).expect("result");
        assert!(doc.contains("## Failure"));
        assert!(doc.contains("run cancelled"));
    }

    #[test]
    fn file_sink_failure_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let blocker = temp.path().join("not-a-dir");
        fs::write(&blocker, "file").expect("write");
        let inputs = Inputs::new();
        let mut sink = FileSink::new(&blocker);
        let err = sink
            .deliver(&RunOutcome {
                run_id: "run-9",
                state: RunState::Completed,
                outputs: &[],
                inputs: &inputs,
                error: None,
            })
            .unwrap_err();
        assert!(format!("{err:#}").contains("create run dir"));
        assert!(sink.written().is_empty());
    }

    #[test]
    fn memory_sink_keeps_outcomes() {
        let mut sink = MemorySink::new();
        let outputs = vec![output("a", "A")];
        let inputs = Inputs::new();
        sink.deliver(&RunOutcome {
            run_id: "run-1",
            state: RunState::Completed,
            outputs: &outputs,
            inputs: &inputs,
            error: None,
        })
        .expect("deliver");
        assert_eq!(sink.delivered.len(), 1);
        assert_eq!(sink.delivered[0].outputs, outputs);
    }
}
