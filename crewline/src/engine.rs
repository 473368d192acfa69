//! Sequential execution of a planned pipeline.
//!
//! [`Engine::plan`] validates tasks against the registry and renders every
//! template up front, so a run never starts with a setup problem.
//! [`Engine::execute`] then drives the tasks one at a time:
//!
//! 1. check for cancellation, mark the task running
//! 2. render the prompt from the accumulated context
//! 3. call the backend (with retry), resolving tool requests in between
//! 4. record the output and mark the task succeeded
//!
//! The first failed task aborts the run; later tasks stay pending.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, instrument, warn};

use crate::core::context::ExecutionContext;
use crate::core::prompt::{Inputs, PromptEngine, interpolate, tool_listings};
use crate::core::retry::{RetryDecision, RetryPolicy};
use crate::core::role::Role;
use crate::core::task::Task;
use crate::core::tool_call::{Reply, Scratchpad, parse_reply};
use crate::core::types::{RunResult, RunState, TaskOutput, TaskStatus};
use crate::error::{BackendErrorKind, CrewError, RunError, SetupError, TaskError, ToolError};
use crate::io::backend::{Backend, GenerateRequest, ModelConfig};
use crate::io::config::EngineConfig;
use crate::io::sink::{ResultSink, RunOutcome};
use crate::tools::ToolRegistry;

/// Granularity of cancellation checks while backing off.
const CANCEL_POLL: Duration = Duration::from_millis(20);

static RUN_SEQ: AtomicU64 = AtomicU64::new(1);

/// Progress notifications, in the order they happen.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        tasks: usize,
    },
    TaskStarted {
        index: usize,
        task_id: String,
        role: String,
    },
    ToolCalled {
        task_id: String,
        tool: String,
        round: u32,
    },
    BackendRetry {
        task_id: String,
        attempt: u32,
        kind: BackendErrorKind,
        delay: Duration,
    },
    TaskSucceeded {
        task_id: String,
        attempts: u32,
        tool_calls: u32,
    },
    TaskFailed {
        task_id: String,
        error: TaskError,
    },
    RunFinished {
        run_id: String,
        state: RunState,
    },
}

/// Optional collaborators for one [`Engine::execute`] call.
#[derive(Default)]
pub struct RunOptions<'a> {
    pub cancel: Option<&'a CancellationToken>,
    /// Receives the run's outcome exactly once, success or not.
    pub sink: Option<&'a mut dyn ResultSink>,
    pub observer: Option<&'a mut dyn FnMut(&RunEvent)>,
}

/// A task with its templates rendered for one set of inputs.
#[derive(Debug, Clone)]
pub struct PreparedTask {
    id: String,
    role: Arc<Role>,
    system_directive: String,
    description: String,
    expected_output: String,
}

impl PreparedTask {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> &Arc<Role> {
        &self.role
    }

    pub fn system_directive(&self) -> &str {
        &self.system_directive
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn expected_output(&self) -> &str {
        &self.expected_output
    }
}

/// A validated, fully rendered task sequence. Reusable across runs.
#[derive(Debug, Clone)]
pub struct Plan {
    tasks: Vec<PreparedTask>,
    inputs: Inputs,
}

impl Plan {
    pub fn tasks(&self) -> &[PreparedTask] {
        &self.tasks
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(PreparedTask::id)
    }

    pub fn inputs(&self) -> &Inputs {
        &self.inputs
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Runs planned pipelines against one backend.
///
/// Holds only immutable state, so one engine can serve concurrent runs; each
/// run owns its context and task statuses.
pub struct Engine<B: Backend> {
    config: EngineConfig,
    registry: Arc<ToolRegistry>,
    backend: B,
    prompts: PromptEngine,
    retry: RetryPolicy,
    model: ModelConfig,
}

impl<B: Backend> Engine<B> {
    pub fn new(
        config: EngineConfig,
        registry: Arc<ToolRegistry>,
        backend: B,
    ) -> Result<Self, SetupError> {
        config.validate()?;
        let retry = config.retry_policy();
        let model = config.model();
        Ok(Self {
            config,
            registry,
            backend,
            prompts: PromptEngine::new(),
            retry,
            model,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Plan and execute in one step, without sink, observer, or cancellation.
    pub fn run(&self, tasks: &[Task], inputs: &Inputs) -> Result<RunResult, CrewError> {
        let plan = self.plan(tasks, inputs)?;
        Ok(self.execute(&plan, RunOptions::default())?)
    }

    /// Validate `tasks` and render their templates with `inputs`.
    ///
    /// Rejects an empty pipeline, duplicate task ids, roles that allow
    /// delegation, roles bound to unregistered tools, and templates that
    /// reference a missing input.
    #[instrument(skip_all, fields(tasks = tasks.len()))]
    pub fn plan(&self, tasks: &[Task], inputs: &Inputs) -> Result<Plan, SetupError> {
        if tasks.is_empty() {
            return Err(SetupError::Configuration(
                "pipeline has no tasks".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let mut prepared = Vec::with_capacity(tasks.len());
        for task in tasks {
            if !seen.insert(task.id()) {
                return Err(SetupError::invalid_task(task.id(), "duplicate task id"));
            }
            let role = task.role();
            role.validate(task.id())?;
            if role.allow_delegation() {
                return Err(SetupError::Configuration(format!(
                    "role '{}' allows delegation, which is not supported",
                    role.name()
                )));
            }
            if let Some(missing) = role.tools().iter().find(|t| !self.registry.contains(t)) {
                return Err(ToolError::UnknownTool {
                    tool: missing.clone(),
                }
                .into());
            }

            let render = |field: &str, source: &str| {
                interpolate(source, inputs)
                    .map_err(|err| SetupError::invalid_task(task.id(), format!("{field}: {err}")))
            };
            let description = render("description", task.description())?;
            let expected_output = render("expected_output", task.expected_output())?;
            let objective = render("role objective", role.objective())?;
            let persona = render("role persona", role.persona())?;

            let listings = tool_listings(role, |name| self.registry.description_of(name));
            let system_directive =
                self.prompts
                    .render_system(role.name(), &objective, &persona, &listings);
            debug!(
                task_id = task.id(),
                directive_bytes = system_directive.len(),
                "prepared task"
            );
            prepared.push(PreparedTask {
                id: task.id().to_string(),
                role: Arc::clone(role),
                system_directive,
                description,
                expected_output,
            });
        }

        Ok(Plan {
            tasks: prepared,
            inputs: inputs.clone(),
        })
    }

    /// Execute `plan` once.
    ///
    /// On failure the error carries every output recorded before the failed
    /// task and the final status of every task.
    pub fn execute(
        &self,
        plan: &Plan,
        options: RunOptions<'_>,
    ) -> Result<RunResult, RunError> {
        let RunOptions {
            cancel,
            sink,
            observer,
        } = options;
        let run_id = next_run_id();
        let span = info_span!("run", run_id = %run_id);
        let _enter = span.enter();

        let mut ctl = RunControl { cancel, observer };
        let mut statuses: Vec<(String, TaskStatus)> = plan
            .tasks
            .iter()
            .map(|task| (task.id.clone(), TaskStatus::Pending))
            .collect();
        let mut context = ExecutionContext::new();
        let mut outputs: Vec<TaskOutput> = Vec::with_capacity(plan.len());
        let mut failure: Option<(String, TaskError)> = None;

        info!(tasks = plan.len(), "run started");
        ctl.emit(RunEvent::RunStarted {
            run_id: run_id.clone(),
            tasks: plan.len(),
        });

        for (index, task) in plan.tasks.iter().enumerate() {
            let _task_span = info_span!("task", task_id = %task.id).entered();
            if ctl.is_cancelled() {
                set_status(&mut statuses[index].1, TaskStatus::Failed);
                failure = Some(self.fail_task(&mut ctl, task, TaskError::Cancelled));
                break;
            }

            set_status(&mut statuses[index].1, TaskStatus::Running);
            info!(index, role = task.role.name(), "task started");
            ctl.emit(RunEvent::TaskStarted {
                index,
                task_id: task.id.clone(),
                role: task.role.name().to_string(),
            });

            let prompt = context.render_for(&self.prompts, &task.description, &task.expected_output);
            let result = self.run_task(task, prompt, &mut ctl).and_then(|done| {
                // A cancel that lands while the task runs still discards its output.
                if ctl.is_cancelled() {
                    return Err(TaskError::Cancelled);
                }
                context.append(task.id.clone(), done.output.clone())?;
                Ok(done)
            });

            match result {
                Ok(done) => {
                    set_status(&mut statuses[index].1, TaskStatus::Succeeded);
                    info!(attempts = done.attempts, tool_calls = done.tool_calls, "task succeeded");
                    ctl.emit(RunEvent::TaskSucceeded {
                        task_id: task.id.clone(),
                        attempts: done.attempts,
                        tool_calls: done.tool_calls,
                    });
                    outputs.push(TaskOutput {
                        task_id: task.id.clone(),
                        role: task.role.name().to_string(),
                        output: done.output,
                        attempts: done.attempts,
                        tool_calls: done.tool_calls,
                    });
                }
                Err(err) => {
                    set_status(&mut statuses[index].1, TaskStatus::Failed);
                    failure = Some(self.fail_task(&mut ctl, task, err));
                    break;
                }
            }
        }

        let outcome = match failure {
            None => {
                let final_output = outputs
                    .last()
                    .map(|entry| entry.output.clone())
                    .unwrap_or_default();
                Ok(RunResult {
                    run_id: run_id.clone(),
                    per_task_outputs: outputs,
                    final_output,
                })
            }
            Some((failed_task_id, cause)) => Err(RunError {
                run_id: run_id.clone(),
                failed_task_id,
                cause,
                partial_outputs: outputs,
                statuses,
            }),
        };

        let state = match &outcome {
            Ok(_) => RunState::Completed,
            Err(_) => RunState::Aborted,
        };
        if let Some(sink) = sink {
            deliver(sink, &run_id, state, &outcome, &plan.inputs);
        }
        match &outcome {
            Ok(result) => info!(outputs = result.per_task_outputs.len(), "run completed"),
            Err(err) => warn!(failed_task = %err.failed_task_id, error = %err.cause, "run aborted"),
        }
        ctl.emit(RunEvent::RunFinished { run_id, state });
        outcome
    }

    fn fail_task(
        &self,
        ctl: &mut RunControl<'_>,
        task: &PreparedTask,
        err: TaskError,
    ) -> (String, TaskError) {
        warn!(error = %err, "task failed");
        ctl.emit(RunEvent::TaskFailed {
            task_id: task.id.clone(),
            error: err.clone(),
        });
        (task.id.clone(), err)
    }

    /// Backend calls and tool rounds for one task.
    fn run_task(
        &self,
        task: &PreparedTask,
        prompt: String,
        ctl: &mut RunControl<'_>,
    ) -> Result<TaskDone, TaskError> {
        let mut scratchpad = Scratchpad::new();
        let mut attempts = 0u32;
        let mut tool_calls = 0u32;
        loop {
            let request = GenerateRequest {
                system_directive: task.system_directive.clone(),
                prompt: scratchpad.render_onto(&prompt),
                model: self.model.clone(),
                timeout: self.config.call_timeout(),
            };
            let reply = self.generate(task, &request, ctl, &mut attempts)?;

            // Roles without tools never see the protocol; the reply is the answer.
            if !task.role.has_tools() {
                return Ok(TaskDone {
                    output: reply,
                    attempts,
                    tool_calls,
                });
            }
            let call = match parse_reply(&reply) {
                Reply::Final(output) => {
                    return Ok(TaskDone {
                        output,
                        attempts,
                        tool_calls,
                    });
                }
                Reply::ToolCall(call) => call,
            };

            if tool_calls >= self.config.max_tool_rounds {
                return Err(TaskError::ToolLoopExceeded {
                    rounds: self.config.max_tool_rounds,
                });
            }
            if ctl.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            if !task.role.allows_tool(&call.tool) {
                return Err(ToolError::UnknownTool { tool: call.tool }.into());
            }

            tool_calls += 1;
            debug!(tool = %call.tool, round = tool_calls, input_len = call.input.len(), "calling tool");
            let observation = self.registry.invoke_with_timeout(
                &call.tool,
                &call.input,
                self.config.call_timeout(),
            )?;
            ctl.emit(RunEvent::ToolCalled {
                task_id: task.id.clone(),
                tool: call.tool.clone(),
                round: tool_calls,
            });
            scratchpad.push(&call, &observation);
        }
    }

    /// One generation step: the first call plus any retries.
    fn generate(
        &self,
        task: &PreparedTask,
        request: &GenerateRequest,
        ctl: &mut RunControl<'_>,
        total_attempts: &mut u32,
    ) -> Result<String, TaskError> {
        let mut attempt = 0u32;
        loop {
            if ctl.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            attempt += 1;
            *total_attempts += 1;
            debug!(attempt, prompt_bytes = request.prompt.len(), "calling backend");

            let err = match self.backend.generate(request) {
                Ok(reply) => return Ok(reply),
                Err(err) => err,
            };
            match self.retry.decide(attempt, &err) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(attempt, kind = %err.kind, delay_ms = delay.as_millis() as u64, "backend call failed, retrying");
                    ctl.emit(RunEvent::BackendRetry {
                        task_id: task.id.clone(),
                        attempt,
                        kind: err.kind,
                        delay,
                    });
                    if !ctl.sleep(delay) {
                        return Err(TaskError::Cancelled);
                    }
                }
                RetryDecision::GiveUp => {
                    warn!(attempt, kind = %err.kind, "backend call failed, giving up");
                    return Err(TaskError::Backend {
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }
}

struct TaskDone {
    output: String,
    attempts: u32,
    tool_calls: u32,
}

struct RunControl<'a> {
    cancel: Option<&'a CancellationToken>,
    observer: Option<&'a mut dyn FnMut(&RunEvent)>,
}

impl RunControl<'_> {
    fn is_cancelled(&self) -> bool {
        self.cancel.is_some_and(CancellationToken::is_cancelled)
    }

    fn emit(&mut self, event: RunEvent) {
        if let Some(observer) = self.observer.as_deref_mut() {
            observer(&event);
        }
    }

    /// Sleep for `delay`; returns `false` if cancelled first.
    fn sleep(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(CANCEL_POLL));
        }
    }
}

fn set_status(status: &mut TaskStatus, next: TaskStatus) {
    let applied = status.transition(next);
    debug_assert!(applied, "illegal task transition to {}", next.as_str());
}

fn deliver(
    sink: &mut dyn ResultSink,
    run_id: &str,
    state: RunState,
    outcome: &Result<RunResult, RunError>,
    inputs: &Inputs,
) {
    let (outputs, error) = match outcome {
        Ok(result) => (result.per_task_outputs.as_slice(), None),
        Err(err) => (err.partial_outputs.as_slice(), Some(err)),
    };
    let delivered = sink.deliver(&RunOutcome {
        run_id,
        state,
        outputs,
        inputs,
        error,
    });
    if let Err(err) = delivered {
        warn!(error = %format!("{err:#}"), "result sink failed");
    }
}

fn next_run_id() -> String {
    let seq = RUN_SEQ.fetch_add(1, Ordering::Relaxed);
    format!(
        "run-{}-{seq:04}",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedBackend, fast_config, role, task};
    use crate::tools::Tool;

    fn engine(backend: ScriptedBackend, registry: ToolRegistry) -> Engine<ScriptedBackend> {
        Engine::new(fast_config(), Arc::new(registry), backend).expect("engine")
    }

    fn inputs(pairs: &[(&str, &str)]) -> Inputs {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn plan_renders_inputs_into_tasks_and_directive() {
        let writer = Arc::new(Role::new(
            "Writer",
            "Document {{ project }}",
            "Writes for {{ audience }}",
        ));
        let tasks = vec![
            Task::builder("draft")
                .role(writer)
                .description("Draft notes for {{ project }}")
                .expected_output("Notes about {{ project }}")
                .build()
                .expect("task"),
        ];
        let engine = engine(ScriptedBackend::new(Vec::new()), ToolRegistry::new());
        let plan = engine
            .plan(
                &tasks,
                &inputs(&[("project", "Shop"), ("audience", "engineers")]),
            )
            .expect("plan");

        let prepared = &plan.tasks()[0];
        assert_eq!(prepared.description(), "Draft notes for Shop");
        assert_eq!(prepared.expected_output(), "Notes about Shop");
        assert!(prepared.system_directive().contains("You are Writer."));
        assert!(prepared.system_directive().contains("Document Shop"));
        assert!(prepared.system_directive().contains("Writes for engineers"));
        assert!(!prepared.system_directive().contains("## Tools"));
    }

    #[test]
    fn plan_rejects_missing_input() {
        let tasks = vec![task("t1", role("Writer"), "About {{ topic }}")];
        let engine = engine(ScriptedBackend::new(Vec::new()), ToolRegistry::new());
        let err = engine.plan(&tasks, &Inputs::new()).unwrap_err();
        assert!(matches!(err, SetupError::InvalidTask { task_id, .. } if task_id == "t1"));
    }

    #[test]
    fn plan_rejects_delegation_and_duplicates() {
        let engine = engine(ScriptedBackend::new(Vec::new()), ToolRegistry::new());

        let delegating = Arc::new(Role::new("Lead", "lead", "leads").with_delegation(true));
        let err = engine
            .plan(&[task("t1", delegating, "do")], &Inputs::new())
            .unwrap_err();
        assert!(matches!(err, SetupError::Configuration(msg) if msg.contains("delegation")));

        let writer = role("Writer");
        let tasks = vec![
            task("same", Arc::clone(&writer), "one"),
            task("same", writer, "two"),
        ];
        let err = engine.plan(&tasks, &Inputs::new()).unwrap_err();
        assert_eq!(err, SetupError::invalid_task("same", "duplicate task id"));

        let err = engine.plan(&[], &Inputs::new()).unwrap_err();
        assert!(matches!(err, SetupError::Configuration(_)));
    }

    #[test]
    fn plan_rejects_unregistered_role_tool() {
        let engine = engine(ScriptedBackend::new(Vec::new()), ToolRegistry::new());
        let researcher = Arc::new(Role::new("Researcher", "research", "curious").with_tools(["search"]));
        let err = engine
            .plan(&[task("t1", researcher, "find")], &Inputs::new())
            .unwrap_err();
        assert_eq!(
            err,
            SetupError::Tool(ToolError::UnknownTool {
                tool: "search".to_string()
            })
        );
    }

    #[test]
    fn plan_lists_tools_in_directive() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Tool::function("search", "Search the notes", |q| Ok(q.to_string())))
            .expect("register");
        let engine = engine(ScriptedBackend::new(Vec::new()), registry);
        let researcher = Arc::new(Role::new("Researcher", "research", "curious").with_tools(["search"]));
        let plan = engine
            .plan(&[task("t1", researcher, "find")], &Inputs::new())
            .expect("plan");
        let directive = plan.tasks()[0].system_directive();
        assert!(directive.contains("- search: Search the notes"));
        assert!(directive.contains("Action Input:"));
        assert_eq!(plan.task_ids().collect::<Vec<_>>(), vec!["t1"]);
    }

    #[test]
    fn engine_rejects_invalid_config() {
        let mut config = fast_config();
        config.max_attempts = 0;
        let err = Engine::new(config, Arc::new(ToolRegistry::new()), ScriptedBackend::new(Vec::new()))
            .err()
            .expect("invalid config");
        assert!(matches!(err, SetupError::Configuration(_)));
    }

    #[test]
    fn tool_reply_from_role_without_tools_is_final() {
        let backend = ScriptedBackend::replies(["Action: search\nAction Input: x"]);
        let engine = engine(backend, ToolRegistry::new());
        let result = engine
            .run(&[task("t1", role("Writer"), "write")], &Inputs::new())
            .expect("run");
        assert_eq!(result.final_output, "Action: search\nAction Input: x");
        engine.backend().assert_drained();
    }

    #[test]
    fn reply_from_role_without_tools_keeps_final_answer_phrase() {
        for reply in [
            "Summary of options.\nWe pick the one labelled Final Answer: B because it scales.",
            "Final Answer: kept as written",
        ] {
            let writer = engine(ScriptedBackend::replies([reply]), ToolRegistry::new());
            let result = writer
                .run(&[task("t1", role("Writer"), "write")], &Inputs::new())
                .expect("run");
            assert_eq!(result.final_output, reply);
        }
    }

    #[test]
    fn cancelled_sleep_returns_early() {
        let token = CancellationToken::new();
        token.cancel();
        let ctl = RunControl {
            cancel: Some(&token),
            observer: None,
        };
        let start = Instant::now();
        assert!(!ctl.sleep(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn run_ids_are_unique() {
        let a = next_run_id();
        let b = next_run_id();
        assert_ne!(a, b);
        assert!(a.starts_with("run-"));
    }
}
