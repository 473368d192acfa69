//! Test-only backends and fixtures.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::role::Role;
use crate::core::task::Task;
use crate::error::{BackendError, BackendErrorKind};
use crate::io::backend::{Backend, GenerateRequest};
use crate::io::config::EngineConfig;

/// Backend that replays a fixed queue of replies and records every request.
///
/// Calls beyond the queue fail with `InvalidResponse`, so an unexpected extra
/// call fails the run instead of hanging.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<Result<String, BackendError>>>,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedBackend {
    pub fn new(replies: Vec<Result<String, BackendError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Only successful replies.
    pub fn replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(replies.into_iter().map(|r| Ok(r.into())).collect())
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        lock(&self.requests).clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.requests)
            .iter()
            .map(|request| request.prompt.clone())
            .collect()
    }

    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.replies).len()
    }

    /// Panics if any scripted reply was not consumed.
    pub fn assert_drained(&self) {
        let remaining = self.remaining();
        assert_eq!(remaining, 0, "{remaining} scripted replies were never used");
    }
}

impl Backend for ScriptedBackend {
    fn generate(&self, request: &GenerateRequest) -> Result<String, BackendError> {
        lock(&self.requests).push(request.clone());
        lock(&self.replies).pop_front().unwrap_or_else(|| {
            Err(BackendError::new(
                BackendErrorKind::InvalidResponse,
                "scripted backend has no replies left",
            ))
        })
    }
}

/// Backend driven by a closure; the argument is the 1-based call number.
pub struct FnBackend<F> {
    f: F,
    calls: Mutex<u32>,
}

impl<F> FnBackend<F>
where
    F: Fn(u32, &GenerateRequest) -> Result<String, BackendError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        *lock(&self.calls)
    }
}

impl<F> Backend for FnBackend<F>
where
    F: Fn(u32, &GenerateRequest) -> Result<String, BackendError> + Send + Sync,
{
    fn generate(&self, request: &GenerateRequest) -> Result<String, BackendError> {
        let call = {
            let mut calls = lock(&self.calls);
            *calls += 1;
            *calls
        };
        (self.f)(call, request)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Config with millisecond backoff so retry tests stay fast.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.backend.api_key = Some("test-key".to_string());
    config.backoff_base_ms = 1;
    config.backoff_max_ms = 4;
    config.call_timeout_secs = 5;
    config
}

/// A tool-less role named `name`.
pub fn role(name: &str) -> Arc<Role> {
    Arc::new(Role::new(
        name,
        format!("{name} objective"),
        format!("{name} persona"),
    ))
}

/// A task with a fixed expected output.
pub fn task(id: &str, role: Arc<Role>, description: &str) -> Task {
    Task::builder(id)
        .role(role)
        .description(description)
        .expected_output(format!("{id} result"))
        .build()
        .expect("fixture task should be valid")
}

/// `n` tasks `t1..=tn`, each with its own role.
pub fn numbered_tasks(n: usize) -> Vec<Task> {
    (1..=n)
        .map(|i| {
            task(
                &format!("t{i}"),
                role(&format!("Role {i}")),
                &format!("Do step {i}"),
            )
        })
        .collect()
}
