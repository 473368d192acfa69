//! Engine configuration stored in `crewline.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::retry::RetryPolicy;
use crate::error::SetupError;
use crate::io::backend::ModelConfig;

pub const CONFIG_FILE: &str = "crewline.toml";

pub const ENV_API_KEY: &str = "CREWLINE_API_KEY";
pub const ENV_API_KEY_FALLBACK: &str = "OPENAI_API_KEY";
pub const ENV_API_BASE: &str = "CREWLINE_API_BASE";
pub const ENV_MODEL: &str = "CREWLINE_MODEL";

/// Engine configuration (TOML).
///
/// Meant to be edited by humans. Missing fields take the defaults below. The
/// engine takes ownership of a validated config and never changes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub backend: BackendConfig,

    /// Total backend calls per generation step, the first one included.
    pub max_attempts: u32,

    /// Tool calls allowed per task before the task fails.
    pub max_tool_rounds: u32,

    /// Per backend call and per tool invocation.
    pub call_timeout_secs: u64,

    /// First retry delay; doubles on each further retry.
    pub backoff_base_ms: u64,

    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of an OpenAI-compatible API (without `/chat/completions`).
    pub endpoint: String,

    /// Usually supplied through the environment instead of the file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    pub model: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: Some(0.7),
            max_tokens: None,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            max_attempts: 3,
            max_tool_rounds: 5,
            call_timeout_secs: 120,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), SetupError> {
        let invalid = |msg: &str| Err(SetupError::Configuration(msg.to_string()));
        if self.backend.endpoint.trim().is_empty() {
            return invalid("backend.endpoint must not be empty");
        }
        if self.backend.model.trim().is_empty() {
            return invalid("backend.model must not be empty");
        }
        if let Some(temperature) = self.backend.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return invalid("backend.temperature must be within 0.0..=2.0");
            }
        }
        if self.backend.max_tokens == Some(0) {
            return invalid("backend.max_tokens must be > 0");
        }
        if self.max_attempts == 0 {
            return invalid("max_attempts must be > 0");
        }
        if self.call_timeout_secs == 0 {
            return invalid("call_timeout_secs must be > 0");
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return invalid("backoff_max_ms must be >= backoff_base_ms");
        }
        Ok(())
    }

    /// Overlay environment variables onto the loaded file.
    ///
    /// `lookup` is `std::env::var(..).ok()` in production; tests pass a map.
    /// Empty values are ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(key) = get(ENV_API_KEY).or_else(|| get(ENV_API_KEY_FALLBACK)) {
            self.backend.api_key = Some(key);
        }
        if let Some(base) = get(ENV_API_BASE) {
            self.backend.endpoint = base;
        }
        if let Some(model) = get(ENV_MODEL) {
            self.backend.model = model;
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn model(&self) -> ModelConfig {
        ModelConfig {
            model_name: self.backend.model.clone(),
            temperature: self.backend.temperature,
            max_tokens: self.backend.max_tokens,
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path has no file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
