//! Generation backend abstraction.
//!
//! The [`Backend`] trait decouples the engine from the actual generation
//! service. [`HttpBackend`] talks to an OpenAI-compatible chat completions
//! endpoint; tests use scripted backends that return predetermined replies.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{BackendError, BackendErrorKind, SetupError};
use crate::io::config::EngineConfig;

/// Model parameters forwarded with every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_name: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Parameters for one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    /// Role persona and objective (plus tool protocol, when the role has tools).
    pub system_directive: String,
    /// Accumulated context, task description, and tool results.
    pub prompt: String,
    pub model: ModelConfig,
    /// Maximum time to wait for this single call.
    pub timeout: Duration,
}

/// Abstraction over generation services.
pub trait Backend {
    /// Produce a reply for `request`, or classify why it failed.
    fn generate(&self, request: &GenerateRequest) -> Result<String, BackendError>;
}

impl<B: Backend + ?Sized> Backend for &B {
    fn generate(&self, request: &GenerateRequest) -> Result<String, BackendError> {
        (**self).generate(request)
    }
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn generate(&self, request: &GenerateRequest) -> Result<String, BackendError> {
        (**self).generate(request)
    }
}

/// Backend for OpenAI-compatible `POST {endpoint}/chat/completions` APIs.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    endpoint: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

impl HttpBackend {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    /// Build from configuration; an API key is required.
    pub fn from_config(config: &EngineConfig) -> Result<Self, SetupError> {
        let api_key = config
            .backend
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                SetupError::Configuration(
                    "missing API key (set backend.api_key or CREWLINE_API_KEY)".to_string(),
                )
            })?;
        Ok(Self::new(&config.backend.endpoint, api_key))
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.endpoint)
    }
}

impl Backend for HttpBackend {
    #[instrument(skip_all, fields(model = %request.model.model_name, timeout_secs = request.timeout.as_secs()))]
    fn generate(&self, request: &GenerateRequest) -> Result<String, BackendError> {
        let body = ChatRequest {
            model: &request.model.model_name,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system_directive,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            temperature: request.model.temperature,
            max_tokens: request.model.max_tokens,
        };
        let payload = serde_json::to_string(&body).map_err(|err| {
            BackendError::new(
                BackendErrorKind::InvalidRequest,
                format!("serialize request: {err}"),
            )
        })?;

        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(request.timeout))
            .http_status_as_error(false)
            .build()
            .into();

        info!(url = %self.url(), prompt_bytes = request.prompt.len(), "calling backend");
        let mut response = agent
            .post(&self.url())
            .header("Authorization", &format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .send(payload.as_bytes())
            .map_err(classify_transport_error)?;

        let status = response.status().as_u16();
        let text = response
            .body_mut()
            .read_to_string()
            .map_err(classify_transport_error)?;

        if !(200..300).contains(&status) {
            let err = classify_status(status, &text);
            warn!(status, kind = %err.kind, "backend returned error status");
            return Err(err);
        }

        let parsed = parse_chat_response(&text)?;
        debug!(reply_bytes = parsed.len(), "backend replied");
        Ok(parsed)
    }
}

fn parse_chat_response(text: &str) -> Result<String, BackendError> {
    let response: ChatResponse = serde_json::from_str(text).map_err(|err| {
        BackendError::new(
            BackendErrorKind::InvalidResponse,
            format!("parse chat completion: {err}"),
        )
    })?;
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| {
            BackendError::new(
                BackendErrorKind::InvalidResponse,
                "chat completion has no message content",
            )
        })
}

/// Map an HTTP status to an error kind.
pub fn classify_status(status: u16, body: &str) -> BackendError {
    let kind = match status {
        429 => BackendErrorKind::RateLimited,
        401 | 403 => BackendErrorKind::Unauthorized,
        408 | 504 => BackendErrorKind::Timeout,
        500..=599 => BackendErrorKind::ServerError,
        _ => BackendErrorKind::InvalidRequest,
    };
    BackendError::new(kind, format!("HTTP {status}: {}", snippet(body)))
}

fn classify_transport_error(err: ureq::Error) -> BackendError {
    match err {
        ureq::Error::Timeout(_) => BackendError::timeout(err.to_string()),
        ureq::Error::StatusCode(status) => classify_status(status, ""),
        other => BackendError::server_error(other.to_string()),
    }
}

fn snippet(body: &str) -> String {
    const LIMIT: usize = 200;
    let trimmed = body.trim();
    match trimmed.char_indices().nth(LIMIT) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(429, "").kind, BackendErrorKind::RateLimited);
        assert_eq!(classify_status(401, "").kind, BackendErrorKind::Unauthorized);
        assert_eq!(classify_status(403, "").kind, BackendErrorKind::Unauthorized);
        assert_eq!(classify_status(504, "").kind, BackendErrorKind::Timeout);
        assert_eq!(classify_status(503, "").kind, BackendErrorKind::ServerError);
        assert_eq!(classify_status(400, "").kind, BackendErrorKind::InvalidRequest);
    }

    #[test]
    fn error_message_includes_truncated_body() {
        let body = "x".repeat(500);
        let err = classify_status(500, &body);
        assert!(err.message.starts_with("HTTP 500: xxx"));
        assert!(err.message.ends_with("..."));
        assert!(err.message.len() < 300);
    }

    #[test]
    fn parses_first_choice_content() {
        let text = r#"{"choices":[{"message":{"role":"assistant","content":"hello"}}]}"#;
        assert_eq!(parse_chat_response(text).expect("parse"), "hello");
    }

    #[test]
    fn empty_choices_are_invalid_response() {
        let err = parse_chat_response(r#"{"choices":[]}"#).unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::InvalidResponse);
        let err = parse_chat_response("not json").unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::InvalidResponse);
    }

    #[test]
    fn from_config_requires_api_key() {
        let mut config = EngineConfig::default();
        config.backend.api_key = None;
        let err = HttpBackend::from_config(&config).unwrap_err();
        assert!(matches!(err, SetupError::Configuration(_)));

        config.backend.api_key = Some("sk-test".to_string());
        config.backend.endpoint = "https://api.example.com/v1/".to_string();
        let backend = HttpBackend::from_config(&config).expect("backend");
        assert_eq!(backend.url(), "https://api.example.com/v1/chat/completions");
    }
}
