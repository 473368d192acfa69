//! Tool-call protocol between the engine and the generation backend.
//!
//! A backend reply requests a tool with two lines:
//!
//! ```text
//! Action: research_patterns
//! Action Input: event-driven commerce
//! ```
//!
//! and finishes with a line starting `Final Answer: ...`. A reply with neither
//! marker is taken as the final answer verbatim.

use std::sync::LazyLock;

use regex::Regex;

static FINAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?ms)^[ \t]*Final Answer:[ \t]*(.*)\z").expect("final answer regex"));
static ACTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*Action:[ \t]*(\S.*?)[ \t]*$").expect("action regex"));
static INPUT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)Action Input:[ \t]*(.*?)(?:\n[ \t]*Observation:|\z)").expect("input regex")
});
static OBSERVATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*Observation:").expect("observation regex"));

/// A tool request extracted from a backend reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub tool: String,
    pub input: String,
    /// The reply up to the end of the request, without any observation the
    /// model invented for itself.
    pub transcript: String,
}

/// A parsed backend reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Final(String),
    ToolCall(ToolCall),
}

/// Parse a reply from a role that has tools.
///
/// `Final Answer:` wins over a tool request in the same reply.
pub fn parse_reply(response: &str) -> Reply {
    if let Some(caps) = FINAL_RE.captures(response) {
        return Reply::Final(caps[1].trim().to_string());
    }
    let Some(action) = ACTION_RE.captures(response) else {
        return Reply::Final(response.to_string());
    };
    let tool = action[1].to_string();
    let input = INPUT_RE
        .captures(response)
        .map(|caps| caps[1].trim().to_string())
        .unwrap_or_default();
    let transcript = match OBSERVATION_RE.find(response) {
        Some(found) => response[..found.start()].trim().to_string(),
        None => response.trim().to_string(),
    };
    Reply::ToolCall(ToolCall {
        tool,
        input,
        transcript,
    })
}

/// Tool requests and their observations for the current task, spliced back
/// into the prompt on every follow-up backend call.
#[derive(Debug, Clone, Default)]
pub struct Scratchpad {
    rounds: Vec<String>,
}

impl Scratchpad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, call: &ToolCall, observation: &str) {
        self.rounds.push(format!(
            "{}\nObservation: {}",
            call.transcript,
            observation.trim()
        ));
    }

    pub fn rounds(&self) -> usize {
        self.rounds.len()
    }

    /// `prompt` followed by every recorded round, oldest first.
    pub fn render_onto(&self, prompt: &str) -> String {
        if self.rounds.is_empty() {
            return prompt.to_string();
        }
        let mut buf = String::with_capacity(prompt.len() + 256);
        buf.push_str(prompt.trim_end());
        buf.push_str("\n\n## Tool results so far\n\n");
        buf.push_str(&self.rounds.join("\n\n"));
        buf.push('\n');
        buf
    }
}
