//! Brain abstraction
//!
//! The model collaborator: takes a conversation plus a tool catalog and answers
//! with a model Turn (text and/or tool-call requests).

pub mod client;
pub mod retry;

pub use client::LlmClient;
pub use retry::{RetryPolicy, RetryingBrain, Sleeper, TokioSleeper};

use crate::conversation::{Turn, Role};
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool declaration sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool input.
    pub input_schema: Value,
}

#[derive(Debug, Clone)]
pub struct BrainRequest {
    pub system: Option<String>,
    pub turns: Vec<Turn>,
    pub tools: Vec<ToolSpec>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl BrainRequest {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self {
            system: None,
            turns,
            tools: Vec::new(),
            max_tokens: 2000,
            temperature: 0.3,
        }
    }

    /// Single user prompt, no tools.
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self::new(vec![Turn::user(prompt)])
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
pub trait Brain: Send + Sync {
    /// Produce the next model turn for the given conversation.
    async fn converse(&self, request: &BrainRequest) -> Result<Turn>;

    /// Text-only completion; tool calls in the reply are an error.
    async fn complete(&self, request: &BrainRequest) -> Result<String> {
        let turn = self.converse(request).await?;
        if turn.role != Role::Model {
            return Err(AgentError::LlmResponse(format!(
                "expected a model turn, got {:?}",
                turn.role
            )));
        }
        if !turn.tool_calls().is_empty() {
            return Err(AgentError::LlmResponse(
                "model requested tools on a text-only call".to_string(),
            ));
        }
        let text = turn.text();
        if text.is_empty() {
            return Err(AgentError::LlmResponse("empty model response".to_string()));
        }
        Ok(text)
    }
}

/// Strip a markdown code fence the model may wrap around JSON or SQL.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };
    let after = &trimmed[start + 3..];
    // skip an info string such as `sql` or `json`
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

/// Parse a JSON document out of a model reply, tolerating code fences and leading prose.
pub fn parse_json_reply<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    let body = strip_code_fence(raw);
    if let Ok(v) = serde_json::from_str::<T>(body) {
        return Ok(v);
    }
    let start = body.find('{');
    let end = body.rfind('}');
    match (start, end) {
        (Some(s), Some(e)) if e > s => serde_json::from_str::<T>(&body[s..=e])
            .map_err(|e| AgentError::LlmResponse(format!("Failed to parse model JSON: {}", e))),
        _ => Err(AgentError::LlmResponse(
            "No JSON object in model response".to_string(),
        )),
    }
}
