//! Conversation Model
//!
//! Turns, content blocks and the caller-owned session that carries them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
    ToolResult,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    UnknownTool,
    InvalidInput,
    SafetyViolation,
    ExecutionError,
    HandlerError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFailure {
    pub kind: ToolErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Payload(Value),
    Error(ToolFailure),
}

/// Outcome of one tool call, paired to its request by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub id: String,
    #[serde(flatten)]
    pub outcome: ToolOutcome,
}

impl ToolResult {
    pub fn payload(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            outcome: ToolOutcome::Payload(payload),
        }
    }

    pub fn error(id: impl Into<String>, kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            outcome: ToolOutcome::Error(ToolFailure {
                kind,
                message: message.into(),
                detail: None,
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Error(_))
    }

    /// JSON body handed back to the model.
    pub fn to_model_json(&self) -> Value {
        match &self.outcome {
            ToolOutcome::Payload(v) => v.clone(),
            ToolOutcome::Error(f) => serde_json::json!({
                "error": f.message,
                "kind": f.kind,
                "detail": f.detail,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolCallRequest(ToolCallRequest),
    ToolResult(ToolResult),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        Self {
            role: Role::ToolResult,
            content: results.into_iter().map(ContentBlock::ToolResult).collect(),
        }
    }

    /// All text blocks joined with newlines.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }

    pub fn tool_calls(&self) -> Vec<&ToolCallRequest> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolCallRequest(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    pub fn tool_results_iter(&self) -> impl Iterator<Item = &ToolResult> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolResult(result) => Some(result),
            _ => None,
        })
    }

    pub fn is_final(&self) -> bool {
        self.role == Role::Model && self.tool_calls().is_empty()
    }

    /// Returns the first id that appears more than once among this turn's tool calls.
    pub fn duplicate_call_id(&self) -> Option<String> {
        let mut seen = HashSet::new();
        self.tool_calls()
            .into_iter()
            .find(|call| !seen.insert(call.id.as_str()))
            .map(|call| call.id.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn extend(&mut self, turns: impl IntoIterator<Item = Turn>) {
        self.turns.extend(turns);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// (user question, final model answer) pairs, oldest first. Tool traffic is skipped.
    pub fn exchanges(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        let mut pending_user: Option<String> = None;
        for turn in &self.turns {
            match turn.role {
                Role::User => pending_user = Some(turn.text()),
                Role::Model if turn.is_final() => {
                    if let Some(question) = pending_user.take() {
                        out.push((question, turn.text()));
                    }
                }
                _ => {}
            }
        }
        out
    }
}

/// Caller-owned conversation state. Created on first message, reset by `clear`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub conversation: Conversation,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            conversation: Conversation::new(),
        }
    }

    pub fn clear(&mut self) {
        self.conversation = Conversation::new();
    }
}
