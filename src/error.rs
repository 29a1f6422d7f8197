use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Why the safety gate refused a statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SafetyViolation {
    #[error("write without approval (statement classified as {classification})")]
    WriteWithoutApproval { classification: String },

    #[error("banned token detected: {token}")]
    BannedToken { token: String },

    #[error("writes are disabled by policy")]
    WritesDisabled,

    #[error("empty statement")]
    EmptyStatement,
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Safety violation: {0}")]
    Safety(#[from] SafetyViolation),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Database error: {0}")]
    Database(String),

    /// Transient model failure; eligible for retry.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Model answered, but the answer could not be used. Not retried.
    #[error("LLM response error: {0}")]
    LlmResponse(String),

    #[error("Model unavailable after {attempts} attempts: {last_error}")]
    ModelUnavailable { attempts: u32, last_error: String },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid tool input for {tool}: {message}")]
    InvalidToolInput { tool: String, message: String },

    #[error("Tool protocol error: {0}")]
    ToolProtocol(String),

    #[error("Max tool rounds ({0}) exceeded")]
    MaxRoundsExceeded(usize),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    /// Whether a Brain call that failed with this error may be attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::Llm(_))
    }
}

impl From<rusqlite::Error> for AgentError {
    fn from(err: rusqlite::Error) -> Self {
        AgentError::Database(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
