//! Safety Gate
//!
//! Classifies SQL, applies the write/banned-token policy, bounds reads and
//! executes prepared statements (writes inside a transaction).

pub mod executor;
pub mod gate;

pub use executor::{ExecutionOutcome, SqlExecutor};
pub use gate::SafetyGate;

use crate::error::SafetyViolation;
use serde::{Deserialize, Serialize};

/// Statement kind derived from the SQL text, independent of what the caller declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    ReadOnly,
    Write,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::ReadOnly => "read_only",
            Classification::Write => "write",
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw SQL plus the caller's declared intent. `write = true` is the approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlStatement {
    pub text: String,
    #[serde(default)]
    pub write: bool,
}

impl SqlStatement {
    pub fn new(text: impl Into<String>, write: bool) -> Self {
        Self {
            text: text.into(),
            write,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allowed,
    Denied(SafetyViolation),
    RequiresApproval,
}

/// Statement that passed the gate and is ready to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedStatement {
    pub sql: String,
    pub classification: Classification,
    /// Upper bound on rows fetched for reads.
    pub row_limit: usize,
    pub limit_injected: bool,
}

/// Global policy knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyPolicy {
    /// Kill switch: when false every write is denied, approved or not.
    pub allow_writes: bool,
    pub default_row_limit: usize,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            allow_writes: true,
            default_row_limit: 200,
        }
    }
}
