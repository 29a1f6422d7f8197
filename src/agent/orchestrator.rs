//! Tool Orchestrator
//!
//! Turn-level loop: ask the Brain, run the tool calls it requests, hand the
//! results back, and stop when a model turn carries no tool calls.
//!
//! AwaitingUser -> Reasoning -> (Executing -> Reasoning)* -> Final

use crate::agent::tools::{catalog, ToolBox};
use crate::agent_prompts::DATA_AGENT_SYSTEM_PROMPT;
use crate::conversation::{Conversation, Role, Session, ToolCallRequest, ToolErrorKind, ToolResult, Turn};
use crate::error::{AgentError, Result};
use crate::llm::{Brain, BrainRequest};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// How the tool calls of a single model turn are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// One after another, in request order.
    #[default]
    Sequential,
    /// All at once; results are still reported in request order.
    Concurrent,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_rounds: usize,
    pub turn_timeout: Duration,
    pub dispatch: DispatchMode,
    pub system_prompt: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            turn_timeout: Duration::from_secs(120),
            dispatch: DispatchMode::Sequential,
            system_prompt: DATA_AGENT_SYSTEM_PROMPT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub answer: String,
    /// Brain calls made for this turn.
    pub rounds: usize,
    pub tool_calls: usize,
}

pub struct ToolOrchestrator {
    brain: Arc<dyn Brain>,
    tools: Arc<ToolBox>,
    config: OrchestratorConfig,
}

impl ToolOrchestrator {
    pub fn new(brain: Arc<dyn Brain>, tools: Arc<ToolBox>, config: OrchestratorConfig) -> Self {
        Self { brain, tools, config }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run one user turn to completion.
    ///
    /// The session is only updated when the turn finishes; on error (including
    /// timeout) it is left exactly as it was. Tool side effects are not undone.
    pub async fn run_turn(&self, session: &mut Session, message: &str) -> Result<TurnOutcome> {
        let mut working = session.conversation.clone();
        working.push(Turn::user(message));

        let outcome = match tokio::time::timeout(self.config.turn_timeout, self.drive(&mut working)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("Turn exceeded {:?}", self.config.turn_timeout);
                return Err(AgentError::Timeout(self.config.turn_timeout));
            }
        };

        session.conversation = working;
        Ok(outcome)
    }

    async fn drive(&self, working: &mut Conversation) -> Result<TurnOutcome> {
        let tools = catalog();
        let mut tool_calls = 0;

        for round in 1..=self.config.max_rounds {
            let request = BrainRequest::new(working.turns().to_vec())
                .with_system(self.config.system_prompt.clone())
                .with_tools(tools.clone());
            let turn = self.brain.converse(&request).await?;

            if turn.role != Role::Model {
                return Err(AgentError::ToolProtocol(format!(
                    "brain returned a {:?} turn",
                    turn.role
                )));
            }
            if let Some(id) = turn.duplicate_call_id() {
                return Err(AgentError::ToolProtocol(format!(
                    "tool call id '{}' used more than once in one turn",
                    id
                )));
            }

            let calls: Vec<ToolCallRequest> = turn.tool_calls().into_iter().cloned().collect();
            working.push(turn);

            if calls.is_empty() {
                let answer = working.last().map(Turn::text).unwrap_or_default();
                info!("✅ Turn finished after {} round(s), {} tool call(s)", round, tool_calls);
                return Ok(TurnOutcome {
                    answer,
                    rounds: round,
                    tool_calls,
                });
            }

            debug!("Round {}: dispatching {} tool call(s)", round, calls.len());
            tool_calls += calls.len();
            let results = self.dispatch_all(&calls).await;
            check_pairing(&calls, &results)?;
            working.push(Turn::tool_results(results));
        }

        Err(AgentError::MaxRoundsExceeded(self.config.max_rounds))
    }

    async fn dispatch_all(&self, calls: &[ToolCallRequest]) -> Vec<ToolResult> {
        match self.config.dispatch {
            DispatchMode::Sequential => {
                let mut results = Vec::with_capacity(calls.len());
                for call in calls {
                    results.push(self.tools.dispatch(call).await);
                }
                results
            }
            DispatchMode::Concurrent => {
                let mut set = JoinSet::new();
                for (idx, call) in calls.iter().cloned().enumerate() {
                    let tools = Arc::clone(&self.tools);
                    set.spawn(async move { (idx, tools.dispatch(&call).await) });
                }
                let mut slots: Vec<Option<ToolResult>> = vec![None; calls.len()];
                while let Some(joined) = set.join_next().await {
                    match joined {
                        Ok((idx, result)) => slots[idx] = Some(result),
                        Err(e) => warn!("Tool task failed: {}", e),
                    }
                }
                slots
                    .into_iter()
                    .zip(calls)
                    .map(|(slot, call)| {
                        slot.unwrap_or_else(|| {
                            ToolResult::error(call.id.clone(), ToolErrorKind::HandlerError, "tool task failed")
                        })
                    })
                    .collect()
            }
        }
    }
}

/// Every request gets exactly one result, with the same id, in request order.
fn check_pairing(calls: &[ToolCallRequest], results: &[ToolResult]) -> Result<()> {
    let requested: Vec<&str> = calls.iter().map(|c| c.id.as_str()).collect();
    let answered: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
    if requested != answered {
        return Err(AgentError::ToolProtocol(format!(
            "tool results {:?} do not match requests {:?}",
            answered, requested
        )));
    }
    let unique: HashSet<&str> = answered.iter().copied().collect();
    if unique.len() != answered.len() {
        return Err(AgentError::ToolProtocol("duplicate tool result ids".to_string()));
    }
    Ok(())
}
