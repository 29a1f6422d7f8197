//! Agent layer: tool-calling chat loop and single-shot query answering

pub mod orchestrator;
pub mod query_agent;
pub mod retriever;
pub mod tools;

pub use orchestrator::{DispatchMode, OrchestratorConfig, ToolOrchestrator, TurnOutcome};
pub use query_agent::{QueryAgent, QueryAnswer};
pub use retriever::{Example, ExampleRetriever, KeywordRetriever, NoExamples};
pub use tools::{catalog, ToolBox, ToolName};
