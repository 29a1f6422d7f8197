pub mod agent;
pub mod agent_prompts;
pub mod config;
pub mod conversation;
pub mod db;
pub mod error;
pub mod llm;
pub mod safety;
pub mod schema_cache;
pub mod service;

pub use config::AppConfig;
pub use conversation::{Session, Turn};
pub use error::{AgentError, Result, SafetyViolation};
pub use service::AgentService;
