//! Runtime Configuration
//!
//! Settings come from the environment (after `.env` is loaded) and can be
//! overridden by command-line flags.

use crate::error::{AgentError, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: PathBuf,
    pub model: String,
    pub cache_dir: PathBuf,
    pub base_url: String,
    pub api_key: Option<String>,
    /// Default LIMIT injected into unbounded reads.
    pub row_limit: usize,
    pub max_rounds: usize,
    pub turn_timeout: Duration,
    pub statement_timeout: Duration,
    pub allow_writes: bool,
    /// Sample rows collected per table during raw extraction.
    pub sample_rows: usize,
    pub llm_max_attempts: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("data.db"),
            model: "gpt-4".to_string(),
            cache_dir: PathBuf::from(".nl2sql_cache"),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            row_limit: 200,
            max_rounds: 5,
            turn_timeout: Duration::from_secs(120),
            statement_timeout: Duration::from_secs(30),
            allow_writes: true,
            sample_rows: 5,
            llm_max_attempts: 3,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| AgentError::Config(format!("{} has an invalid value: {}", key, raw))),
        _ => Ok(None),
    }
}

fn env_bool(key: &str) -> Result<Option<bool>> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "" => Ok(None),
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(AgentError::Config(format!("{} must be a boolean, got {}", key, raw))),
        },
        Err(_) => Ok(None),
    }
}

impl AppConfig {
    /// Build from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(db) = std::env::var("NL2SQL_DATABASE") {
            config.database = PathBuf::from(db);
        }
        if let Ok(model) = std::env::var("OPENAI_MODEL") {
            config.model = model;
        }
        if let Ok(dir) = std::env::var("NL2SQL_CACHE_DIR") {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            config.base_url = url;
        }
        config.api_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty());

        if let Some(v) = env_parse("NL2SQL_ROW_LIMIT")? {
            config.row_limit = v;
        }
        if let Some(v) = env_parse("NL2SQL_MAX_ROUNDS")? {
            config.max_rounds = v;
        }
        if let Some(secs) = env_parse::<u64>("NL2SQL_TURN_TIMEOUT_SECS")? {
            config.turn_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("NL2SQL_STATEMENT_TIMEOUT_SECS")? {
            config.statement_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = env_bool("NL2SQL_ALLOW_WRITES")? {
            config.allow_writes = v;
        }
        if let Some(v) = env_parse("NL2SQL_SAMPLE_ROWS")? {
            config.sample_rows = v;
        }
        if let Some(v) = env_parse("NL2SQL_LLM_MAX_ATTEMPTS")? {
            config.llm_max_attempts = v;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.database.is_file() {
            return Err(AgentError::Config(format!(
                "database file not found: {}",
                self.database.display()
            )));
        }
        if self.model.trim().is_empty() {
            return Err(AgentError::Config("model identifier is empty".to_string()));
        }
        if self.row_limit == 0 {
            return Err(AgentError::Config("row_limit must be greater than zero".to_string()));
        }
        if self.max_rounds == 0 {
            return Err(AgentError::Config("max_rounds must be greater than zero".to_string()));
        }
        if self.llm_max_attempts == 0 {
            return Err(AgentError::Config("llm_max_attempts must be greater than zero".to_string()));
        }
        if self.turn_timeout.is_zero() || self.statement_timeout.is_zero() {
            return Err(AgentError::Config("timeouts must be greater than zero".to_string()));
        }
        Ok(())
    }
}
