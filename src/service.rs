//! Agent Service
//!
//! Management surface over one database target: cache lifecycle, single-shot
//! queries, direct gated execution and tool-calling chat. Every response is a
//! serde payload so callers can hand it straight to JSON.

use crate::agent::{
    DispatchMode, ExampleRetriever, OrchestratorConfig, QueryAgent, QueryAnswer,
    ToolBox, ToolOrchestrator,
};
use crate::config::AppConfig;
use crate::conversation::Session;
use crate::db::{introspect, Database};
use crate::error::{AgentError, Result};
use crate::llm::{Brain, LlmClient, RetryPolicy, RetryingBrain};
use crate::safety::{Classification, ExecutionOutcome, SafetyGate, SafetyPolicy, SqlExecutor};
use crate::schema_cache::{
    CacheInfo, CacheStore, DataDictionary, FsCacheStore, SchemaCachePipeline, StructuredSchema,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeResponse {
    pub database_identity: String,
    pub content_hash: String,
    pub tables: usize,
    pub built_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub sql: String,
    pub classification: Classification,
    pub limit_injected: bool,
    #[serde(flatten)]
    pub outcome: ExecutionOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub session_id: Uuid,
    pub answer: String,
    pub rounds: usize,
    pub tool_calls: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub database_identity: String,
    pub removed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub database_identity: String,
    pub path: String,
    pub tables: Vec<String>,
    pub structured_schema: Option<StructuredSchema>,
    pub data_dictionary: Option<DataDictionary>,
}

pub struct AgentService {
    db: Database,
    gate: SafetyGate,
    executor: SqlExecutor,
    pipeline: Arc<SchemaCachePipeline>,
    query_agent: QueryAgent,
    orchestrator: ToolOrchestrator,
}

impl AgentService {
    /// Build against an OpenAI-compatible endpoint described by the config.
    pub fn from_config(config: &AppConfig, retriever: Arc<dyn ExampleRetriever>) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| AgentError::Config("OPENAI_API_KEY is not set".to_string()))?;
        let client = LlmClient::new(api_key, config.model.clone(), config.base_url.clone());
        let store = Arc::new(FsCacheStore::new(&config.cache_dir)?);
        Self::new(config, Arc::new(client), store, retriever)
    }

    /// Build with an explicit Brain, cache backend and example source.
    pub fn new(
        config: &AppConfig,
        brain: Arc<dyn Brain>,
        store: Arc<dyn CacheStore>,
        retriever: Arc<dyn ExampleRetriever>,
    ) -> Result<Self> {
        config.validate()?;

        let db = Database::open(&config.database)?.with_statement_timeout(config.statement_timeout);
        let policy = RetryPolicy {
            max_attempts: config.llm_max_attempts,
            base_delay: Duration::from_secs(1),
            ..RetryPolicy::default()
        };
        let brain: Arc<dyn Brain> = Arc::new(RetryingBrain::new(brain, policy));

        let gate = SafetyGate::new(SafetyPolicy {
            allow_writes: config.allow_writes,
            default_row_limit: config.row_limit,
        });
        let pipeline = Arc::new(SchemaCachePipeline::new(store, brain.clone()).with_sample_rows(config.sample_rows));
        let query_agent = QueryAgent::new(brain.clone(), pipeline.clone(), db.clone(), gate.clone())
            .with_retriever(retriever);
        let orchestrator = ToolOrchestrator::new(
            brain,
            Arc::new(ToolBox::new(db.clone(), gate.clone())),
            OrchestratorConfig {
                max_rounds: config.max_rounds,
                turn_timeout: config.turn_timeout,
                dispatch: DispatchMode::Sequential,
                ..OrchestratorConfig::default()
            },
        );

        info!("Agent service ready for {} ({})", db.identity(), db.path().display());
        Ok(Self {
            executor: SqlExecutor::new(db.clone()),
            db,
            gate,
            pipeline,
            query_agent,
            orchestrator,
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn initialize(&self, force_refresh: bool) -> Result<InitializeResponse> {
        let artifacts = self.pipeline.initialize(&self.db, force_refresh).await?;
        Ok(InitializeResponse {
            database_identity: artifacts.database_identity,
            content_hash: artifacts.content_hash,
            tables: artifacts.raw.tables.len(),
            built_at: artifacts.built_at,
        })
    }

    pub async fn cache_info(&self) -> Result<CacheInfo> {
        self.pipeline.cache_info(&self.db).await
    }

    pub async fn query(&self, text: &str, history: &[(String, String)]) -> Result<QueryAnswer> {
        self.query_agent.answer(text, history, None).await
    }

    /// Run caller-supplied SQL through the gate. `write` is the approval flag.
    pub async fn execute(&self, sql: &str, write: bool) -> Result<ExecuteResponse> {
        let prepared = self.gate.validate_and_prepare(sql, write, None)?;
        let (final_sql, classification, limit_injected) =
            (prepared.sql.clone(), prepared.classification, prepared.limit_injected);
        let outcome = self.executor.run(prepared, None).await?;
        Ok(ExecuteResponse {
            sql: final_sql,
            classification,
            limit_injected,
            outcome,
        })
    }

    pub async fn chat(&self, session: &mut Session, message: &str) -> Result<ChatResponse> {
        let outcome = self.orchestrator.run_turn(session, message).await?;
        Ok(ChatResponse {
            session_id: session.id,
            answer: outcome.answer,
            rounds: outcome.rounds,
            tool_calls: outcome.tool_calls,
        })
    }

    pub async fn purge(&self) -> Result<PurgeResponse> {
        let removed = self.pipeline.purge(&self.db).await?;
        Ok(PurgeResponse {
            database_identity: self.db.identity().to_string(),
            removed,
        })
    }

    /// Table list plus whatever model-derived artifacts are cached for the current content.
    pub async fn database_info(&self) -> Result<DatabaseInfo> {
        let db = self.db.clone();
        let tables = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let conn = db.open_read_only()?;
            introspect::list_tables(&conn)
        })
        .await
        .map_err(|e| AgentError::Database(format!("introspection task failed: {}", e)))??;

        let cached = self.pipeline.cached(&self.db).await?;
        let (structured_schema, data_dictionary) = match cached {
            Some(artifacts) => (Some(artifacts.structured), Some(artifacts.dictionary)),
            None => (None, None),
        };

        Ok(DatabaseInfo {
            database_identity: self.db.identity().to_string(),
            path: self.db.path().display().to_string(),
            tables,
            structured_schema,
            data_dictionary,
        })
    }
}
