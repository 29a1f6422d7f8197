//! Query Agent
//!
//! Single-shot question answering: cached schema context in, one generated
//! statement through the safety gate, rows and an optional explanation out.

use crate::agent::retriever::{Example, ExampleRetriever, NoExamples};
use crate::agent_prompts::{
    build_explanation_prompt, build_sql_prompt, clean_sql, EXPLANATION_SYSTEM_PROMPT,
    SQL_GENERATION_SYSTEM_PROMPT,
};
use crate::db::Database;
use crate::error::Result;
use crate::llm::{Brain, BrainRequest};
use crate::safety::{ExecutionOutcome, SafetyGate, SqlExecutor};
use crate::schema_cache::SchemaCachePipeline;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAnswer {
    pub sql: String,
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
    #[serde(default)]
    pub truncated: bool,
    pub explanation: Option<String>,
}

pub struct QueryAgent {
    brain: Arc<dyn Brain>,
    pipeline: Arc<SchemaCachePipeline>,
    db: Database,
    gate: SafetyGate,
    executor: SqlExecutor,
    retriever: Arc<dyn ExampleRetriever>,
    row_limit: usize,
    /// How many past exchanges are folded into the prompt.
    history_window: usize,
    example_count: usize,
    explain: bool,
}

impl QueryAgent {
    pub fn new(brain: Arc<dyn Brain>, pipeline: Arc<SchemaCachePipeline>, db: Database, gate: SafetyGate) -> Self {
        let row_limit = gate.policy().default_row_limit;
        Self {
            brain,
            pipeline,
            executor: SqlExecutor::new(db.clone()),
            db,
            gate,
            retriever: Arc::new(NoExamples),
            row_limit,
            history_window: 3,
            example_count: 3,
            explain: true,
        }
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn ExampleRetriever>) -> Self {
        self.retriever = retriever;
        self
    }

    pub fn with_explanations(mut self, explain: bool) -> Self {
        self.explain = explain;
        self
    }

    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window;
        self
    }

    async fn examples_for(&self, user_query: &str, supplied: Option<&[Example]>) -> Vec<Example> {
        if let Some(examples) = supplied {
            return examples.to_vec();
        }
        match self.retriever.retrieve(user_query, self.example_count).await {
            Ok(examples) => examples,
            Err(e) => {
                warn!("Example retrieval failed, continuing without examples: {}", e);
                Vec::new()
            }
        }
    }

    /// Answer a question with one read-only statement.
    ///
    /// Safety and execution failures are returned as errors. A failed
    /// explanation only leaves `explanation` empty.
    pub async fn answer(
        &self,
        user_query: &str,
        history: &[(String, String)],
        examples: Option<&[Example]>,
    ) -> Result<QueryAnswer> {
        let artifacts = self.pipeline.initialize(&self.db, false).await?;
        let examples = self.examples_for(user_query, examples).await;
        let recent = &history[history.len().saturating_sub(self.history_window)..];

        let prompt = build_sql_prompt(
            user_query,
            &artifacts.raw,
            &artifacts.structured,
            &artifacts.dictionary,
            &examples,
            recent,
        );
        let request = BrainRequest::prompt(prompt)
            .with_system(SQL_GENERATION_SYSTEM_PROMPT)
            .with_temperature(0.0)
            .with_max_tokens(800);
        let sql = clean_sql(&self.brain.complete(&request).await?);
        info!("Generated SQL: {}", sql);

        let prepared = self.gate.validate_and_prepare(&sql, false, Some(self.row_limit))?;
        let final_sql = prepared.sql.clone();
        let (columns, rows, truncated) = match self.executor.run(prepared, None).await? {
            ExecutionOutcome::Rows { columns, rows, truncated } => (columns, rows, truncated),
            ExecutionOutcome::Affected { .. } => (Vec::new(), Vec::new(), false),
        };

        let explanation = if self.explain {
            self.explain_result(user_query, &final_sql, &columns, &rows).await
        } else {
            None
        };

        Ok(QueryAnswer {
            sql: final_sql,
            columns,
            rows,
            truncated,
            explanation,
        })
    }

    async fn explain_result(
        &self,
        question: &str,
        sql: &str,
        columns: &[String],
        rows: &[Map<String, Value>],
    ) -> Option<String> {
        let request = BrainRequest::prompt(build_explanation_prompt(question, sql, columns, rows))
            .with_system(EXPLANATION_SYSTEM_PROMPT)
            .with_max_tokens(400);
        match self.brain.complete(&request).await {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("Explanation failed: {}", e);
                None
            }
        }
    }
}
