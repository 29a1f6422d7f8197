//! Example retrieval for few-shot SQL generation

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A previously answered question with the SQL that answered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    pub question: String,
    pub sql: String,
}

#[async_trait]
pub trait ExampleRetriever: Send + Sync {
    /// Up to `k` examples relevant to the query, best first.
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<Example>>;
}

/// Retriever that never has anything to offer.
pub struct NoExamples;

#[async_trait]
impl ExampleRetriever for NoExamples {
    async fn retrieve(&self, _query: &str, _k: usize) -> Result<Vec<Example>> {
        Ok(Vec::new())
    }
}

/// In-memory examples ranked by word overlap with the query.
pub struct KeywordRetriever {
    examples: Vec<Example>,
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(|w| w.to_lowercase())
        .collect()
}

impl KeywordRetriever {
    pub fn new(examples: Vec<Example>) -> Self {
        Self { examples }
    }

    /// Load a JSON array of `{question, sql}` objects.
    pub fn from_json_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let examples: Vec<Example> = serde_json::from_str(&content)?;
        Ok(Self::new(examples))
    }
}

#[async_trait]
impl ExampleRetriever for KeywordRetriever {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<Example>> {
        let query_words = words(query);
        let mut scored: Vec<(usize, &Example)> = self
            .examples
            .iter()
            .map(|ex| (words(&ex.question).intersection(&query_words).count(), ex))
            .filter(|(score, _)| *score > 0)
            .collect();
        // stable sort keeps file order among ties
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored.into_iter().take(k).map(|(_, ex)| ex.clone()).collect())
    }
}
