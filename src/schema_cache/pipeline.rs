//! Schema Cache Pipeline
//!
//! Three stages, each persisted before the next runs:
//! 1. raw extraction (no model call)
//! 2. structured analysis (model call)
//! 3. data dictionary (model call)
//!
//! The database content hash is the only invalidation signal. Rebuilds are
//! serialised per database identity; readers of a complete cache never wait.

use crate::agent_prompts::{
    build_dictionary_prompt, build_structure_prompt, DATA_DICTIONARY_SYSTEM_PROMPT,
    STRUCTURE_ANALYSIS_SYSTEM_PROMPT,
};
use crate::db::{introspect, Database};
use crate::error::{AgentError, Result};
use crate::llm::{parse_json_reply, Brain, BrainRequest};
use crate::schema_cache::artifacts::{DataDictionary, RawSchema, RawTable, Stage, StructuredSchema};
use crate::schema_cache::store::{CacheEntry, CacheKey, CacheStore, EntryStat};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Complete, validated set of stage outputs for one content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaArtifacts {
    pub database_identity: String,
    pub content_hash: String,
    pub raw: RawSchema,
    pub structured: StructuredSchema,
    pub dictionary: DataDictionary,
    pub built_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheInfo {
    pub database_identity: String,
    pub content_hash: String,
    pub complete: bool,
    pub stages: Vec<EntryStat>,
}

pub struct SchemaCachePipeline {
    store: Arc<dyn CacheStore>,
    brain: Arc<dyn Brain>,
    sample_rows: usize,
    rebuild_locks: DashMap<String, Arc<Mutex<()>>>,
}

fn decode<T: DeserializeOwned>(entry: CacheEntry, stage: Stage) -> Result<T> {
    serde_json::from_value(entry.payload)
        .map_err(|e| AgentError::Cache(format!("Invalid cached {}: {}", stage, e)))
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AgentError::Database(format!("blocking task failed: {}", e)))?
}

/// Stage 1: tables, columns, keys, row counts and a bounded sample per table.
pub fn extract_raw_schema(db: &Database, sample_rows: usize) -> Result<RawSchema> {
    let conn = db.open_read_only()?;
    let mut tables = Vec::new();
    for name in introspect::list_tables(&conn)? {
        let columns = introspect::table_columns(&conn, &name)?;
        let foreign_keys = introspect::foreign_keys(&conn, &name)?;
        let row_count = introspect::row_count(&conn, &name)?;
        let samples = match introspect::sample_rows(&conn, &name, sample_rows) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Could not sample {}: {}", name, e);
                Vec::new()
            }
        };
        tables.push(RawTable {
            name,
            columns,
            foreign_keys,
            row_count,
            samples,
        });
    }
    Ok(RawSchema {
        database_identity: db.identity().to_string(),
        tables,
    })
}

impl SchemaCachePipeline {
    pub fn new(store: Arc<dyn CacheStore>, brain: Arc<dyn Brain>) -> Self {
        Self {
            store,
            brain,
            sample_rows: 5,
            rebuild_locks: DashMap::new(),
        }
    }

    pub fn with_sample_rows(mut self, sample_rows: usize) -> Self {
        self.sample_rows = sample_rows;
        self
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    async fn content_hash(db: &Database) -> Result<String> {
        let db = db.clone();
        blocking(move || db.content_hash()).await
    }

    fn rebuild_lock(&self, identity: &str) -> Arc<Mutex<()>> {
        self.rebuild_locks
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    fn load_stage<T: DeserializeOwned>(&self, identity: &str, hash: &str, stage: Stage) -> Result<Option<T>> {
        let key = CacheKey::new(identity, hash, stage);
        match self.store.get(&key)? {
            Some(entry) => decode(entry, stage).map(Some),
            None => Ok(None),
        }
    }

    /// Complete cached set for this hash, or None. Missing, corrupt or
    /// invalid entries all count as a miss.
    fn load_complete(&self, identity: &str, hash: &str) -> Option<SchemaArtifacts> {
        let attempt = || -> Result<Option<SchemaArtifacts>> {
            let Some(raw) = self.load_stage::<RawSchema>(identity, hash, Stage::RawSchema)? else {
                return Ok(None);
            };
            let Some(structured) = self.load_stage::<StructuredSchema>(identity, hash, Stage::StructuredSchema)? else {
                return Ok(None);
            };
            let dictionary_key = CacheKey::new(identity, hash, Stage::DataDictionary);
            let Some(entry) = self.store.get(&dictionary_key)? else {
                return Ok(None);
            };
            let built_at = entry.created_at;
            let dictionary: DataDictionary = decode(entry, Stage::DataDictionary)?;
            structured.validate_against(&raw)?;
            dictionary.validate_against(&raw)?;
            Ok(Some(SchemaArtifacts {
                database_identity: identity.to_string(),
                content_hash: hash.to_string(),
                raw,
                structured,
                dictionary,
                built_at,
            }))
        };
        match attempt() {
            Ok(found) => found,
            Err(e) => {
                warn!("Ignoring unusable cache for {} ({}): {}", identity, hash, e);
                None
            }
        }
    }

    /// Cached artifacts for the database's current content, without building.
    pub async fn cached(&self, db: &Database) -> Result<Option<SchemaArtifacts>> {
        let hash = Self::content_hash(db).await?;
        Ok(self.load_complete(db.identity(), &hash))
    }

    /// Ensure a complete artifact set exists for the current content hash.
    ///
    /// A complete cache short-circuits with zero model calls unless
    /// `force_refresh` is set. Otherwise all three stages are rebuilt under the
    /// per-identity lock; a caller that waited on the lock re-checks the cache
    /// before building.
    pub async fn initialize(&self, db: &Database, force_refresh: bool) -> Result<SchemaArtifacts> {
        let identity = db.identity().to_string();

        if !force_refresh {
            let hash = Self::content_hash(db).await?;
            if let Some(artifacts) = self.load_complete(&identity, &hash) {
                info!("Schema cache hit for {} ({})", identity, &hash[..hash.len().min(12)]);
                return Ok(artifacts);
            }
        }

        let lock = self.rebuild_lock(&identity);
        let _guard = lock.lock().await;

        let hash = Self::content_hash(db).await?;
        if force_refresh {
            for stage in Stage::ALL {
                self.store.remove(&CacheKey::new(&identity, &hash, stage))?;
            }
        } else if let Some(artifacts) = self.load_complete(&identity, &hash) {
            info!("Schema cache for {} was built while waiting", identity);
            return Ok(artifacts);
        }

        self.build(db, &identity, &hash).await
    }

    async fn build(&self, db: &Database, identity: &str, hash: &str) -> Result<SchemaArtifacts> {
        info!("🔨 Building schema cache for {} ({})", identity, &hash[..hash.len().min(12)]);

        // Stage 1
        let sample_rows = self.sample_rows;
        let db_for_extract = db.clone();
        let raw = blocking(move || extract_raw_schema(&db_for_extract, sample_rows)).await?;
        self.persist(identity, hash, Stage::RawSchema, &raw)?;
        info!("  Stage 1: extracted {} tables", raw.tables.len());

        // Stage 2
        let request = BrainRequest::prompt(build_structure_prompt(&raw))
            .with_system(STRUCTURE_ANALYSIS_SYSTEM_PROMPT)
            .with_temperature(0.1)
            .with_max_tokens(4000);
        let reply = self.brain.complete(&request).await?;
        let structured: StructuredSchema = parse_json_reply(&reply)
            .map_err(|e| AgentError::Cache(format!("structured analysis unusable: {}", e)))?;
        structured.validate_against(&raw)?;
        self.persist(identity, hash, Stage::StructuredSchema, &structured)?;
        info!("  Stage 2: analysed {} tables, {} relationships", structured.tables.len(), structured.relationships.len());

        // Stage 3
        let request = BrainRequest::prompt(build_dictionary_prompt(&raw, &structured))
            .with_system(DATA_DICTIONARY_SYSTEM_PROMPT)
            .with_temperature(0.1)
            .with_max_tokens(4000);
        let reply = self.brain.complete(&request).await?;
        let dictionary: DataDictionary = parse_json_reply(&reply)
            .map_err(|e| AgentError::Cache(format!("data dictionary unusable: {}", e)))?;
        dictionary.validate_against(&raw)?;
        let built_at = self.persist(identity, hash, Stage::DataDictionary, &dictionary)?;
        info!("  Stage 3: documented {} tables", dictionary.tables.len());

        Ok(SchemaArtifacts {
            database_identity: identity.to_string(),
            content_hash: hash.to_string(),
            raw,
            structured,
            dictionary,
            built_at,
        })
    }

    fn persist<T: Serialize>(&self, identity: &str, hash: &str, stage: Stage, value: &T) -> Result<DateTime<Utc>> {
        let entry = CacheEntry::new(serde_json::to_value(value)?);
        self.store.put(&CacheKey::new(identity, hash, stage), &entry)?;
        Ok(entry.created_at)
    }

    /// Current hash plus per-stage presence, size and timestamp. Takes no lock.
    pub async fn cache_info(&self, db: &Database) -> Result<CacheInfo> {
        let hash = Self::content_hash(db).await?;
        let stages = Stage::ALL
            .into_iter()
            .map(|stage| self.store.stat(&CacheKey::new(db.identity(), &hash, stage)))
            .collect::<Result<Vec<_>>>()?;
        Ok(CacheInfo {
            database_identity: db.identity().to_string(),
            complete: stages.iter().all(|s| s.present),
            content_hash: hash,
            stages,
        })
    }

    /// Delete every cached entry for the database, across all hashes.
    pub async fn purge(&self, db: &Database) -> Result<usize> {
        let lock = self.rebuild_lock(db.identity());
        let _guard = lock.lock().await;
        let removed = self.store.purge(db.identity())?;
        info!("Purged {} cache entries for {}", removed, db.identity());
        Ok(removed)
    }
}
