//! Cache storage backends
//!
//! Entries are keyed by (database identity, content hash, stage). The
//! filesystem backend writes one `{identity}_{hash}_{stage}.json` file per entry.

use crate::error::{AgentError, Result};
use crate::schema_cache::artifacts::Stage;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub database_identity: String,
    pub content_hash: String,
    pub stage: Stage,
}

impl CacheKey {
    pub fn new(database_identity: impl Into<String>, content_hash: impl Into<String>, stage: Stage) -> Self {
        Self {
            database_identity: database_identity.into(),
            content_hash: content_hash.into(),
            stage,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}_{}_{}.json", self.database_identity, self.content_hash, self.stage)
    }

    /// Inverse of `file_name`. Identities may contain underscores; hash and stage may not.
    pub fn parse_file_name(name: &str) -> Option<CacheKey> {
        let stem = name.strip_suffix(".json")?;
        let stage = Stage::ALL
            .into_iter()
            .find(|s| stem.ends_with(&format!("_{}", s.as_str())))?;
        let rest = &stem[..stem.len() - stage.as_str().len() - 1];
        let (identity, hash) = rest.rsplit_once('_')?;
        if identity.is_empty() || hash.is_empty() {
            return None;
        }
        Some(CacheKey::new(identity, hash, stage))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub created_at: DateTime<Utc>,
    pub payload: Value,
}

impl CacheEntry {
    pub fn new(payload: Value) -> Self {
        Self {
            created_at: Utc::now(),
            payload,
        }
    }
}

/// Presence, size and age of one stored entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryStat {
    pub stage: Stage,
    pub present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl EntryStat {
    pub fn missing(stage: Stage) -> Self {
        Self {
            stage,
            present: false,
            size_bytes: None,
            created_at: None,
        }
    }
}

pub trait CacheStore: Send + Sync {
    /// Unreadable or corrupt entries are reported as `AgentError::Cache`.
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;

    fn put(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()>;

    fn remove(&self, key: &CacheKey) -> Result<bool>;

    fn stat(&self, key: &CacheKey) -> Result<EntryStat>;

    /// Delete every entry for the identity, whatever its hash. Returns the count removed.
    fn purge(&self, database_identity: &str) -> Result<usize>;
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

pub struct FsCacheStore {
    dir: PathBuf,
}

impl FsCacheStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| AgentError::Cache(format!("Failed to create cache dir {}: {}", dir.display(), e)))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.file_name())
    }
}

impl CacheStore for FsCacheStore {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| AgentError::Cache(format!("Failed to read {}: {}", path.display(), e)))?;
        let entry = serde_json::from_str(&content)
            .map_err(|e| AgentError::Cache(format!("Corrupt cache entry {}: {}", path.display(), e)))?;
        Ok(Some(entry))
    }

    fn put(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
        let path = self.path_for(key);
        let tmp = self.dir.join(format!(".{}.{}.tmp", key.file_name(), Uuid::new_v4()));
        let json = serde_json::to_string_pretty(entry)?;
        fs::write(&tmp, json)
            .map_err(|e| AgentError::Cache(format!("Failed to write {}: {}", tmp.display(), e)))?;
        // rename is atomic within a directory, so readers never see a partial file
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            AgentError::Cache(format!("Failed to move cache entry into {}: {}", path.display(), e))
        })?;
        debug!("Cached {}", path.display());
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> Result<bool> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AgentError::Cache(format!("Failed to remove {}: {}", path.display(), e))),
        }
    }

    fn stat(&self, key: &CacheKey) -> Result<EntryStat> {
        let path = self.path_for(key);
        let metadata = match fs::metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(EntryStat::missing(key.stage)),
            Err(e) => return Err(AgentError::Cache(format!("Failed to stat {}: {}", path.display(), e))),
        };
        // timestamp comes from the entry itself so both backends report the same value
        let created_at = match self.get(key) {
            Ok(entry) => entry.map(|e| e.created_at),
            Err(e) => {
                debug!("No timestamp for {}: {}", path.display(), e);
                None
            }
        };
        Ok(EntryStat {
            stage: key.stage,
            present: true,
            size_bytes: Some(metadata.len()),
            created_at,
        })
    }

    fn purge(&self, database_identity: &str) -> Result<usize> {
        let mut removed = 0;
        for dir_entry in fs::read_dir(&self.dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            let Some(name) = name.to_str() else { continue };
            match CacheKey::parse_file_name(name) {
                Some(key) if key.database_identity == database_identity => {
                    fs::remove_file(dir_entry.path())?;
                    removed += 1;
                }
                _ => {}
            }
        }
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryCacheStore {
    entries: DashMap<CacheKey, CacheEntry>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Overwrite an entry's payload without validation.
    pub fn insert_raw(&self, key: CacheKey, entry: CacheEntry) {
        self.entries.insert(key, entry);
    }
}

impl CacheStore for InMemoryCacheStore {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    fn put(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
        self.entries.insert(key.clone(), entry.clone());
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    fn stat(&self, key: &CacheKey) -> Result<EntryStat> {
        match self.entries.get(key) {
            Some(entry) => Ok(EntryStat {
                stage: key.stage,
                present: true,
                size_bytes: Some(serde_json::to_vec(entry.value())?.len() as u64),
                created_at: Some(entry.created_at),
            }),
            None => Ok(EntryStat::missing(key.stage)),
        }
    }

    fn purge(&self, database_identity: &str) -> Result<usize> {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.database_identity != database_identity);
        Ok(before - self.entries.len())
    }
}
