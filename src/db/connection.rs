//! Database handle and connection management using rusqlite

use crate::error::{AgentError, Result};
use rusqlite::{Connection, OpenFlags};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// SQLite VM instructions between deadline checks.
const PROGRESS_CHECK_INTERVAL: i32 = 1000;

/// Hex characters of the path digest appended to the file stem.
const IDENTITY_DIGEST_LEN: usize = 8;

/// A database target. Cheap to clone; every operation opens its own connection.
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
    identity: String,
    statement_timeout: Duration,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(AgentError::Database(format!(
                "database file not found: {}",
                path.display()
            )));
        }
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("database");
        // same-named files in different directories must not share cache entries
        let canonical = std::fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
        let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
        let identity = format!("{}-{}", stem, &hex::encode(digest)[..IDENTITY_DIGEST_LEN]);
        Ok(Self {
            path,
            identity,
            statement_timeout: Duration::from_secs(30),
        })
    }

    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stable name of the target, used to key cache entries: file stem plus a
    /// short digest of the canonical path, e.g. `shop-1f2e3d4c`.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn statement_timeout(&self) -> Duration {
        self.statement_timeout
    }

    /// SHA-256 of the database file bytes, hex encoded.
    pub fn content_hash(&self) -> Result<String> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        let mut hasher = Sha256::new();
        std::io::copy(&mut reader, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    }

    pub fn open_read_only(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(conn)
    }

    pub fn open_read_write(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    /// Interrupt whatever runs on `conn` once the statement timeout elapses.
    pub fn arm_deadline(&self, conn: &Connection) {
        let deadline = Instant::now() + self.statement_timeout;
        conn.progress_handler(PROGRESS_CHECK_INTERVAL, Some(move || Instant::now() >= deadline));
    }

    pub fn disarm_deadline(conn: &Connection) {
        conn.progress_handler(0, None::<fn() -> bool>);
    }
}
