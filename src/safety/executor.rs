//! Statement execution
//!
//! Reads run on a read-only connection and are cut off at the row limit while
//! fetching. Writes run in their own transaction and roll back on any failure.

use crate::db::values::{row_to_map, BoundParams};
use crate::db::Database;
use crate::error::{AgentError, Result};
use crate::safety::{Classification, PreparedStatement};
use rusqlite::types::{ToSql, Value as SqlValue};
use rusqlite::{params_from_iter, Connection, ErrorCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecutionOutcome {
    Rows {
        columns: Vec<String>,
        rows: Vec<Map<String, Value>>,
        /// More rows were available than the row limit allowed.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        truncated: bool,
    },
    Affected {
        rowcount: usize,
    },
}

impl ExecutionOutcome {
    pub fn row_count(&self) -> usize {
        match self {
            ExecutionOutcome::Rows { rows, .. } => rows.len(),
            ExecutionOutcome::Affected { rowcount } => *rowcount,
        }
    }
}

fn named_refs(pairs: &[(String, SqlValue)]) -> Vec<(&str, &dyn ToSql)> {
    pairs
        .iter()
        .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
        .collect()
}

#[derive(Debug, Clone)]
pub struct SqlExecutor {
    db: Database,
}

impl SqlExecutor {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn execution_error(&self, err: rusqlite::Error) -> AgentError {
        if err.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) {
            AgentError::Execution(format!(
                "statement exceeded timeout of {:?}",
                self.db.statement_timeout()
            ))
        } else {
            AgentError::Execution(err.to_string())
        }
    }

    /// Run a prepared statement on the calling thread.
    pub fn execute(&self, prepared: &PreparedStatement, params: Option<&Value>) -> Result<ExecutionOutcome> {
        let bound = BoundParams::from_json(params)?;
        match prepared.classification {
            Classification::ReadOnly => self.execute_read(prepared, &bound),
            Classification::Write => self.execute_write(prepared, &bound),
        }
    }

    /// Run a prepared statement on the blocking pool.
    pub async fn run(&self, prepared: PreparedStatement, params: Option<Value>) -> Result<ExecutionOutcome> {
        let executor = self.clone();
        tokio::task::spawn_blocking(move || executor.execute(&prepared, params.as_ref()))
            .await
            .map_err(|e| AgentError::Execution(format!("execution task failed: {}", e)))?
    }

    fn execute_read(&self, prepared: &PreparedStatement, bound: &BoundParams) -> Result<ExecutionOutcome> {
        let conn = self.db.open_read_only()?;
        self.db.arm_deadline(&conn);

        let mut stmt = conn.prepare(&prepared.sql).map_err(|e| self.execution_error(e))?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let mut rows = match bound {
            BoundParams::None => stmt.query([]),
            BoundParams::Named(pairs) => {
                let refs = named_refs(pairs);
                stmt.query(refs.as_slice())
            }
            BoundParams::Positional(values) => stmt.query(params_from_iter(values.iter())),
        }
        .map_err(|e| self.execution_error(e))?;

        let mut out = Vec::new();
        let mut truncated = false;
        while let Some(row) = rows.next().map_err(|e| self.execution_error(e))? {
            if out.len() >= prepared.row_limit {
                truncated = true;
                break;
            }
            out.push(row_to_map(row, &columns)?);
        }

        debug!("Read returned {} rows (truncated: {})", out.len(), truncated);
        Ok(ExecutionOutcome::Rows {
            columns,
            rows: out,
            truncated,
        })
    }

    fn execute_write(&self, prepared: &PreparedStatement, bound: &BoundParams) -> Result<ExecutionOutcome> {
        let mut conn = self.db.open_read_write()?;
        self.db.arm_deadline(&conn);

        let tx = conn.transaction()?;
        match self.apply_write(&tx, prepared, bound) {
            Ok(outcome) => {
                tx.commit().map_err(|e| self.execution_error(e))?;
                info!("Write committed ({} rows)", outcome.row_count());
                Ok(outcome)
            }
            Err(err) => {
                // the deadline may already have passed; rollback must not be interrupted
                Database::disarm_deadline(&tx);
                if let Err(rollback_err) = tx.rollback() {
                    warn!("Rollback failed: {}", rollback_err);
                }
                warn!("Write rolled back: {}", err);
                Err(err)
            }
        }
    }

    /// Run a write inside the caller's transaction. Statements that return rows
    /// (`RETURNING`, PRAGMA) are stepped to completion; rows past the limit are dropped.
    fn apply_write(
        &self,
        conn: &Connection,
        prepared: &PreparedStatement,
        bound: &BoundParams,
    ) -> Result<ExecutionOutcome> {
        let mut stmt = conn.prepare(&prepared.sql).map_err(|e| self.execution_error(e))?;

        if stmt.column_count() == 0 {
            let rowcount = match bound {
                BoundParams::None => stmt.execute([]),
                BoundParams::Named(pairs) => {
                    let refs = named_refs(pairs);
                    stmt.execute(refs.as_slice())
                }
                BoundParams::Positional(values) => stmt.execute(params_from_iter(values.iter())),
            }
            .map_err(|e| self.execution_error(e))?;
            return Ok(ExecutionOutcome::Affected { rowcount });
        }

        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = match bound {
            BoundParams::None => stmt.query([]),
            BoundParams::Named(pairs) => {
                let refs = named_refs(pairs);
                stmt.query(refs.as_slice())
            }
            BoundParams::Positional(values) => stmt.query(params_from_iter(values.iter())),
        }
        .map_err(|e| self.execution_error(e))?;

        let mut out = Vec::new();
        let mut truncated = false;
        while let Some(row) = rows.next().map_err(|e| self.execution_error(e))? {
            if out.len() >= prepared.row_limit {
                truncated = true;
                continue;
            }
            out.push(row_to_map(row, &columns)?);
        }
        Ok(ExecutionOutcome::Rows {
            columns,
            rows: out,
            truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::SafetyGate;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fixture(dir: &TempDir, customers: usize) -> Database {
        let path = dir.path().join("shop.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL, tier TEXT);
             CREATE TABLE audit (id INTEGER PRIMARY KEY, note TEXT);",
        )
        .unwrap();
        for i in 0..customers {
            conn.execute(
                "INSERT INTO customers (name, tier) VALUES (?1, ?2)",
                rusqlite::params![format!("customer {}", i), if i % 2 == 0 { "gold" } else { "basic" }],
            )
            .unwrap();
        }
        Database::open(&path).unwrap()
    }

    #[test]
    fn test_unbounded_select_returns_at_most_row_limit() {
        let dir = TempDir::new().unwrap();
        let db = fixture(&dir, 250);
        let executor = SqlExecutor::new(db);
        let prepared = SafetyGate::default()
            .validate_and_prepare("SELECT * FROM customers", false, Some(200))
            .unwrap();
        assert!(prepared.sql.ends_with("LIMIT 200"));

        let outcome = executor.execute(&prepared, None).unwrap();
        match outcome {
            ExecutionOutcome::Rows { columns, rows, truncated } => {
                assert_eq!(columns, vec!["id", "name", "tier"]);
                assert_eq!(rows.len(), 200);
                assert!(!truncated);
            }
            other => panic!("expected rows, got {:?}", other),
        }
    }

    #[test]
    fn test_fetch_layer_caps_explicit_large_limit() {
        let dir = TempDir::new().unwrap();
        let executor = SqlExecutor::new(fixture(&dir, 30));
        let prepared = SafetyGate::default()
            .validate_and_prepare("SELECT id FROM customers LIMIT 1000", false, Some(10))
            .unwrap();
        let outcome = executor.execute(&prepared, None).unwrap();
        assert_eq!(outcome.row_count(), 10);
        assert!(matches!(outcome, ExecutionOutcome::Rows { truncated: true, .. }));
    }

    #[test]
    fn test_named_params() {
        let dir = TempDir::new().unwrap();
        let executor = SqlExecutor::new(fixture(&dir, 10));
        let prepared = SafetyGate::default()
            .validate_and_prepare("SELECT name FROM customers WHERE tier = :tier", false, None)
            .unwrap();
        let outcome = executor.execute(&prepared, Some(&json!({"tier": "gold"}))).unwrap();
        assert_eq!(outcome.row_count(), 5);
    }

    #[test]
    fn test_approved_write_commits() {
        let dir = TempDir::new().unwrap();
        let db = fixture(&dir, 4);
        let executor = SqlExecutor::new(db.clone());
        let prepared = SafetyGate::default()
            .validate_and_prepare("UPDATE customers SET tier = 'platinum' WHERE tier = 'gold'", true, None)
            .unwrap();
        let outcome = executor.execute(&prepared, None).unwrap();
        assert_eq!(outcome, ExecutionOutcome::Affected { rowcount: 2 });

        let conn = db.open_read_only().unwrap();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM customers WHERE tier = 'platinum'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn test_row_returning_writes() {
        let dir = TempDir::new().unwrap();
        let db = fixture(&dir, 2);
        let executor = SqlExecutor::new(db.clone());
        let gate = SafetyGate::default();

        let prepared = gate
            .validate_and_prepare("INSERT INTO audit (note) VALUES ('a'), ('b') RETURNING id, note", true, Some(1))
            .unwrap();
        match executor.execute(&prepared, None).unwrap() {
            ExecutionOutcome::Rows { columns, rows, truncated } => {
                assert_eq!(columns, vec!["id", "note"]);
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0]["note"], "a");
                assert!(truncated);
            }
            other => panic!("expected rows, got {:?}", other),
        }
        // both inserts committed even though only one row was reported
        let conn = db.open_read_only().unwrap();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM audit", [], |r| r.get(0)).unwrap();
        assert_eq!(n, 2);

        let prepared = gate.validate_and_prepare("PRAGMA table_info(customers)", true, None).unwrap();
        assert_eq!(prepared.classification, Classification::Write);
        assert_eq!(executor.execute(&prepared, None).unwrap().row_count(), 3);
    }

    #[test]
    fn test_failing_write_rolls_back() {
        let dir = TempDir::new().unwrap();
        let db = fixture(&dir, 3);
        {
            let conn = db.open_read_write().unwrap();
            // audit row is written first, then the trigger aborts the statement
            conn.execute_batch(
                "CREATE TRIGGER guard BEFORE UPDATE ON customers
                 BEGIN
                   INSERT INTO audit (note) VALUES ('attempted');
                   SELECT RAISE(ABORT, 'customers are immutable');
                 END;",
            )
            .unwrap();
        }
        let executor = SqlExecutor::new(db.clone());
        let prepared = SafetyGate::default()
            .validate_and_prepare("UPDATE customers SET name = 'x'", true, None)
            .unwrap();

        let err = executor.execute(&prepared, None).unwrap_err();
        match err {
            AgentError::Execution(msg) => assert!(msg.contains("customers are immutable")),
            other => panic!("expected execution error, got {:?}", other),
        }

        let conn = db.open_read_only().unwrap();
        let audit: i64 = conn.query_row("SELECT COUNT(*) FROM audit", [], |r| r.get(0)).unwrap();
        let renamed: i64 = conn
            .query_row("SELECT COUNT(*) FROM customers WHERE name = 'x'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(audit, 0);
        assert_eq!(renamed, 0);
    }

    #[test]
    fn test_runaway_read_is_interrupted() {
        let dir = TempDir::new().unwrap();
        let db = fixture(&dir, 1).with_statement_timeout(Duration::from_millis(50));
        let executor = SqlExecutor::new(db);
        let prepared = SafetyGate::default()
            .validate_and_prepare(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT COUNT(*) FROM c",
                false,
                None,
            )
            .unwrap();
        let err = executor.execute(&prepared, None).unwrap_err();
        assert!(err.to_string().contains("timeout"), "{}", err);
    }

    #[tokio::test]
    async fn test_run_on_blocking_pool() {
        let dir = TempDir::new().unwrap();
        let executor = SqlExecutor::new(fixture(&dir, 3));
        let prepared = SafetyGate::default()
            .validate_and_prepare("SELECT COUNT(*) AS n FROM customers", false, None)
            .unwrap();
        let outcome = executor.run(prepared, None).await.unwrap();
        match outcome {
            ExecutionOutcome::Rows { rows, .. } => assert_eq!(rows[0]["n"], 3),
            other => panic!("expected rows, got {:?}", other),
        }
    }
}
