//! Tool catalog and dispatch
//!
//! The catalog is closed: `get_schema`, `run_sql` and `sample_rows`. Every call
//! produces exactly one ToolResult; failures come back as error results the
//! model can read, never as a raised error.

use crate::conversation::{ToolCallRequest, ToolErrorKind, ToolFailure, ToolOutcome, ToolResult};
use crate::db::{introspect, Database};
use crate::error::{AgentError, Result};
use crate::llm::ToolSpec;
use crate::safety::{SafetyGate, SqlExecutor};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    GetSchema,
    RunSql,
    SampleRows,
}

impl ToolName {
    pub const ALL: [ToolName; 3] = [ToolName::GetSchema, ToolName::RunSql, ToolName::SampleRows];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::GetSchema => "get_schema",
            ToolName::RunSql => "run_sql",
            ToolName::SampleRows => "sample_rows",
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        ToolName::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| AgentError::UnknownTool(s.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GetSchemaArgs {
    #[serde(default)]
    pub include_counts: bool,
    #[serde(default)]
    pub tables: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunSqlArgs {
    pub sql: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub write: bool,
    #[serde(default)]
    pub row_limit: Option<usize>,
}

fn default_sample_limit() -> usize {
    50
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SampleRowsArgs {
    pub table: String,
    #[serde(default = "default_sample_limit")]
    pub limit: usize,
}

/// Tool declarations sent to the model.
pub fn catalog() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: ToolName::GetSchema.to_string(),
            description: "Return tables with their columns and types, optionally with row counts.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "include_counts": {"type": "boolean", "description": "Include row counts per table"},
                    "tables": {"type": "array", "items": {"type": "string"}, "description": "Restrict to these tables"}
                },
                "additionalProperties": false
            }),
        },
        ToolSpec {
            name: ToolName::RunSql.to_string(),
            description: "Run one SQL statement. Reads are limited automatically. Writes require write=true and may be refused by policy.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "sql": {"type": "string"},
                    "params": {"type": "object", "description": "Named parameters, e.g. {\"tier\": \"gold\"} for :tier"},
                    "write": {"type": "boolean", "default": false},
                    "row_limit": {"type": "integer", "minimum": 1, "default": 200}
                },
                "required": ["sql"],
                "additionalProperties": false
            }),
        },
        ToolSpec {
            name: ToolName::SampleRows.to_string(),
            description: "Return the first rows of a table.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "table": {"type": "string"},
                    "limit": {"type": "integer", "minimum": 1, "default": 50}
                },
                "required": ["table"],
                "additionalProperties": false
            }),
        },
    ]
}

fn parse_args<T: DeserializeOwned>(tool: ToolName, input: &Value) -> Result<T> {
    // a missing input object means "all defaults"
    let input = if input.is_null() { json!({}) } else { input.clone() };
    if !input.is_object() {
        return Err(AgentError::InvalidToolInput {
            tool: tool.to_string(),
            message: format!("expected a JSON object, got {}", input),
        });
    }
    serde_json::from_value(input).map_err(|e| AgentError::InvalidToolInput {
        tool: tool.to_string(),
        message: e.to_string(),
    })
}

/// Turn a handler error into the error result the model sees.
fn failure_result(id: &str, err: AgentError) -> ToolResult {
    let (kind, detail) = match &err {
        AgentError::Safety(violation) => (ToolErrorKind::SafetyViolation, serde_json::to_value(violation).ok()),
        AgentError::UnknownTool(_) => (ToolErrorKind::UnknownTool, None),
        AgentError::InvalidToolInput { .. } => (ToolErrorKind::InvalidInput, None),
        AgentError::Execution(_) | AgentError::Database(_) => (ToolErrorKind::ExecutionError, None),
        _ => (ToolErrorKind::HandlerError, None),
    };
    ToolResult {
        id: id.to_string(),
        outcome: ToolOutcome::Error(ToolFailure {
            kind,
            message: err.to_string(),
            detail,
        }),
    }
}

/// Handlers for the tool catalog, bound to one database.
#[derive(Debug, Clone)]
pub struct ToolBox {
    db: Database,
    gate: SafetyGate,
    executor: SqlExecutor,
}

impl ToolBox {
    pub fn new(db: Database, gate: SafetyGate) -> Self {
        let executor = SqlExecutor::new(db.clone());
        Self { db, gate, executor }
    }

    /// Execute one call. Always returns a result carrying the request's id.
    pub async fn dispatch(&self, call: &ToolCallRequest) -> ToolResult {
        let tool = match call.name.parse::<ToolName>() {
            Ok(tool) => tool,
            Err(e) => {
                warn!("Model requested unknown tool '{}'", call.name);
                return failure_result(&call.id, e);
            }
        };

        info!("🔧 Tool call {} ({})", tool, call.id);
        let outcome = match tool {
            ToolName::GetSchema => match parse_args::<GetSchemaArgs>(tool, &call.input) {
                Ok(args) => self.get_schema(args).await,
                Err(e) => Err(e),
            },
            ToolName::RunSql => match parse_args::<RunSqlArgs>(tool, &call.input) {
                Ok(args) => self.run_sql(args).await,
                Err(e) => Err(e),
            },
            ToolName::SampleRows => match parse_args::<SampleRowsArgs>(tool, &call.input) {
                Ok(args) => self.sample_rows(args).await,
                Err(e) => Err(e),
            },
        };

        match outcome {
            Ok(payload) => ToolResult::payload(call.id.clone(), payload),
            Err(e) => {
                warn!("Tool {} failed: {}", tool, e);
                failure_result(&call.id, e)
            }
        }
    }

    async fn get_schema(&self, args: GetSchemaArgs) -> Result<Value> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<Value> {
            let conn = db.open_read_only()?;
            let all = introspect::list_tables(&conn)?;
            let selected: Vec<String> = match &args.tables {
                Some(wanted) => {
                    let unknown: Vec<&String> = wanted
                        .iter()
                        .filter(|w| !all.iter().any(|t| t.eq_ignore_ascii_case(w)))
                        .collect();
                    if !unknown.is_empty() {
                        return Err(AgentError::InvalidToolInput {
                            tool: ToolName::GetSchema.to_string(),
                            message: format!("unknown tables: {:?}", unknown),
                        });
                    }
                    all.into_iter()
                        .filter(|t| wanted.iter().any(|w| w.eq_ignore_ascii_case(t)))
                        .collect()
                }
                None => all,
            };

            let mut tables = Map::new();
            for name in selected {
                let columns = introspect::table_columns(&conn, &name)?;
                let mut entry = json!({ "columns": columns });
                if args.include_counts {
                    entry["row_count"] = json!(introspect::row_count(&conn, &name)?);
                }
                tables.insert(name, entry);
            }
            Ok(json!({ "tables": tables }))
        })
        .await
        .map_err(|e| AgentError::Execution(format!("schema task failed: {}", e)))?
    }

    async fn run_sql(&self, args: RunSqlArgs) -> Result<Value> {
        if args.row_limit == Some(0) {
            return Err(AgentError::InvalidToolInput {
                tool: ToolName::RunSql.to_string(),
                message: "row_limit must be at least 1".to_string(),
            });
        }
        let prepared = self.gate.validate_and_prepare(&args.sql, args.write, args.row_limit)?;
        let outcome = self.executor.run(prepared, args.params).await?;
        Ok(serde_json::to_value(outcome)?)
    }

    /// Bounded `SELECT *`, routed through the same gate as `run_sql`.
    async fn sample_rows(&self, args: SampleRowsArgs) -> Result<Value> {
        if args.limit == 0 {
            return Err(AgentError::InvalidToolInput {
                tool: ToolName::SampleRows.to_string(),
                message: "limit must be at least 1".to_string(),
            });
        }
        let sql = format!("SELECT * FROM {} LIMIT {}", introspect::quote_ident(&args.table), args.limit);
        self.run_sql(RunSqlArgs {
            sql,
            params: None,
            write: false,
            row_limit: Some(args.limit),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SafetyViolation;
    use rusqlite::Connection;
    use tempfile::TempDir;

    fn toolbox(dir: &TempDir) -> ToolBox {
        let path = dir.path().join("shop.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT, tier TEXT);
             CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER, total REAL);
             INSERT INTO customers (name, tier) VALUES ('Ada', 'gold'), ('Linus', 'basic'), ('Grace', 'gold');",
        )
        .unwrap();
        ToolBox::new(Database::open(&path).unwrap(), SafetyGate::default())
    }

    fn call(id: &str, name: &str, input: Value) -> ToolCallRequest {
        ToolCallRequest {
            id: id.to_string(),
            name: name.to_string(),
            input,
        }
    }

    fn failure(result: &ToolResult) -> &ToolFailure {
        match &result.outcome {
            ToolOutcome::Error(f) => f,
            ToolOutcome::Payload(p) => panic!("expected error, got {}", p),
        }
    }

    fn payload(result: &ToolResult) -> &Value {
        match &result.outcome {
            ToolOutcome::Payload(p) => p,
            ToolOutcome::Error(f) => panic!("expected payload, got {:?}", f),
        }
    }

    #[test]
    fn test_tool_names() {
        assert_eq!("run_sql".parse::<ToolName>().unwrap(), ToolName::RunSql);
        assert!(matches!("drop_db".parse::<ToolName>(), Err(AgentError::UnknownTool(_))));
        let names: Vec<String> = catalog().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["get_schema", "run_sql", "sample_rows"]);
    }

    #[tokio::test]
    async fn test_get_schema_with_counts() {
        let dir = TempDir::new().unwrap();
        let tools = toolbox(&dir);
        let result = tools
            .dispatch(&call("c1", "get_schema", json!({"include_counts": true, "tables": ["customers"]})))
            .await;
        assert_eq!(result.id, "c1");
        let tables = &payload(&result)["tables"];
        assert_eq!(tables["customers"]["row_count"], 3);
        assert!(tables.get("orders").is_none());
        assert_eq!(tables["customers"]["columns"][1]["name"], "name");
    }

    #[tokio::test]
    async fn test_get_schema_accepts_missing_input() {
        let dir = TempDir::new().unwrap();
        let result = toolbox(&dir).dispatch(&call("c1", "get_schema", Value::Null)).await;
        let tables = payload(&result)["tables"].as_object().unwrap();
        assert_eq!(tables.len(), 2);
        assert!(tables["orders"].get("row_count").is_none());
    }

    #[tokio::test]
    async fn test_unknown_tool_becomes_error_result() {
        let dir = TempDir::new().unwrap();
        let result = toolbox(&dir).dispatch(&call("c9", "drop_everything", json!({}))).await;
        assert_eq!(result.id, "c9");
        assert_eq!(failure(&result).kind, ToolErrorKind::UnknownTool);
    }

    #[tokio::test]
    async fn test_invalid_input_becomes_error_result() {
        let dir = TempDir::new().unwrap();
        let tools = toolbox(&dir);
        let missing_sql = tools.dispatch(&call("a", "run_sql", json!({"write": false}))).await;
        assert_eq!(failure(&missing_sql).kind, ToolErrorKind::InvalidInput);

        let not_object = tools.dispatch(&call("b", "sample_rows", Value::String("customers".into()))).await;
        assert_eq!(failure(&not_object).kind, ToolErrorKind::InvalidInput);

        let extra_field = tools
            .dispatch(&call("c", "run_sql", json!({"sql": "SELECT 1", "dangerous": true})))
            .await;
        assert_eq!(failure(&extra_field).kind, ToolErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_run_sql_write_without_approval_is_reported() {
        let dir = TempDir::new().unwrap();
        let result = toolbox(&dir)
            .dispatch(&call("w", "run_sql", json!({"sql": "DROP TABLE customers"})))
            .await;
        let f = failure(&result);
        assert_eq!(f.kind, ToolErrorKind::SafetyViolation);
        assert!(f.message.contains("write without approval"));
        let violation: SafetyViolation = serde_json::from_value(f.detail.clone().unwrap()).unwrap();
        assert!(matches!(violation, SafetyViolation::WriteWithoutApproval { .. }));
    }

    #[tokio::test]
    async fn test_run_sql_read_and_write() {
        let dir = TempDir::new().unwrap();
        let tools = toolbox(&dir);

        let read = tools
            .dispatch(&call("r", "run_sql", json!({"sql": "SELECT name FROM customers WHERE tier = :tier", "params": {"tier": "gold"}})))
            .await;
        let p = payload(&read);
        assert_eq!(p["columns"], json!(["name"]));
        assert_eq!(p["rows"].as_array().unwrap().len(), 2);

        let write = tools
            .dispatch(&call("w", "run_sql", json!({"sql": "UPDATE customers SET tier = 'basic'", "write": true})))
            .await;
        assert_eq!(payload(&write)["rowcount"], 3);
    }

    #[tokio::test]
    async fn test_sample_rows_is_bounded() {
        let dir = TempDir::new().unwrap();
        let result = toolbox(&dir)
            .dispatch(&call("s", "sample_rows", json!({"table": "customers", "limit": 2})))
            .await;
        assert_eq!(payload(&result)["rows"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sample_rows_missing_table_is_execution_error() {
        let dir = TempDir::new().unwrap();
        let result = toolbox(&dir)
            .dispatch(&call("s", "sample_rows", json!({"table": "nope"})))
            .await;
        assert_eq!(failure(&result).kind, ToolErrorKind::ExecutionError);
    }
}
