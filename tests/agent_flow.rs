use async_trait::async_trait;
use nl2sql_agent::agent::NoExamples;
use nl2sql_agent::agent_prompts::{
    DATA_AGENT_SYSTEM_PROMPT, DATA_DICTIONARY_SYSTEM_PROMPT, EXPLANATION_SYSTEM_PROMPT,
    SQL_GENERATION_SYSTEM_PROMPT, STRUCTURE_ANALYSIS_SYSTEM_PROMPT,
};
use nl2sql_agent::conversation::{ContentBlock, Role, ToolCallRequest, Turn};
use nl2sql_agent::llm::{Brain, BrainRequest};
use nl2sql_agent::safety::{Classification, ExecutionOutcome};
use nl2sql_agent::schema_cache::{FsCacheStore, Stage};
use nl2sql_agent::{AgentError, AgentService, AppConfig, SafetyViolation, Session};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Stand-in model: answers each kind of request the agent makes.
#[derive(Default)]
struct FakeBrain {
    calls: AtomicUsize,
}

impl FakeBrain {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn chat_turn(request: &BrainRequest) -> Turn {
        let last = request.turns.last().expect("conversation is never empty");
        match last.role {
            Role::User => Turn {
                role: Role::Model,
                content: vec![
                    ContentBlock::Text {
                        text: "Checking the schema and counting.".to_string(),
                    },
                    ContentBlock::ToolCallRequest(ToolCallRequest {
                        id: "call_schema".to_string(),
                        name: "get_schema".to_string(),
                        input: json!({"include_counts": true}),
                    }),
                    ContentBlock::ToolCallRequest(ToolCallRequest {
                        id: "call_count".to_string(),
                        name: "run_sql".to_string(),
                        input: json!({"sql": "SELECT COUNT(*) AS n FROM customers WHERE tier = 'gold'"}),
                    }),
                ],
            },
            _ => {
                let count = last
                    .tool_results_iter()
                    .find(|r| r.id == "call_count")
                    .map(|r| r.to_model_json()["rows"][0]["n"].clone())
                    .unwrap_or_default();
                Turn::model_text(format!("There are {} gold customers.", count))
            }
        }
    }
}

#[async_trait]
impl Brain for FakeBrain {
    async fn converse(&self, request: &BrainRequest) -> nl2sql_agent::Result<Turn> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let system = request.system.as_deref().unwrap_or_default();
        let reply = if system == STRUCTURE_ANALYSIS_SYSTEM_PROMPT {
            json!({
                "tables": [
                    {"name": "customers", "purpose": "registered buyers", "columns": [{"name": "tier", "meaning": "loyalty level"}]},
                    {"name": "orders", "purpose": "placed orders"}
                ],
                "relationships": [
                    {"from_table": "orders", "from_column": "customer_id", "to_table": "customers", "to_column": "id"}
                ]
            })
            .to_string()
        } else if system == DATA_DICTIONARY_SYSTEM_PROMPT {
            json!({
                "overview": "Customers and their orders",
                "tables": [{"name": "customers", "columns": [{"name": "tier", "valid_values": ["gold", "basic"]}]}]
            })
            .to_string()
        } else if system == SQL_GENERATION_SYSTEM_PROMPT {
            "SQL Query: SELECT name FROM customers WHERE tier = 'gold';".to_string()
        } else if system == EXPLANATION_SYSTEM_PROMPT {
            "These are the gold customers.".to_string()
        } else if system == DATA_AGENT_SYSTEM_PROMPT {
            return Ok(Self::chat_turn(request));
        } else {
            return Err(AgentError::LlmResponse(format!("unexpected system prompt: {}", system)));
        };
        Ok(Turn::model_text(reply))
    }
}

fn create_shop(path: &Path, customers: usize) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL, tier TEXT NOT NULL);
         CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER REFERENCES customers(id), total REAL);
         CREATE TRIGGER freeze_names BEFORE UPDATE OF name ON customers
         BEGIN
           SELECT RAISE(ABORT, 'names are frozen');
         END;",
    )
    .unwrap();
    for i in 0..customers {
        let tier = if i % 5 == 0 { "gold" } else { "basic" };
        conn.execute(
            "INSERT INTO customers (name, tier) VALUES (?1, ?2)",
            rusqlite::params![format!("customer {}", i), tier],
        )
        .unwrap();
    }
    conn.execute("INSERT INTO orders (customer_id, total) VALUES (1, 10.0)", []).unwrap();
}

struct Harness {
    dir: TempDir,
    brain: Arc<FakeBrain>,
    service: AgentService,
}

fn harness_with(customers: usize, allow_writes: bool) -> Harness {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("shop.db");
    create_shop(&db_path, customers);

    let config = AppConfig {
        database: db_path,
        cache_dir: dir.path().join("cache"),
        allow_writes,
        ..AppConfig::default()
    };
    let brain = Arc::new(FakeBrain::default());
    let store = Arc::new(FsCacheStore::new(&config.cache_dir).unwrap());
    let service = AgentService::new(&config, brain.clone(), store, Arc::new(NoExamples)).unwrap();
    Harness { dir, brain, service }
}

fn harness(customers: usize) -> Harness {
    harness_with(customers, true)
}

#[tokio::test]
async fn initialize_is_cached_per_content_hash() {
    let h = harness(10);

    let first = h.service.initialize(false).await.unwrap();
    assert_eq!(first.tables, 2);
    assert_eq!(h.brain.calls(), 2);

    let second = h.service.initialize(false).await.unwrap();
    assert_eq!(second.content_hash, first.content_hash);
    assert_eq!(h.brain.calls(), 2);

    let identity = h.service.database().identity().to_string();
    assert!(identity.starts_with("shop-"));
    assert_eq!(first.database_identity, identity);
    let stage_file = |stage: Stage| {
        h.dir
            .path()
            .join("cache")
            .join(format!("{}_{}_{}.json", identity, first.content_hash, stage))
    };
    for stage in Stage::ALL {
        assert!(stage_file(stage).exists(), "missing {}", stage_file(stage).display());
    }

    let info = h.service.cache_info().await.unwrap();
    assert!(info.complete);
    assert_eq!(info.content_hash, first.content_hash);

    let raw_written_at = |path: PathBuf| -> String {
        let entry: Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        entry["created_at"].as_str().unwrap().to_string()
    };
    let raw_before = raw_written_at(stage_file(Stage::RawSchema));
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    let forced = h.service.initialize(true).await.unwrap();
    assert_eq!(h.brain.calls(), 4);
    assert!(forced.built_at > first.built_at);
    // stage 1 ran again as well
    assert_ne!(raw_written_at(stage_file(Stage::RawSchema)), raw_before);
}

#[tokio::test]
async fn drop_without_approval_is_refused() {
    let h = harness(3);
    let err = h.service.execute("DROP TABLE customers", false).await.unwrap_err();
    match err {
        AgentError::Safety(violation @ SafetyViolation::WriteWithoutApproval { .. }) => {
            assert!(violation.to_string().contains("write without approval"));
        }
        other => panic!("expected write-without-approval, got {:?}", other),
    }
}

#[tokio::test]
async fn statement_hidden_behind_comment_quote_is_refused() {
    let h = harness(5);
    let sql = "UPDATE customers SET tier = 'vip' -- don't\n; DROP TABLE customers";
    let err = h.service.execute(sql, true).await.unwrap_err();
    assert!(
        matches!(err, AgentError::Safety(SafetyViolation::BannedToken { .. })),
        "{:?}",
        err
    );

    let check = h
        .service
        .execute("SELECT COUNT(*) AS n FROM customers WHERE tier = 'vip'", false)
        .await
        .unwrap();
    match check.outcome {
        ExecutionOutcome::Rows { rows, .. } => assert_eq!(rows[0]["n"], 0),
        other => panic!("expected rows, got {:?}", other),
    }
}

#[tokio::test]
async fn unbounded_select_gets_default_limit() {
    let h = harness(250);
    let response = h.service.execute("SELECT * FROM customers", false).await.unwrap();
    assert_eq!(response.sql, "SELECT * FROM customers LIMIT 200");
    assert!(response.limit_injected);
    assert_eq!(response.classification, Classification::ReadOnly);
    assert!(response.outcome.row_count() <= 200);
}

#[tokio::test]
async fn failing_update_rolls_back() {
    let h = harness(4);
    let err = h
        .service
        .execute("UPDATE customers SET name = 'renamed'", true)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Execution(ref msg) if msg.contains("names are frozen")));

    let check = h
        .service
        .execute("SELECT COUNT(*) AS n FROM customers WHERE name = 'renamed'", false)
        .await
        .unwrap();
    match check.outcome {
        ExecutionOutcome::Rows { rows, .. } => assert_eq!(rows[0]["n"], 0),
        other => panic!("expected rows, got {:?}", other),
    }
}

#[tokio::test]
async fn approved_write_commits_unless_writes_disabled() {
    let h = harness(5);
    let response = h
        .service
        .execute("UPDATE customers SET tier = 'gold' WHERE tier = 'basic'", true)
        .await
        .unwrap();
    assert_eq!(response.outcome, ExecutionOutcome::Affected { rowcount: 4 });

    let locked = harness_with(5, false);
    let err = locked
        .service
        .execute("UPDATE customers SET tier = 'gold'", true)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Safety(SafetyViolation::WritesDisabled)));
}

#[tokio::test]
async fn chat_runs_tools_and_records_the_turn() {
    let h = harness(10);
    let mut session = Session::new();

    let reply = h.service.chat(&mut session, "How many gold customers?").await.unwrap();
    assert_eq!(reply.answer, "There are 2 gold customers.");
    assert_eq!(reply.tool_calls, 2);
    assert_eq!(reply.rounds, 2);
    assert_eq!(h.brain.calls(), 2);

    let turns = session.conversation.turns();
    assert_eq!(turns.len(), 4);
    let requested: Vec<String> = turns[1].tool_calls().iter().map(|c| c.id.clone()).collect();
    let answered: Vec<String> = turns[2].tool_results_iter().map(|r| r.id.clone()).collect();
    assert_eq!(requested, answered);

    session.clear();
    assert!(session.conversation.is_empty());
}

#[tokio::test]
async fn query_answers_from_cached_context() {
    let h = harness(10);
    let answer = h.service.query("Who are the gold customers?", &[]).await.unwrap();
    assert_eq!(answer.sql, "SELECT name FROM customers WHERE tier = 'gold' LIMIT 200");
    assert_eq!(answer.rows.len(), 2);
    assert_eq!(answer.explanation.as_deref(), Some("These are the gold customers."));
    // structure, dictionary, sql, explanation
    assert_eq!(h.brain.calls(), 4);

    h.service.query("And again?", &[]).await.unwrap();
    assert_eq!(h.brain.calls(), 6);
}

#[tokio::test]
async fn purge_and_database_info() {
    let h = harness(3);
    let cold = h.service.database_info().await.unwrap();
    assert_eq!(cold.tables, vec!["customers", "orders"]);
    assert!(cold.structured_schema.is_none());

    h.service.initialize(false).await.unwrap();
    let warm = h.service.database_info().await.unwrap();
    assert_eq!(warm.structured_schema.unwrap().tables.len(), 2);
    assert!(warm.data_dictionary.is_some());

    let purged = h.service.purge().await.unwrap();
    assert_eq!(purged.removed, 3);
    assert!(!h.service.cache_info().await.unwrap().complete);
}
