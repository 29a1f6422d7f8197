//! Agent Prompts - System prompts and prompt builders for the SQL agent
//!
//! Covers the tool-calling chat agent, the two model-driven schema cache stages,
//! single-shot SQL generation and result explanation.

use crate::agent::retriever::Example;
use crate::llm::strip_code_fence;
use crate::schema_cache::artifacts::{DataDictionary, RawSchema, StructuredSchema};
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};

/// Rows of query output included in the explanation prompt.
const EXPLANATION_ROW_BUDGET: usize = 20;
/// Sample rows per table shown to the structure analysis stage.
const ANALYSIS_SAMPLE_BUDGET: usize = 3;

/// System prompt for the tool-calling chat agent
pub const DATA_AGENT_SYSTEM_PROMPT: &str = r#"You are a cautious data agent working against a SQLite database.

- Prefer read-only operations; request approval for writes by setting "write": true only when the user explicitly asked for a change.
- Always inspect the schema (get_schema) before writing complex SQL.
- Use sample_rows to check value formats before filtering on them.
- Keep results concise; include next steps when helpful.

Tools:
1. get_schema: tables and columns, optionally with row counts
2. run_sql: run one SQL statement; reads are limited automatically
3. sample_rows: first rows of a table

A tool may answer with an error object. Read it, correct the call, and try again, or explain to the user why the request cannot be done."#;

/// System prompt for stage 2 (structured analysis)
pub const STRUCTURE_ANALYSIS_SYSTEM_PROMPT: &str = r#"You are a database analyst. You read raw SQLite schemas and sample data and describe what each table is for, what each column means and how tables relate. Only reference tables and columns that exist in the schema you are given. Respond with JSON only."#;

/// System prompt for stage 3 (data dictionary)
pub const DATA_DICTIONARY_SYSTEM_PROMPT: &str = r#"You are a data steward writing a business data dictionary. Document tables and columns in business terms, list valid values where the samples make them evident, and record business rules and naming conventions. Only reference tables and columns that exist in the schema you are given. Respond with JSON only."#;

/// System prompt for single-shot SQL generation
pub const SQL_GENERATION_SYSTEM_PROMPT: &str = r#"You translate questions into a single SQLite SELECT statement. Return only the SQL, with no explanation and no markdown."#;

/// System prompt for result explanation
pub const EXPLANATION_SYSTEM_PROMPT: &str = r#"You explain SQL query results to business users in two or three plain sentences. Mention notable numbers. Do not repeat the SQL."#;

fn samples_json(samples: &[Map<String, Value>]) -> String {
    let shown: Vec<&Map<String, Value>> = samples.iter().take(ANALYSIS_SAMPLE_BUDGET).collect();
    serde_json::to_string(&shown).unwrap_or_default()
}

/// Prompt for stage 2: table purposes, column semantics, relationships
pub fn build_structure_prompt(raw: &RawSchema) -> String {
    let mut samples = String::new();
    for table in &raw.tables {
        samples.push_str(&format!("{}: {}\n", table.name, samples_json(&table.samples)));
    }

    format!(
        r#"Analyze this database.

Schema:
{}
Sample rows:
{}
Return JSON:
{{
  "tables": [
    {{"name": "table_name", "purpose": "what the table records", "columns": [{{"name": "column_name", "meaning": "what the column holds"}}]}}
  ],
  "relationships": [
    {{"from_table": "orders", "from_column": "customer_id", "to_table": "customers", "to_column": "id", "kind": "many_to_one"}}
  ]
}}

Include declared foreign keys and relationships implied by column names."#,
        raw.describe(),
        samples,
    )
}

/// Prompt for stage 3: business dictionary built on the structured analysis
pub fn build_dictionary_prompt(raw: &RawSchema, structured: &StructuredSchema) -> String {
    let mut samples = String::new();
    for table in &raw.tables {
        samples.push_str(&format!("{}: {}\n", table.name, samples_json(&table.samples)));
    }

    format!(
        r#"Write a data dictionary for this database.

Schema:
{}
Structured analysis:
{}

Sample rows:
{}
Return JSON:
{{
  "overview": "one paragraph about the database",
  "tables": [
    {{
      "name": "table_name",
      "description": "business description",
      "columns": [
        {{"name": "column_name", "description": "business meaning", "valid_values": ["only if evident"], "business_rules": ["constraints users should know"]}}
      ]
    }}
  ],
  "naming_conventions": ["e.g. *_id columns are foreign keys"],
  "business_rules": ["cross-table rules"]
}}"#,
        raw.describe(),
        serde_json::to_string_pretty(structured).unwrap_or_default(),
        samples,
    )
}

/// Prompt for single-shot SQL generation, primed with cached schema artifacts
pub fn build_sql_prompt(
    question: &str,
    raw: &RawSchema,
    structured: &StructuredSchema,
    dictionary: &DataDictionary,
    examples: &[Example],
    history: &[(String, String)],
) -> String {
    let mut tables = String::new();
    for table in &raw.tables {
        let purpose = structured
            .table(&table.name)
            .map(|t| t.purpose.as_str())
            .unwrap_or("");
        tables.push_str(&format!("- {}: {}\n", table.name, purpose));
    }

    let relationships = structured
        .relationships
        .iter()
        .map(|r| format!("- {}.{} -> {}.{}", r.from_table, r.from_column, r.to_table, r.to_column))
        .join("\n");

    let mut prompt = format!(
        "Schema:\n{}\nTable purposes:\n{}",
        raw.describe(),
        tables
    );
    if !relationships.is_empty() {
        prompt.push_str(&format!("\nRelationships:\n{}\n", relationships));
    }
    if !dictionary.business_rules.is_empty() {
        prompt.push_str(&format!("\nBusiness rules:\n- {}\n", dictionary.business_rules.join("\n- ")));
    }

    let hinted: Vec<String> = dictionary
        .tables
        .iter()
        .flat_map(|t| {
            t.columns
                .iter()
                .filter(|c| !c.valid_values.is_empty())
                .map(move |c| {
                    let values = c.valid_values.iter().map(|v| v.to_string()).join(", ");
                    format!("- {}.{}: {}", t.name, c.name, values)
                })
        })
        .collect();
    if !hinted.is_empty() {
        prompt.push_str(&format!("\nValid values:\n{}\n", hinted.join("\n")));
    }

    if !examples.is_empty() {
        prompt.push_str("\nSimilar questions:\n");
        for ex in examples {
            prompt.push_str(&format!("Q: {}\nSQL: {}\n", ex.question, ex.sql));
        }
    }

    if !history.is_empty() {
        prompt.push_str("\nConversation so far:\n");
        for (question, answer) in history {
            prompt.push_str(&format!("User: {}\nAssistant: {}\n", question, answer));
        }
    }

    prompt.push_str(&format!("\nQuestion: {}\nSQL Query:", question));
    prompt
}

/// Prompt for explaining query output
pub fn build_explanation_prompt(question: &str, sql: &str, columns: &[String], rows: &[Map<String, Value>]) -> String {
    let shown: Vec<&Map<String, Value>> = rows.iter().take(EXPLANATION_ROW_BUDGET).collect();
    let more = rows.len().saturating_sub(shown.len());
    format!(
        r#"Question: {}

SQL: {}

Columns: {}
Results ({} rows{}):
{}

Explain what these results mean for the question."#,
        question,
        sql,
        columns.join(", "),
        rows.len(),
        if more > 0 { format!(", first {} shown", shown.len()) } else { String::new() },
        serde_json::to_string_pretty(&shown).unwrap_or_default(),
    )
}

lazy_static! {
    static ref SQL_LABEL: Regex = Regex::new(r"(?i)^\s*(sql\s*query|sql)\s*:\s*").unwrap();
}

/// Strip markdown fences, a leading `SQL Query:` label and a trailing `;` from model SQL.
pub fn clean_sql(raw: &str) -> String {
    let body = strip_code_fence(raw);
    let body = SQL_LABEL.replace(body, "");
    let body = body.trim();
    body.strip_suffix(';').unwrap_or(body).trim_end().to_string()
}
