//! Schema cache artifacts
//!
//! One type per pipeline stage. Model-produced stages are checked against the
//! raw schema before they may be cached.

use crate::db::{ColumnInfo, ForeignKeyInfo};
use crate::error::{AgentError, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    RawSchema,
    StructuredSchema,
    DataDictionary,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::RawSchema, Stage::StructuredSchema, Stage::DataDictionary];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::RawSchema => "raw_schema",
            Stage::StructuredSchema => "structured_schema",
            Stage::DataDictionary => "data_dictionary",
        }
    }

    pub fn parse(s: &str) -> Option<Stage> {
        Stage::ALL.into_iter().find(|stage| stage.as_str() == s)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Stage 1
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTable {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyInfo>,
    pub row_count: i64,
    #[serde(default)]
    pub samples: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSchema {
    pub database_identity: String,
    pub tables: Vec<RawTable>,
}

impl RawSchema {
    pub fn table(&self, name: &str) -> Option<&RawTable> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.table(table)
            .map(|t| t.columns.iter().any(|c| c.name.eq_ignore_ascii_case(column)))
            .unwrap_or(false)
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    /// Compact `table(col type, ...)` listing for prompts.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for table in &self.tables {
            let cols = table
                .columns
                .iter()
                .map(|c| {
                    let mut s = format!("{} {}", c.name, c.data_type);
                    if c.primary_key {
                        s.push_str(" PK");
                    }
                    s
                })
                .join(", ");
            out.push_str(&format!("{} ({} rows): {}\n", table.name, table.row_count, cols));
            for fk in &table.foreign_keys {
                out.push_str(&format!(
                    "  {}.{} -> {}.{}\n",
                    table.name, fk.column, fk.references_table, fk.references_column
                ));
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Stage 2
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSemantics {
    pub name: String,
    #[serde(default)]
    pub meaning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableAnalysis {
    pub name: String,
    pub purpose: String,
    #[serde(default)]
    pub columns: Vec<ColumnSemantics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
    /// e.g. "many_to_one"; free text from the model.
    #[serde(default)]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredSchema {
    pub tables: Vec<TableAnalysis>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

impl StructuredSchema {
    pub fn validate_against(&self, raw: &RawSchema) -> Result<()> {
        if self.tables.is_empty() && !raw.tables.is_empty() {
            return Err(AgentError::Cache("structured schema describes no tables".to_string()));
        }
        for table in &self.tables {
            if raw.table(&table.name).is_none() {
                return Err(AgentError::Cache(format!(
                    "structured schema references unknown table '{}'",
                    table.name
                )));
            }
            for column in &table.columns {
                if !raw.has_column(&table.name, &column.name) {
                    return Err(AgentError::Cache(format!(
                        "structured schema references unknown column '{}.{}'",
                        table.name, column.name
                    )));
                }
            }
        }
        for rel in &self.relationships {
            let ends = [(&rel.from_table, &rel.from_column), (&rel.to_table, &rel.to_column)];
            for (table, column) in ends {
                if !raw.has_column(table, column) {
                    return Err(AgentError::Cache(format!(
                        "relationship references unknown column '{}.{}'",
                        table, column
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn table(&self, name: &str) -> Option<&TableAnalysis> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }
}

// ---------------------------------------------------------------------------
// Stage 3
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DictionaryColumn {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub valid_values: Vec<Value>,
    #[serde(default)]
    pub business_rules: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DictionaryTable {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub columns: Vec<DictionaryColumn>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataDictionary {
    #[serde(default)]
    pub overview: String,
    pub tables: Vec<DictionaryTable>,
    #[serde(default)]
    pub naming_conventions: Vec<String>,
    #[serde(default)]
    pub business_rules: Vec<String>,
}

impl DataDictionary {
    pub fn validate_against(&self, raw: &RawSchema) -> Result<()> {
        if self.tables.is_empty() && !raw.tables.is_empty() {
            return Err(AgentError::Cache("data dictionary describes no tables".to_string()));
        }
        for table in &self.tables {
            if raw.table(&table.name).is_none() {
                return Err(AgentError::Cache(format!(
                    "data dictionary references unknown table '{}'",
                    table.name
                )));
            }
            if let Some(column) = table.columns.iter().find(|c| !raw.has_column(&table.name, &c.name)) {
                return Err(AgentError::Cache(format!(
                    "data dictionary references unknown column '{}.{}'",
                    table.name, column.name
                )));
            }
        }
        Ok(())
    }
}
