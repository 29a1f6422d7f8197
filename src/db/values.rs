use crate::error::{AgentError, Result};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Row;
use serde_json::{Map, Number, Value};

/// Convert a SQLite cell into JSON. Blobs are hex encoded.
pub fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}

/// Convert a JSON parameter into a bindable SQLite value.
pub fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

pub fn row_to_map(row: &Row<'_>, columns: &[String]) -> Result<Map<String, Value>> {
    let mut map = Map::with_capacity(columns.len());
    for (idx, name) in columns.iter().enumerate() {
        let cell = row
            .get_ref(idx)
            .map_err(|e| AgentError::Execution(format!("Failed to read column {}: {}", name, e)))?;
        map.insert(name.clone(), sql_to_json(cell));
    }
    Ok(map)
}

/// Query parameters supplied as JSON: an object binds by name, an array by position.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundParams {
    None,
    Named(Vec<(String, SqlValue)>),
    Positional(Vec<SqlValue>),
}

impl BoundParams {
    pub fn from_json(params: Option<&Value>) -> Result<Self> {
        match params {
            None | Some(Value::Null) => Ok(BoundParams::None),
            Some(Value::Object(map)) => Ok(BoundParams::Named(
                map.iter()
                    .map(|(k, v)| {
                        let name = if k.starts_with(&[':', '@', '$'][..]) {
                            k.clone()
                        } else {
                            format!(":{}", k)
                        };
                        (name, json_to_sql(v))
                    })
                    .collect(),
            )),
            Some(Value::Array(items)) => Ok(BoundParams::Positional(items.iter().map(json_to_sql).collect())),
            Some(other) => Err(AgentError::Execution(format!(
                "params must be an object or array, got {}",
                other
            ))),
        }
    }
}
