//! Database module for SQLite access
//!
//! Connection-per-operation handles, schema introspection and value conversion.

pub mod connection;
pub mod introspect;
pub mod values;

pub use connection::Database;
pub use introspect::{ColumnInfo, ForeignKeyInfo};
