//! SQL dialect hooks.
//!
//! A [`SqlStyle`] knows how one database family spells bind placeholders,
//! literals and sequence access, and how to probe a connection.

use crate::db::connection::Connection;
use crate::error::{SqlError, SqlResult};
use crate::models::{DatabaseType, Row, Value};
use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;

/// Dialect-specific behavior of a SQL service.
#[async_trait]
pub trait SqlStyle: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Placeholder for the bind at `index` (1-based).
    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    /// Render a value as an inline SQL literal.
    fn literal(&self, value: &Value) -> String {
        default_literal(value)
    }

    /// Statement returning the next value of `sequence`, if the dialect has sequences.
    fn sequence_next_value_sql(&self, sequence: &str) -> Option<String>;

    /// Statement used to probe a connection.
    fn test_statement(&self) -> &'static str {
        "SELECT 1"
    }

    /// Probe a connection by running [`test_statement`](SqlStyle::test_statement).
    async fn test_connection(&self, conn: &Arc<dyn Connection>) -> SqlResult<()> {
        let statement = conn.prepare(self.test_statement()).await?;
        let mut sink = |_row: Row| -> SqlResult<()> { Ok(()) };
        let result = statement.query(&[], Some(1), &mut sink).await;
        let _ = statement.close().await;
        result.map(|_| ())
    }

    /// Called after the service committed its connection.
    fn commit(&self) {}

    /// Called after the service rolled back its connection.
    fn rollback(&self) {}
}

/// Quote a string literal, doubling embedded single quotes.
pub fn quote_string(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02X}", b);
    }
    out
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OracleSqlStyle;

#[async_trait]
impl SqlStyle for OracleSqlStyle {
    fn name(&self) -> &'static str {
        "oracle"
    }

    fn literal(&self, value: &Value) -> String {
        match value {
            Value::Bool(v) => if *v { "1" } else { "0" }.to_string(),
            Value::Bytes(b) => format!("HEXTORAW('{}')", hex(b)),
            other => default_literal(other),
        }
    }

    fn sequence_next_value_sql(&self, sequence: &str) -> Option<String> {
        Some(format!("SELECT {}.NEXTVAL FROM DUAL", sequence))
    }

    fn test_statement(&self) -> &'static str {
        "SELECT 1 FROM DUAL"
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgreSqlStyle;

#[async_trait]
impl SqlStyle for PostgreSqlStyle {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn literal(&self, value: &Value) -> String {
        match value {
            Value::Bytes(b) => format!("'\\x{}'::bytea", hex(b)),
            other => default_literal(other),
        }
    }

    fn sequence_next_value_sql(&self, sequence: &str) -> Option<String> {
        Some(format!("SELECT nextval({})", quote_string(sequence)))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlStyle;

#[async_trait]
impl SqlStyle for MySqlStyle {
    fn name(&self) -> &'static str {
        "mysql"
    }

    /// MariaDB sequence syntax.
    fn sequence_next_value_sql(&self, sequence: &str) -> Option<String> {
        Some(format!("SELECT NEXTVAL({})", sequence))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteStyle;

#[async_trait]
impl SqlStyle for SqliteStyle {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn literal(&self, value: &Value) -> String {
        match value {
            Value::Bool(v) => if *v { "1" } else { "0" }.to_string(),
            other => default_literal(other),
        }
    }

    fn sequence_next_value_sql(&self, _sequence: &str) -> Option<String> {
        None
    }
}

/// ANSI literal rendering shared by the dialects.
pub fn default_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(v) => if *v { "TRUE" } else { "FALSE" }.to_string(),
        Value::Int(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::String(s) => quote_string(s),
        Value::Bytes(b) => format!("X'{}'", hex(b)),
    }
}

/// Pick the style for a service.
///
/// An explicit `name` wins; otherwise the style follows the database type of
/// the mapping URL. Without either the Oracle style is used.
pub fn style_for(name: Option<&str>, db_type: Option<DatabaseType>) -> SqlResult<Arc<dyn SqlStyle>> {
    if let Some(name) = name {
        return match name.trim().to_lowercase().as_str() {
            "oracle" => Ok(Arc::new(OracleSqlStyle)),
            "postgres" | "postgresql" => Ok(Arc::new(PostgreSqlStyle)),
            "mysql" | "mariadb" => Ok(Arc::new(MySqlStyle)),
            "sqlite" => Ok(Arc::new(SqliteStyle)),
            other => Err(SqlError::configuration(format!(
                "Unknown SQL style '{}'. Supported: oracle, postgresql, mysql, sqlite",
                other
            ))),
        };
    }
    Ok(match db_type {
        Some(DatabaseType::PostgreSQL) => Arc::new(PostgreSqlStyle),
        Some(DatabaseType::MySQL) => Arc::new(MySqlStyle),
        Some(DatabaseType::SQLite) => Arc::new(SqliteStyle),
        None => Arc::new(OracleSqlStyle),
    })
}
