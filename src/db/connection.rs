//! Connection abstractions consumed by the pool, the statement cache and the
//! SQL service.
//!
//! - [`Connection`]: a physical connection with manual commit/rollback
//! - [`PreparedStatement`]: a statement prepared on one connection
//! - [`Connector`]: creates physical connections (a driver or a data source)
//! - [`DataSourceRegistry`]: externally pooled data sources by lookup name

use crate::error::SqlResult;
use crate::models::{Row, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-wide unique connection id.
pub fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Receives result rows one at a time.
pub type RowSink<'a> = &'a mut (dyn FnMut(Row) -> SqlResult<()> + Send);

/// A physical database connection in manual-commit mode.
///
/// A transaction is opened implicitly by the first statement and ended by
/// [`commit`](Connection::commit) or [`rollback`](Connection::rollback).
#[async_trait]
pub trait Connection: Send + Sync {
    /// Unique identity of this physical connection.
    fn id(&self) -> u64;

    /// Prepare a statement for execution on this connection.
    async fn prepare(&self, sql: &str) -> SqlResult<Arc<dyn PreparedStatement>>;

    /// Commit the current transaction. A no-op if nothing was executed.
    async fn commit(&self) -> SqlResult<()>;

    /// Roll back the current transaction. A no-op if nothing was executed.
    async fn rollback(&self) -> SqlResult<()>;

    /// Check if the connection is still usable.
    async fn is_valid(&self) -> bool;

    /// Close the connection. Further calls fail.
    async fn close(&self) -> SqlResult<()>;
}

impl std::fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("id", &self.id()).finish()
    }
}

/// A statement prepared on one connection.
#[async_trait]
pub trait PreparedStatement: Send + Sync {
    /// The SQL text as prepared.
    fn sql(&self) -> &str;

    /// Run a query, feeding each row to `sink`. Stops after `max_rows` rows when
    /// set. Returns the number of rows delivered.
    async fn query(
        &self,
        params: &[Value],
        max_rows: Option<usize>,
        sink: RowSink<'_>,
    ) -> SqlResult<u64>;

    /// Run a modification and return the affected row count.
    async fn execute(&self, params: &[Value]) -> SqlResult<u64>;

    /// Release the statement.
    async fn close(&self) -> SqlResult<()>;

    /// Whether [`close`](PreparedStatement::close) was called.
    fn is_closed(&self) -> bool;
}

impl std::fmt::Debug for dyn PreparedStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedStatement")
            .field("sql", &self.sql())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Creates physical connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> SqlResult<Arc<dyn Connection>>;

    /// Identity of the connection source for error context, credentials masked.
    fn describe(&self) -> String;
}

/// Externally pooled connection sources, looked up by name.
///
/// Connections obtained from a data source are closed on release; the data
/// source itself is responsible for pooling.
#[derive(Default, Clone)]
pub struct DataSourceRegistry {
    sources: Arc<RwLock<HashMap<String, Arc<dyn Connector>>>>,
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a data source under `name`, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, source: Arc<dyn Connector>) {
        if let Ok(mut sources) = self.sources.write() {
            sources.insert(name.into(), source);
        }
    }

    /// Look up `name`, first as given, then with each prefix prepended.
    /// Returns the name that matched along with the source.
    pub fn lookup(&self, name: &str, prefixes: &[String]) -> Option<(String, Arc<dyn Connector>)> {
        let sources = self.sources.read().ok()?;
        std::iter::once(name.to_string())
            .chain(prefixes.iter().map(|p| format!("{}{}", p, name)))
            .find_map(|candidate| {
                sources
                    .get(&candidate)
                    .map(|source| (candidate.clone(), source.clone()))
            })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sources
            .read()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

impl std::fmt::Debug for DataSourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceRegistry")
            .field("sources", &self.names())
            .finish()
    }
}
