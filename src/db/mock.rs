//! In-memory connections for tests.
//!
//! A [`MockConnector`] hands out [`MockConnection`]s that share one
//! [`MockState`]. The state records every call and can be scripted to return
//! rows or to fail specific operations.

use crate::db::connection::{Connection, Connector, PreparedStatement, RowSink, next_connection_id};
use crate::error::{SqlError, SqlResult};
use crate::models::{Row, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Calls observed by mock connections.
#[derive(Debug, Default, Clone)]
pub struct MockLog {
    pub connects: usize,
    pub prepared: Vec<String>,
    pub executed: Vec<(String, Vec<Value>)>,
    pub commits: usize,
    pub rollbacks: usize,
    pub closed_connections: Vec<u64>,
    pub closed_statements: Vec<String>,
}

#[derive(Debug, Default)]
struct Script {
    rows: HashMap<String, Vec<Row>>,
    affected: HashMap<String, u64>,
    fail_connect: bool,
    fail_commit: bool,
    fail_rollback: bool,
    fail_sql: Option<String>,
    invalid: bool,
}

#[derive(Debug, Default)]
struct Shared {
    log: MockLog,
    script: Script,
}

/// Shared, scriptable state of a mock connector and its connections.
#[derive(Debug, Default, Clone)]
pub struct MockState {
    shared: Arc<Mutex<Shared>>,
}

impl MockState {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        // A test that panicked while holding the lock already failed.
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of the calls observed so far.
    pub fn log(&self) -> MockLog {
        self.lock().log.clone()
    }

    /// Return `rows` for every query whose SQL equals `sql`.
    pub fn script_rows(&self, sql: impl Into<String>, rows: Vec<Row>) {
        self.lock().script.rows.insert(sql.into(), rows);
    }

    /// Return `count` as the affected row count for `sql`.
    pub fn script_affected(&self, sql: impl Into<String>, count: u64) {
        self.lock().script.affected.insert(sql.into(), count);
    }

    pub fn fail_connect(&self, fail: bool) {
        self.lock().script.fail_connect = fail;
    }

    pub fn fail_commit(&self, fail: bool) {
        self.lock().script.fail_commit = fail;
    }

    pub fn fail_rollback(&self, fail: bool) {
        self.lock().script.fail_rollback = fail;
    }

    /// Fail prepare and execution of statements containing `fragment`.
    pub fn fail_sql_containing(&self, fragment: Option<&str>) {
        self.lock().script.fail_sql = fragment.map(String::from);
    }

    /// Make every connection report itself as invalid.
    pub fn set_invalid(&self, invalid: bool) {
        self.lock().script.invalid = invalid;
    }

    fn check_sql(&self, sql: &str) -> SqlResult<()> {
        match &self.lock().script.fail_sql {
            Some(fragment) if sql.contains(fragment.as_str()) => Err(SqlError::processing(
                format!("mock failure for statement: {}", sql),
            )),
            _ => Ok(()),
        }
    }
}

/// Connector creating [`MockConnection`]s.
#[derive(Debug, Default, Clone)]
pub struct MockConnector {
    state: MockState,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MockState {
        self.state.clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> SqlResult<Arc<dyn Connection>> {
        let mut shared = self.state.lock();
        if shared.script.fail_connect {
            return Err(SqlError::connection("mock connect failure"));
        }
        shared.log.connects += 1;
        Ok(Arc::new(MockConnection {
            id: next_connection_id(),
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn describe(&self) -> String {
        "jdbcDriverName=mock, jdbcMappingName=mock:".to_string()
    }
}

/// A connection that records calls into its [`MockState`].
#[derive(Debug)]
pub struct MockConnection {
    id: u64,
    state: MockState,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for MockConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn prepare(&self, sql: &str) -> SqlResult<Arc<dyn PreparedStatement>> {
        self.state.check_sql(sql)?;
        self.state.lock().log.prepared.push(sql.to_string());
        Ok(Arc::new(MockStatement {
            sql: sql.to_string(),
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn commit(&self) -> SqlResult<()> {
        let mut shared = self.state.lock();
        shared.log.commits += 1;
        if shared.script.fail_commit {
            return Err(SqlError::processing("mock commit failure"));
        }
        Ok(())
    }

    async fn rollback(&self) -> SqlResult<()> {
        let mut shared = self.state.lock();
        shared.log.rollbacks += 1;
        if shared.script.fail_rollback {
            return Err(SqlError::processing("mock rollback failure"));
        }
        Ok(())
    }

    async fn is_valid(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.state.lock().script.invalid
    }

    async fn close(&self) -> SqlResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.state.lock().log.closed_connections.push(self.id);
        }
        Ok(())
    }
}

/// Statement created by [`MockConnection::prepare`].
#[derive(Debug)]
pub struct MockStatement {
    sql: String,
    state: MockState,
    closed: AtomicBool,
}

#[async_trait]
impl PreparedStatement for MockStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    async fn query(
        &self,
        params: &[Value],
        max_rows: Option<usize>,
        sink: RowSink<'_>,
    ) -> SqlResult<u64> {
        self.state.check_sql(&self.sql)?;
        let rows = {
            let mut shared = self.state.lock();
            shared.log.executed.push((self.sql.clone(), params.to_vec()));
            shared.script.rows.get(&self.sql).cloned().unwrap_or_default()
        };
        let limit = max_rows.filter(|max| *max > 0).unwrap_or(usize::MAX);
        let mut count = 0;
        for row in rows.into_iter().take(limit) {
            sink(row)?;
            count += 1;
        }
        Ok(count)
    }

    async fn execute(&self, params: &[Value]) -> SqlResult<u64> {
        self.state.check_sql(&self.sql)?;
        let mut shared = self.state.lock();
        shared.log.executed.push((self.sql.clone(), params.to_vec()));
        Ok(shared.script.affected.get(&self.sql).copied().unwrap_or(1))
    }

    async fn close(&self) -> SqlResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.state.lock().log.closed_statements.push(self.sql.clone());
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
