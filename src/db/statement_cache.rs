//! Transaction-scoped cache of prepared statements.
//!
//! Entries are keyed by the identity of the connection they were prepared on
//! and the normalized SQL text. The cache holds at most `capacity` statements
//! and closes the least recently used one when a new statement would exceed it.

use crate::db::connection::{Connection, PreparedStatement};
use crate::db::transaction::{Transaction, TransactionMember};
use crate::error::{SqlError, SqlResult};
use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Member id under which the statement cache registers with a transaction.
pub const STATEMENT_CACHE_MEMBER_ID: &str = "txsql.statementCache";

type CacheKey = (u64, String);

struct CacheEntry {
    statement: Arc<dyn PreparedStatement>,
    last_used: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    tick: u64,
    released: bool,
    hits: u64,
    misses: u64,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Remove least recently used entries until at most `capacity` remain.
    fn evict_to(&mut self, capacity: usize) -> Vec<Arc<dyn PreparedStatement>> {
        let mut evicted = Vec::new();
        while self.entries.len() > capacity {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            if let Some(entry) = self.entries.remove(&oldest) {
                evicted.push(entry.statement);
            }
        }
        evicted
    }
}

/// Hit/miss counters of a [`StatementCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub len: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct StatementCache {
    capacity: usize,
    state: Mutex<CacheState>,
}

impl StatementCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(CacheState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Return the cached statement for `sql` on `connection`, preparing and
    /// caching it on a miss.
    pub async fn get_or_create(
        &self,
        connection: &Arc<dyn Connection>,
        sql: &str,
    ) -> SqlResult<Arc<dyn PreparedStatement>> {
        let key = (connection.id(), normalize_sql(sql));
        {
            let mut state = self.lock();
            if state.released {
                return Err(SqlError::processing(
                    "Statement cache was released with its transaction",
                ));
            }
            let tick = state.next_tick();
            if let Some(entry) = state.entries.get_mut(&key) {
                entry.last_used = tick;
                let statement = entry.statement.clone();
                state.hits += 1;
                return Ok(statement);
            }
            state.misses += 1;
        }

        let statement = connection.prepare(sql).await?;

        let (replaced, evicted) = {
            let mut state = self.lock();
            let tick = state.next_tick();
            let replaced = state.entries.insert(
                key,
                CacheEntry {
                    statement: statement.clone(),
                    last_used: tick,
                },
            );
            let evicted = state.evict_to(self.capacity);
            (replaced, evicted)
        };

        for old in replaced.into_iter().map(|e| e.statement).chain(evicted) {
            debug!(sql = %old.sql(), "Closing evicted statement");
            close_statement(&old).await;
        }
        Ok(statement)
    }

    /// Close every cached statement. Safe to call more than once.
    pub async fn release_all(&self) {
        let statements: Vec<_> = {
            let mut state = self.lock();
            state.released = true;
            state.entries.drain().map(|(_, e)| e.statement).collect()
        };
        if !statements.is_empty() {
            debug!(count = statements.len(), "Releasing cached statements");
        }
        for statement in &statements {
            close_statement(statement).await;
        }
    }

    pub fn contains(&self, connection_id: u64, sql: &str) -> bool {
        self.lock()
            .entries
            .contains_key(&(connection_id, normalize_sql(sql)))
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            len: state.entries.len(),
            hits: state.hits,
            misses: state.misses,
        }
    }

    pub fn is_released(&self) -> bool {
        self.lock().released
    }
}

impl std::fmt::Debug for StatementCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementCache")
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

async fn close_statement(statement: &Arc<dyn PreparedStatement>) {
    if let Err(e) = statement.close().await {
        warn!(error = %e, sql = %statement.sql(), "Failed to close statement");
    }
}

#[async_trait]
impl TransactionMember for StatementCache {
    fn member_id(&self) -> &str {
        STATEMENT_CACHE_MEMBER_ID
    }

    fn needs_commit(&self) -> bool {
        false
    }

    async fn commit_phase2(&self, _tx: &Transaction) {}

    async fn rollback(&self, _tx: &Transaction) {}

    async fn release(&self) {
        self.release_all().await;
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Collapse runs of whitespace outside quoted literals into one space and trim.
pub fn normalize_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;

    for c in sql.chars() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if c.is_whitespace() => pending_space = true,
            None => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                if c == '\'' || c == '"' {
                    quote = Some(c);
                }
                out.push(c);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::Connector;
    use crate::db::mock::MockConnector;

    #[test]
    fn test_normalize_sql() {
        assert_eq!(
            normalize_sql("  SELECT  a,\n\tb FROM t  WHERE x = 'a   b' "),
            "SELECT a, b FROM t WHERE x = 'a   b'"
        );
        assert_eq!(normalize_sql("SELECT \"my  col\"  FROM t"), "SELECT \"my  col\" FROM t");
        assert_eq!(normalize_sql(""), "");
    }

    #[tokio::test]
    async fn test_hit_on_equivalent_text() {
        let connector = MockConnector::new();
        let conn = connector.connect().await.unwrap();
        let cache = StatementCache::new(5);

        let a = cache.get_or_create(&conn, "SELECT 1").await.unwrap();
        let b = cache.get_or_create(&conn, "SELECT   1 ").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connector.state().log().prepared.len(), 1);
        assert_eq!(
            cache.stats(),
            CacheStats {
                len: 1,
                hits: 1,
                misses: 1
            }
        );
    }

    #[tokio::test]
    async fn test_keyed_by_connection() {
        let connector = MockConnector::new();
        let first = connector.connect().await.unwrap();
        let second = connector.connect().await.unwrap();
        let cache = StatementCache::new(5);

        let a = cache.get_or_create(&first, "SELECT 1").await.unwrap();
        let b = cache.get_or_create(&second, "SELECT 1").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.stats().len, 2);
    }

    #[tokio::test]
    async fn test_lru_eviction_closes_statement() {
        let connector = MockConnector::new();
        let conn = connector.connect().await.unwrap();
        let cache = StatementCache::new(2);

        let a = cache.get_or_create(&conn, "SELECT a").await.unwrap();
        cache.get_or_create(&conn, "SELECT b").await.unwrap();
        // Touch a so that b becomes the least recently used entry.
        cache.get_or_create(&conn, "SELECT a").await.unwrap();
        cache.get_or_create(&conn, "SELECT c").await.unwrap();

        assert_eq!(cache.stats().len, 2);
        assert!(cache.contains(conn.id(), "SELECT a"));
        assert!(!cache.contains(conn.id(), "SELECT b"));
        assert!(cache.contains(conn.id(), "SELECT c"));
        assert!(!a.is_closed());
        assert_eq!(
            connector.state().log().closed_statements,
            vec!["SELECT b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_release_all_is_idempotent() {
        let connector = MockConnector::new();
        let conn = connector.connect().await.unwrap();
        let cache = StatementCache::new(5);

        let a = cache.get_or_create(&conn, "SELECT a").await.unwrap();
        let b = cache.get_or_create(&conn, "SELECT b").await.unwrap();
        cache.release_all().await;
        cache.release_all().await;

        assert!(a.is_closed());
        assert!(b.is_closed());
        assert!(cache.is_released());
        assert_eq!(connector.state().log().closed_statements.len(), 2);
        assert!(cache.get_or_create(&conn, "SELECT a").await.is_err());
    }

    #[tokio::test]
    async fn test_released_with_transaction() {
        let connector = MockConnector::new();
        let conn = connector.connect().await.unwrap();
        let cache = Arc::new(StatementCache::new(5));
        let tx = Transaction::new();
        tx.register_member(cache.clone()).unwrap();

        let stmt = cache.get_or_create(&conn, "SELECT 1").await.unwrap();
        tx.finish(true).await.unwrap();
        assert!(stmt.is_closed());
        assert!(cache.is_released());
    }
}
