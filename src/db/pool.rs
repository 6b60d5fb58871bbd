//! Bounded pool of physical connections owned by one SQL service.
//!
//! # Design Decisions
//!
//! - **Semaphore for capacity**: one permit per leased (or being created)
//!   connection. New physical connections are only created when no idle one is
//!   available, so `leased + idle <= pool_size` holds at all times
//! - **`std::sync::Mutex` for state**: never held across an await point
//! - **Weak reference in the sweeper**: the background task exits once the pool
//!   is dropped
//!
//! A connection is either in `leased` or in `idle`, never both. Eviction only
//! touches idle connections; a connection leased to an active transaction is
//! never closed by the pool.

use crate::config::{PoolExhaustedPolicy, SqlServiceConfig};
use crate::db::connection::{Connection, Connector};
use crate::error::{SqlError, SqlResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Callbacks the pool invokes on behalf of the service leasing connections.
#[async_trait]
pub trait PoolOwner: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Check an idle connection before it is handed out again.
    async fn test_connection(&self, conn: &Arc<dyn Connection>) -> SqlResult<()> {
        if conn.is_valid().await {
            Ok(())
        } else {
            Err(SqlError::connection("Connection is no longer valid"))
        }
    }

    /// Initialize a freshly created physical connection.
    async fn after_connection_created(&self, _conn: &Arc<dyn Connection>) -> SqlResult<()> {
        Ok(())
    }
}

/// Pool sizing and eviction settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub name: String,
    pub size: usize,
    pub connection_lifetime: Duration,
    pub connection_busy_timeout: Duration,
    pub exhausted_policy: PoolExhaustedPolicy,
    pub block_timeout: Duration,
}

impl PoolConfig {
    pub fn from_service_config(config: &SqlServiceConfig) -> Self {
        Self {
            name: config.name_or_default().to_string(),
            size: config.pool_size_or_default(),
            connection_lifetime: config.pool_connection_lifetime(),
            connection_busy_timeout: config.pool_connection_busy_timeout(),
            exhausted_policy: config.pool_exhausted_policy_or_default(),
            block_timeout: config.pool_block_timeout(),
        }
    }
}

struct IdleEntry {
    conn: Arc<dyn Connection>,
    created_at: Instant,
    last_used: Instant,
}

struct LeasedEntry {
    conn: Arc<dyn Connection>,
    created_at: Instant,
    leased_at: Instant,
    owner: String,
    _permit: OwnedSemaphorePermit,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<IdleEntry>,
    leased: HashMap<u64, LeasedEntry>,
    created: u64,
    closed: bool,
}

/// Counts reported by [`ConnectionPool::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub idle: usize,
    pub leased: usize,
    pub created: u64,
}

/// Bounded pool of physical connections.
pub struct ConnectionPool {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    permits: Arc<Semaphore>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        info!(
            pool = %config.name,
            size = config.size,
            lifetime_ms = config.connection_lifetime.as_millis() as u64,
            busy_timeout_ms = config.connection_busy_timeout.as_millis() as u64,
            policy = %config.exhausted_policy,
            "Connection pool created"
        );
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(config.size)),
            config,
            connector,
            state: Mutex::new(PoolState::default()),
            sweeper: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        // Pool state stays consistent across a panic in a caller; recover the guard.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_expired(&self, created_at: Instant, last_used: Instant, now: Instant) -> bool {
        now.saturating_duration_since(created_at) > self.config.connection_lifetime
            || now.saturating_duration_since(last_used) > self.config.connection_busy_timeout
    }

    async fn acquire_permit(&self) -> SqlResult<OwnedSemaphorePermit> {
        let exhausted = || SqlError::pool_exhausted(self.config.name.clone(), self.config.size);
        match self.config.exhausted_policy {
            PoolExhaustedPolicy::Fail => match self.permits.clone().try_acquire_owned() {
                Ok(permit) => Ok(permit),
                Err(TryAcquireError::NoPermits) => Err(exhausted()),
                Err(TryAcquireError::Closed) => Err(self.closed_error()),
            },
            PoolExhaustedPolicy::Block => {
                match tokio::time::timeout(
                    self.config.block_timeout,
                    self.permits.clone().acquire_owned(),
                )
                .await
                {
                    Ok(Ok(permit)) => Ok(permit),
                    Ok(Err(_)) => Err(self.closed_error()),
                    Err(_) => {
                        warn!(
                            pool = %self.config.name,
                            timeout_ms = self.config.block_timeout.as_millis() as u64,
                            "Timed out waiting for a pooled connection"
                        );
                        Err(exhausted())
                    }
                }
            }
        }
    }

    fn closed_error(&self) -> SqlError {
        SqlError::connection(format!("Connection pool '{}' is closed", self.config.name))
    }

    /// Lease a connection for `owner`.
    ///
    /// Reuses the most recently released idle connection that is neither
    /// expired nor rejected by the owner's test; otherwise creates a new
    /// physical connection.
    pub async fn lease_connection(&self, owner: &dyn PoolOwner) -> SqlResult<Arc<dyn Connection>> {
        let permit = self.acquire_permit().await?;

        loop {
            let candidate = {
                let mut state = self.state();
                if state.closed {
                    return Err(self.closed_error());
                }
                state.idle.pop()
            };
            let Some(entry) = candidate else { break };

            let now = Instant::now();
            if self.is_expired(entry.created_at, entry.last_used, now) {
                debug!(
                    pool = %self.config.name,
                    connection_id = entry.conn.id(),
                    "Discarding expired idle connection"
                );
                close_quietly(&entry.conn).await;
                continue;
            }
            if let Err(e) = owner.test_connection(&entry.conn).await {
                warn!(
                    pool = %self.config.name,
                    connection_id = entry.conn.id(),
                    error = %e,
                    "Idle connection failed test, discarding"
                );
                close_quietly(&entry.conn).await;
                continue;
            }

            let conn = entry.conn.clone();
            self.insert_leased(entry.conn, entry.created_at, owner, permit);
            debug!(
                pool = %self.config.name,
                connection_id = conn.id(),
                owner = owner.name(),
                "Reused idle connection"
            );
            return Ok(conn);
        }

        let conn = self.connector.connect().await?;
        if let Err(e) = owner.after_connection_created(&conn).await {
            close_quietly(&conn).await;
            return Err(e);
        }

        self.state().created += 1;
        self.insert_leased(conn.clone(), Instant::now(), owner, permit);
        debug!(
            pool = %self.config.name,
            connection_id = conn.id(),
            owner = owner.name(),
            "Created new pooled connection"
        );
        Ok(conn)
    }

    fn insert_leased(
        &self,
        conn: Arc<dyn Connection>,
        created_at: Instant,
        owner: &dyn PoolOwner,
        permit: OwnedSemaphorePermit,
    ) {
        let id = conn.id();
        self.state().leased.insert(
            id,
            LeasedEntry {
                conn,
                created_at,
                leased_at: Instant::now(),
                owner: owner.name().to_string(),
                _permit: permit,
            },
        );
    }

    /// Return a leased connection.
    ///
    /// Expired connections are closed instead of becoming idle. Releasing a
    /// connection that is not leased from this pool is logged and ignored.
    pub async fn release_connection(&self, conn: &Arc<dyn Connection>) {
        let id = conn.id();
        let now = Instant::now();
        let to_close = {
            let mut state = self.state();
            let Some(entry) = state.leased.remove(&id) else {
                warn!(
                    pool = %self.config.name,
                    connection_id = id,
                    "Release of a connection not leased from this pool ignored"
                );
                return;
            };
            // The permit is dropped with `entry` when this scope ends.
            let expired =
                now.saturating_duration_since(entry.created_at) > self.config.connection_lifetime;
            if state.closed || expired {
                Some(entry.conn.clone())
            } else {
                state.idle.push(IdleEntry {
                    conn: entry.conn.clone(),
                    created_at: entry.created_at,
                    last_used: now,
                });
                None
            }
        };

        match to_close {
            Some(conn) => {
                debug!(
                    pool = %self.config.name,
                    connection_id = id,
                    "Closing expired connection on release"
                );
                close_quietly(&conn).await;
            }
            None => debug!(pool = %self.config.name, connection_id = id, "Connection returned to pool"),
        }
    }

    /// Close idle connections past their lifetime or busy timeout. Returns the
    /// number of connections closed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Arc<dyn Connection>> = {
            let mut state = self.state();
            let (expired, keep): (Vec<_>, Vec<_>) = state
                .idle
                .drain(..)
                .partition(|e| self.is_expired(e.created_at, e.last_used, now));
            state.idle = keep;
            expired.into_iter().map(|e| e.conn).collect()
        };

        for conn in &expired {
            close_quietly(conn).await;
        }
        if !expired.is_empty() {
            info!(
                pool = %self.config.name,
                closed = expired.len(),
                "Swept expired idle connections"
            );
        }
        expired.len()
    }

    /// Start a background task that sweeps the pool every `interval`.
    ///
    /// The task holds only a weak reference and exits once the pool is dropped.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        let weak_pool: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = weak_pool.upgrade() else {
                    debug!("Connection pool dropped, sweeper exiting");
                    return;
                };
                pool.sweep().await;
                drop(pool);
            }
        });

        let mut guard = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = guard.replace(handle) {
            previous.abort();
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state();
        PoolStats {
            size: self.config.size,
            idle: state.idle.len(),
            leased: state.leased.len(),
            created: state.created,
        }
    }

    /// Human-readable report of the pool and its connections.
    pub fn inventory(&self) -> String {
        let now = Instant::now();
        let state = self.state();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Pool '{}': size={}, idle={}, leased={}, created={}",
            self.config.name,
            self.config.size,
            state.idle.len(),
            state.leased.len(),
            state.created
        );
        let mut leased: Vec<_> = state.leased.values().collect();
        leased.sort_by_key(|e| e.conn.id());
        for entry in leased {
            let _ = writeln!(
                out,
                "  leased #{} owner={} age={}ms leased_for={}ms",
                entry.conn.id(),
                entry.owner,
                now.saturating_duration_since(entry.created_at).as_millis(),
                now.saturating_duration_since(entry.leased_at).as_millis()
            );
        }
        for entry in &state.idle {
            let _ = writeln!(
                out,
                "  idle #{} age={}ms idle_for={}ms",
                entry.conn.id(),
                now.saturating_duration_since(entry.created_at).as_millis(),
                now.saturating_duration_since(entry.last_used).as_millis()
            );
        }
        let _ = write!(
            out,
            "  lifetime={}ms busy_timeout={}ms",
            self.config.connection_lifetime.as_millis(),
            self.config.connection_busy_timeout.as_millis()
        );
        out
    }

    /// Close all idle connections, stop the sweeper and refuse further leases.
    /// Leased connections are closed when they are released.
    pub async fn close(&self) {
        if let Some(handle) = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }

        let idle: Vec<IdleEntry> = {
            let mut state = self.state();
            state.closed = true;
            state.idle.drain(..).collect()
        };
        self.permits.close();

        for entry in &idle {
            close_quietly(&entry.conn).await;
        }
        info!(pool = %self.config.name, closed = idle.len(), "Connection pool closed");
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

async fn close_quietly(conn: &Arc<dyn Connection>) {
    if let Err(e) = conn.close().await {
        warn!(connection_id = conn.id(), error = %e, "Failed to close connection");
    }
}
