//! The SQL service's participant in a unit of work.
//!
//! A [`SqlTransactionMember`] holds the one connection a service uses inside a
//! transaction. The transaction drives it through commit or rollback and then
//! releases it, which hands the connection back to the service.

use crate::db::connection::Connection;
use crate::db::transaction::{Transaction, TransactionMember};
use crate::error::SqlResult;
use async_trait::async_trait;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

/// The service side of a member: transaction hooks and connection release.
#[async_trait]
pub trait MemberOwner: Send + Sync {
    fn name(&self) -> &str;

    /// Runs before the physical commit or rollback.
    async fn end_transaction(
        &self,
        conn: &Arc<dyn Connection>,
        will_be_committed: bool,
    ) -> SqlResult<()>;

    /// Take back a connection at the end of the unit of work. Must not fail.
    async fn release_connection(&self, conn: Arc<dyn Connection>);
}

/// Lifecycle of a member. A service without a member in the current
/// transaction is implicitly unstarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Active,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    Released,
}

pub struct SqlTransactionMember {
    member_id: String,
    connection: Arc<dyn Connection>,
    owner: Arc<dyn MemberOwner>,
    state: Mutex<MemberState>,
    finishing: AtomicBool,
    released: AtomicBool,
}

impl SqlTransactionMember {
    pub fn new(
        member_id: impl Into<String>,
        connection: Arc<dyn Connection>,
        owner: Arc<dyn MemberOwner>,
    ) -> Self {
        Self {
            member_id: member_id.into(),
            connection,
            owner,
            state: Mutex::new(MemberState::Active),
            finishing: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    pub fn connection(&self) -> Arc<dyn Connection> {
        self.connection.clone()
    }

    pub fn state(&self) -> MemberState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: MemberState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// True while the end-of-transaction hook runs.
    pub fn is_finishing_transaction(&self) -> bool {
        self.finishing.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    async fn run_end_hook(&self, will_be_committed: bool) -> SqlResult<()> {
        self.finishing.store(true, Ordering::Release);
        let result = self
            .owner
            .end_transaction(&self.connection, will_be_committed)
            .await;
        self.finishing.store(false, Ordering::Release);
        result
    }
}

#[async_trait]
impl TransactionMember for SqlTransactionMember {
    fn member_id(&self) -> &str {
        &self.member_id
    }

    /// Hook and commit failures are logged; the physical commit is attempted
    /// even if the hook failed.
    async fn commit_phase2(&self, tx: &Transaction) {
        self.set_state(MemberState::Committing);
        if let Err(e) = self.run_end_hook(true).await {
            error!(
                service = self.owner.name(),
                transaction_id = %tx.id(),
                error = %e,
                "End-of-transaction hook failed before commit"
            );
        }
        if let Err(e) = self.connection.commit().await {
            error!(
                service = self.owner.name(),
                transaction_id = %tx.id(),
                connection_id = self.connection.id(),
                error = %e,
                "Commit failed"
            );
            tx.add_failure(format!("{}: commit failed: {}", self.member_id, e));
        }
        self.set_state(MemberState::Committed);
        debug!(member_id = %self.member_id, transaction_id = %tx.id(), "Member committed");
    }

    /// Failures are logged unless the transaction was cancelled.
    async fn rollback(&self, tx: &Transaction) {
        self.set_state(MemberState::RollingBack);
        let hook = self.run_end_hook(false).await;
        let rollback = self.connection.rollback().await;
        if !tx.is_cancelled() {
            if let Err(e) = hook {
                error!(
                    service = self.owner.name(),
                    transaction_id = %tx.id(),
                    error = %e,
                    "End-of-transaction hook failed before rollback"
                );
            }
            if let Err(e) = rollback {
                error!(
                    service = self.owner.name(),
                    transaction_id = %tx.id(),
                    connection_id = self.connection.id(),
                    error = %e,
                    "Rollback failed"
                );
            }
        }
        self.set_state(MemberState::RolledBack);
        debug!(member_id = %self.member_id, transaction_id = %tx.id(), "Member rolled back");
    }

    async fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.owner.release_connection(self.connection.clone()).await;
        self.set_state(MemberState::Released);
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl std::fmt::Debug for SqlTransactionMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlTransactionMember")
            .field("member_id", &self.member_id)
            .field("connection_id", &self.connection.id())
            .field("state", &self.state())
            .finish()
    }
}
