//! Unit of work coordinating transaction members.
//!
//! A [`Transaction`] keeps an ordered registry of [`TransactionMember`]s keyed
//! by member id. At the end of the unit of work it runs a two-phase commit
//! (or a rollback) over all members and then releases each member exactly once.

use crate::error::{SqlError, SqlResult};
use async_trait::async_trait;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A participant in a unit of work.
#[async_trait]
pub trait TransactionMember: Send + Sync {
    /// Unique id of this member within its transaction.
    fn member_id(&self) -> &str;

    /// Whether the member takes part in the commit protocol.
    fn needs_commit(&self) -> bool {
        true
    }

    /// First commit phase. Returning `false` vetoes the commit.
    async fn commit_phase1(&self, _tx: &Transaction) -> bool {
        true
    }

    /// Second commit phase. Failures are handled by the member.
    async fn commit_phase2(&self, tx: &Transaction);

    /// Roll back. Failures are handled by the member.
    async fn rollback(&self, tx: &Transaction);

    /// Free resources. Called exactly once per member at the end of the transaction.
    async fn release(&self);

    /// Upcast for typed member lookup.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A unit of work.
pub struct Transaction {
    id: String,
    members: Mutex<Vec<Arc<dyn TransactionMember>>>,
    cancelled: AtomicBool,
    failures: Mutex<Vec<String>>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", Uuid::new_v4().simple())
}

impl Transaction {
    pub fn new() -> Self {
        let tx = Self {
            id: generate_transaction_id(),
            members: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
            failures: Mutex::new(Vec::new()),
        };
        debug!(transaction_id = %tx.id, "Transaction started");
        tx
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn members_guard(&self) -> MutexGuard<'_, Vec<Arc<dyn TransactionMember>>> {
        self.members.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn failures_guard(&self) -> MutexGuard<'_, Vec<String>> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a member. Fails if the id is taken or the transaction was cancelled.
    pub fn register_member(&self, member: Arc<dyn TransactionMember>) -> SqlResult<()> {
        if self.is_cancelled() {
            return Err(SqlError::cancelled(self.id.clone()));
        }
        let mut members = self.members_guard();
        if members.iter().any(|m| m.member_id() == member.member_id()) {
            return Err(SqlError::illegal_argument(format!(
                "Transaction member '{}' is already registered",
                member.member_id()
            )));
        }
        debug!(
            transaction_id = %self.id,
            member_id = member.member_id(),
            "Transaction member registered"
        );
        members.push(member);
        Ok(())
    }

    /// Look up a member by id.
    pub fn member(&self, member_id: &str) -> Option<Arc<dyn TransactionMember>> {
        self.members_guard()
            .iter()
            .find(|m| m.member_id() == member_id)
            .cloned()
    }

    /// Look up a member by id and downcast it to its concrete type.
    pub fn member_as<T: Any + Send + Sync>(&self, member_id: &str) -> Option<Arc<T>> {
        self.member(member_id)
            .and_then(|m| m.as_any().downcast::<T>().ok())
    }

    /// Ids of the registered members, in registration order.
    pub fn member_ids(&self) -> Vec<String> {
        self.members_guard()
            .iter()
            .map(|m| m.member_id().to_string())
            .collect()
    }

    fn snapshot(&self) -> Vec<Arc<dyn TransactionMember>> {
        self.members_guard().clone()
    }

    /// Mark the transaction as cancelled. Returns `false` if it already was.
    pub fn cancel(&self) -> bool {
        let first = !self.cancelled.swap(true, Ordering::AcqRel);
        if first {
            info!(transaction_id = %self.id, "Transaction cancelled");
        }
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Record a failure; a transaction with failures is rolled back by [`finish`](Self::finish).
    pub fn add_failure(&self, failure: impl Into<String>) {
        self.failures_guard().push(failure.into());
    }

    pub fn failures(&self) -> Vec<String> {
        self.failures_guard().clone()
    }

    pub fn has_failures(&self) -> bool {
        !self.failures_guard().is_empty()
    }

    /// Two-phase commit over all members that need it.
    ///
    /// If any member vetoes phase 1, or the transaction was cancelled, all
    /// members are rolled back instead and an error is returned.
    pub async fn commit(&self) -> SqlResult<()> {
        if self.is_cancelled() {
            self.rollback().await;
            return Err(SqlError::cancelled(self.id.clone()));
        }

        let members: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|m| m.needs_commit())
            .collect();

        for member in &members {
            if !member.commit_phase1(self).await {
                warn!(
                    transaction_id = %self.id,
                    member_id = member.member_id(),
                    "Commit phase 1 vetoed, rolling back"
                );
                self.add_failure(format!("commit phase 1 failed: {}", member.member_id()));
                self.rollback().await;
                return Err(SqlError::processing(format!(
                    "Transaction member '{}' rejected the commit",
                    member.member_id()
                )));
            }
        }

        for member in &members {
            member.commit_phase2(self).await;
        }
        debug!(transaction_id = %self.id, members = members.len(), "Transaction committed");
        Ok(())
    }

    /// Roll back all members that need it.
    pub async fn rollback(&self) {
        let members = self.snapshot();
        for member in members.iter().filter(|m| m.needs_commit()) {
            member.rollback(self).await;
        }
        debug!(transaction_id = %self.id, "Transaction rolled back");
    }

    /// Release every member exactly once and clear the registry.
    pub async fn release(&self) {
        let members: Vec<_> = self.members_guard().drain(..).collect();
        for member in &members {
            member.release().await;
        }
        debug!(transaction_id = %self.id, members = members.len(), "Transaction released");
    }

    /// End the unit of work: commit on success without recorded failures,
    /// otherwise roll back; release all members in either case.
    pub async fn finish(&self, success: bool) -> SqlResult<()> {
        let result = if success && !self.has_failures() {
            self.commit().await
        } else {
            self.rollback().await;
            Ok(())
        };
        self.release().await;
        result
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("members", &self.member_ids())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        id: String,
        veto: bool,
        events: Arc<StdMutex<Vec<String>>>,
    }

    impl Recorder {
        fn new(id: &str, events: &Arc<StdMutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                veto: false,
                events: events.clone(),
            })
        }

        fn record(&self, event: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.id, event));
        }
    }

    #[async_trait]
    impl TransactionMember for Recorder {
        fn member_id(&self) -> &str {
            &self.id
        }

        async fn commit_phase1(&self, _tx: &Transaction) -> bool {
            self.record("phase1");
            !self.veto
        }

        async fn commit_phase2(&self, _tx: &Transaction) {
            self.record("phase2");
        }

        async fn rollback(&self, _tx: &Transaction) {
            self.record("rollback");
        }

        async fn release(&self) {
            self.record("release");
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[test]
    fn test_transaction_id_format() {
        let tx = Transaction::new();
        assert!(tx.id().starts_with("tx_"));
        assert_eq!(tx.id().len(), 35);
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let events = Arc::default();
        let tx = Transaction::new();
        tx.register_member(Recorder::new("a", &events)).unwrap();
        let err = tx.register_member(Recorder::new("a", &events)).unwrap_err();
        assert!(matches!(err, SqlError::IllegalArgument { .. }));
        assert_eq!(tx.member_ids(), vec!["a".to_string()]);
    }

    #[test]
    fn test_typed_member_lookup() {
        let events = Arc::default();
        let tx = Transaction::new();
        tx.register_member(Recorder::new("a", &events)).unwrap();
        assert!(tx.member_as::<Recorder>("a").is_some());
        assert!(tx.member_as::<String>("a").is_none());
        assert!(tx.member("b").is_none());
    }

    #[tokio::test]
    async fn test_finish_success_commits_then_releases() {
        let events: Arc<StdMutex<Vec<String>>> = Arc::default();
        let tx = Transaction::new();
        tx.register_member(Recorder::new("a", &events)).unwrap();
        tx.register_member(Recorder::new("b", &events)).unwrap();

        tx.finish(true).await.unwrap();
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                "a:phase1", "b:phase1", "a:phase2", "b:phase2", "a:release", "b:release"
            ]
        );
        assert!(tx.member_ids().is_empty());

        // A second release finds nothing left to release.
        tx.release().await;
        assert_eq!(events.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_veto_rolls_back() {
        let events: Arc<StdMutex<Vec<String>>> = Arc::default();
        let tx = Transaction::new();
        tx.register_member(Arc::new(Recorder {
            id: "a".to_string(),
            veto: true,
            events: events.clone(),
        }))
        .unwrap();

        assert!(tx.finish(true).await.is_err());
        assert_eq!(
            *events.lock().unwrap(),
            vec!["a:phase1", "a:rollback", "a:release"]
        );
    }

    #[tokio::test]
    async fn test_failure_or_cancel_rolls_back() {
        let events: Arc<StdMutex<Vec<String>>> = Arc::default();
        let tx = Transaction::new();
        tx.register_member(Recorder::new("a", &events)).unwrap();
        tx.add_failure("boom");
        tx.finish(true).await.unwrap();
        assert_eq!(*events.lock().unwrap(), vec!["a:rollback", "a:release"]);

        let tx = Transaction::new();
        assert!(tx.cancel());
        assert!(!tx.cancel());
        let err = tx.register_member(Recorder::new("b", &events)).unwrap_err();
        assert!(matches!(err, SqlError::Cancelled { .. }));
    }
}
