//! Running work inside a fresh unit of work bound to a server session.
//!
//! [`JobManager::run_now`] spawns the work on the runtime with a new
//! [`Transaction`], makes the [`JobContext`] available to it, and ends the
//! transaction when the work is done: commit on success, rollback on error or
//! panic. The caller awaits the outcome; a panic is resumed on the caller.

use crate::db::transaction::Transaction;
use crate::error::SqlError;
use crate::server::session::ServerSession;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

tokio::task_local! {
    static CURRENT_JOB: JobContext;
}

/// What a job runs with: its session and its unit of work.
#[derive(Debug, Clone)]
pub struct JobContext {
    name: String,
    session: Arc<ServerSession>,
    transaction: Arc<Transaction>,
}

impl JobContext {
    /// The context of the job running on the current task, if any.
    pub fn current() -> Option<JobContext> {
        CURRENT_JOB.try_with(Clone::clone).ok()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> &Arc<ServerSession> {
        &self.session
    }

    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.transaction
    }
}

/// Name and session for a job.
#[derive(Debug, Clone)]
pub struct JobInput {
    name: String,
    session: Arc<ServerSession>,
}

impl JobInput {
    pub fn new(name: impl Into<String>, session: Arc<ServerSession>) -> Self {
        Self {
            name: name.into(),
            session,
        }
    }
}

/// Schedules jobs and tracks the transactions of running ones.
#[derive(Debug, Default, Clone)]
pub struct JobManager {
    running: Arc<Mutex<HashMap<String, Arc<Transaction>>>>,
}

impl JobManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn running(&self) -> MutexGuard<'_, HashMap<String, Arc<Transaction>>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Transaction ids of the jobs currently running.
    pub fn running_jobs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cancel the transaction of a running job. Returns `false` if no such job runs.
    pub fn cancel(&self, transaction_id: &str) -> bool {
        match self.running().get(transaction_id) {
            Some(tx) => {
                tx.cancel();
                true
            }
            None => false,
        }
    }

    /// Run `work` in a new unit of work bound to the input's session and wait
    /// for it to finish.
    pub async fn run_now<T, E, F, Fut>(&self, input: JobInput, work: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<SqlError> + Send + 'static,
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let transaction = Arc::new(Transaction::new());
        let transaction_id = transaction.id().to_string();
        let context = JobContext {
            name: input.name,
            session: input.session,
            transaction: transaction.clone(),
        };
        debug!(
            job = %context.name,
            transaction_id = %transaction_id,
            session_id = %context.session.id(),
            "Job scheduled"
        );
        self.running()
            .insert(transaction_id.clone(), transaction.clone());

        let scoped = context.clone();
        let handle = tokio::spawn(CURRENT_JOB.scope(context, async move {
            let outcome = AssertUnwindSafe(work(scoped.clone())).catch_unwind().await;
            let tx = &scoped.transaction;
            match outcome {
                Ok(Ok(value)) => {
                    let had_failures = tx.has_failures();
                    tx.finish(true).await.map_err(E::from)?;
                    if had_failures {
                        return Err(E::from(SqlError::processing(format!(
                            "Transaction {} rolled back: {}",
                            tx.id(),
                            tx.failures().join("; ")
                        ))));
                    }
                    Ok(value)
                }
                Ok(Err(e)) => {
                    if let Err(finish_error) = tx.finish(false).await {
                        warn!(transaction_id = %tx.id(), error = %finish_error, "Rollback after job failure failed");
                    }
                    Err(e)
                }
                Err(panic) => {
                    let _ = tx.finish(false).await;
                    std::panic::resume_unwind(panic)
                }
            }
        }));

        let joined = handle.await;
        self.running().remove(&transaction_id);
        match joined {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => {
                std::panic::resume_unwind(join_error.into_panic())
            }
            Err(_) => Err(E::from(SqlError::cancelled(transaction_id))),
        }
    }
}
