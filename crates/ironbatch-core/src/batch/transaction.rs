//! Transaction adapter for chunk checkpoint intervals.
//!
//! The kernel talks to an external [`TransactionManager`] through a
//! per-controller [`TransactionAdapter`]. Each checkpoint interval runs inside
//! a [`TransactionScope`]; a scope that is dropped without committing rolls
//! its transaction back, so early returns and faults always release it.
//!
//! Transactions follow the same drop contract as `sqlx::Transaction`: dropping
//! an active transaction rolls it back.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::future::{BoxFuture, FutureExt};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    NoTransaction,
    Active,
    MarkedRollback,
    Committed,
    RolledBack,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionStatus::NoTransaction => "no_transaction",
            TransactionStatus::Active => "active",
            TransactionStatus::MarkedRollback => "marked_rollback",
            TransactionStatus::Committed => "committed",
            TransactionStatus::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// One unit of transactional work.
///
/// Dropping a transaction that was neither committed nor rolled back must roll
/// it back.
pub trait Transaction: Send {
    fn commit(&mut self) -> BoxFuture<'_, anyhow::Result<()>>;

    fn rollback(&mut self) -> BoxFuture<'_, anyhow::Result<()>>;

    fn set_rollback_only(&mut self);

    fn status(&self) -> TransactionStatus;
}

pub trait TransactionManager: Send + Sync {
    fn begin(&self, timeout: Duration) -> BoxFuture<'_, anyhow::Result<Box<dyn Transaction>>>;
}

/// Returned by a provider when a transaction outlived its timeout.
#[derive(Debug, Error)]
#[error("transaction exceeded its {timeout:?} timeout")]
pub struct TransactionTimedOut {
    pub timeout: Duration,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("a transaction is already active")]
    AlreadyActive,

    #[error("no active transaction")]
    NoTransaction,

    #[error("transaction was marked rollback-only and has been rolled back")]
    RolledBackOnly,

    #[error("transaction timed out after {timeout:?} and was rolled back")]
    TimedOut { timeout: Duration },

    #[error("failed to begin transaction: {0}")]
    Begin(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("failed to commit transaction: {0}")]
    Commit(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("failed to roll back transaction: {0}")]
    Rollback(#[source] Box<dyn std::error::Error + Send + Sync>),
}

// ---------------------------------------------------------------------------
// TransactionAdapter
// ---------------------------------------------------------------------------

/// Holds at most one active transaction for a controller.
pub struct TransactionAdapter {
    manager: Arc<dyn TransactionManager>,
    current: Option<Box<dyn Transaction>>,
    timeout: Duration,
}

impl TransactionAdapter {
    pub fn new(manager: Arc<dyn TransactionManager>, timeout: Duration) -> Self {
        Self {
            manager,
            current: None,
            timeout,
        }
    }

    /// Applies to transactions begun after this call.
    pub fn set_transaction_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn transaction_timeout(&self) -> Duration {
        self.timeout
    }

    pub fn status(&self) -> TransactionStatus {
        self.current
            .as_ref()
            .map_or(TransactionStatus::NoTransaction, |tx| tx.status())
    }

    pub async fn begin(&mut self) -> Result<(), TransactionError> {
        if self.current.is_some() {
            return Err(TransactionError::AlreadyActive);
        }
        let tx = self
            .manager
            .begin(self.timeout)
            .await
            .map_err(|e| TransactionError::Begin(e.into()))?;
        self.current = Some(tx);
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<(), TransactionError> {
        let mut tx = self.current.take().ok_or(TransactionError::NoTransaction)?;
        if tx.status() == TransactionStatus::MarkedRollback {
            tx.rollback()
                .await
                .map_err(|e| TransactionError::Rollback(e.into()))?;
            return Err(TransactionError::RolledBackOnly);
        }
        tx.commit().await.map_err(|e| {
            if let Some(timed_out) = e.downcast_ref::<TransactionTimedOut>() {
                return TransactionError::TimedOut {
                    timeout: timed_out.timeout,
                };
            }
            TransactionError::Commit(e.into())
        })
    }

    /// Roll back the active transaction. A no-op when none is active.
    pub async fn rollback(&mut self) -> Result<(), TransactionError> {
        match self.current.take() {
            Some(mut tx) => tx
                .rollback()
                .await
                .map_err(|e| TransactionError::Rollback(e.into())),
            None => Ok(()),
        }
    }

    pub fn set_rollback_only(&mut self) {
        if let Some(tx) = self.current.as_mut() {
            tx.set_rollback_only();
        }
    }

    /// Begin a transaction and return a scope that owns it until commit.
    pub async fn scope(&mut self) -> Result<TransactionScope<'_>, TransactionError> {
        self.begin().await?;
        Ok(TransactionScope {
            adapter: self,
            finished: false,
        })
    }

    /// Drop the active transaction, relying on its rollback-on-drop contract.
    fn abandon(&mut self) {
        if let Some(mut tx) = self.current.take() {
            tx.set_rollback_only();
        }
    }
}

/// Scoped ownership of one transaction.
///
/// Call [`commit`](Self::commit) or [`rollback`](Self::rollback) to finish it;
/// dropping an unfinished scope rolls the transaction back.
pub struct TransactionScope<'a> {
    adapter: &'a mut TransactionAdapter,
    finished: bool,
}

impl TransactionScope<'_> {
    pub fn status(&self) -> TransactionStatus {
        self.adapter.status()
    }

    pub fn set_rollback_only(&mut self) {
        self.adapter.set_rollback_only();
    }

    pub async fn commit(mut self) -> Result<(), TransactionError> {
        self.finished = true;
        self.adapter.commit().await
    }

    pub async fn rollback(mut self) -> Result<(), TransactionError> {
        self.finished = true;
        self.adapter.rollback().await
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.adapter.abandon();
        }
    }
}

// ---------------------------------------------------------------------------
// LocalTransactionManager
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct TransactionCounters {
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

/// In-process transaction manager with no external resource.
///
/// Keeps commit/rollback counts and enforces the timeout at commit time: a
/// transaction committed after its deadline is rolled back instead.
#[derive(Debug, Clone, Default)]
pub struct LocalTransactionManager {
    counters: Arc<TransactionCounters>,
}

impl LocalTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begun(&self) -> u64 {
        self.counters.begun.load(Ordering::SeqCst)
    }

    pub fn committed(&self) -> u64 {
        self.counters.committed.load(Ordering::SeqCst)
    }

    pub fn rolled_back(&self) -> u64 {
        self.counters.rolled_back.load(Ordering::SeqCst)
    }
}

impl TransactionManager for LocalTransactionManager {
    fn begin(&self, timeout: Duration) -> BoxFuture<'_, anyhow::Result<Box<dyn Transaction>>> {
        self.counters.begun.fetch_add(1, Ordering::SeqCst);
        let tx: Box<dyn Transaction> = Box::new(LocalTransaction {
            counters: self.counters.clone(),
            status: TransactionStatus::Active,
            deadline: Instant::now().checked_add(timeout),
            timeout,
        });
        futures_util::future::ready(Ok(tx)).boxed()
    }
}

struct LocalTransaction {
    counters: Arc<TransactionCounters>,
    status: TransactionStatus,
    /// `None` when the timeout is too large to represent.
    deadline: Option<Instant>,
    timeout: Duration,
}

impl LocalTransaction {
    fn is_open(&self) -> bool {
        matches!(
            self.status,
            TransactionStatus::Active | TransactionStatus::MarkedRollback
        )
    }

    fn mark_rolled_back(&mut self) {
        if self.is_open() {
            self.status = TransactionStatus::RolledBack;
            self.counters.rolled_back.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Transaction for LocalTransaction {
    fn commit(&mut self) -> BoxFuture<'_, anyhow::Result<()>> {
        async move {
            if !self.is_open() {
                anyhow::bail!("cannot commit a {} transaction", self.status);
            }
            if self.deadline.is_some_and(|deadline| Instant::now() > deadline) {
                self.mark_rolled_back();
                return Err(TransactionTimedOut {
                    timeout: self.timeout,
                }
                .into());
            }
            self.status = TransactionStatus::Committed;
            self.counters.committed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        .boxed()
    }

    fn rollback(&mut self) -> BoxFuture<'_, anyhow::Result<()>> {
        self.mark_rolled_back();
        futures_util::future::ready(Ok(())).boxed()
    }

    fn set_rollback_only(&mut self) {
        if self.status == TransactionStatus::Active {
            self.status = TransactionStatus::MarkedRollback;
        }
    }

    fn status(&self) -> TransactionStatus {
        self.status
    }
}

impl Drop for LocalTransaction {
    fn drop(&mut self) {
        self.mark_rolled_back();
    }
}
