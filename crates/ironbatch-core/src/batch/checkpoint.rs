//! Checkpoint manager for chunk steps.
//!
//! Decides when a checkpoint interval is complete (through a
//! [`CheckpointAlgorithm`]) and persists the reader and writer restart tokens
//! through the `JobRepository` so a restarted step resumes after the last
//! committed interval.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ironbatch_types::checkpoint::{CheckpointData, CheckpointKey, CheckpointRole};
use ironbatch_types::error::RepositoryError;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::repository::JobRepository;

// ---------------------------------------------------------------------------
// CheckpointAlgorithm
// ---------------------------------------------------------------------------

/// Policy deciding where checkpoint boundaries fall.
pub trait CheckpointAlgorithm: Send + Sync {
    /// Transaction timeout for the next interval; `None` keeps the default.
    fn checkpoint_timeout(&self) -> anyhow::Result<Option<Duration>> {
        Ok(None)
    }

    fn begin_checkpoint(&mut self) -> anyhow::Result<()>;

    /// Called after every item read, with the number read in this interval.
    fn is_ready_to_checkpoint(&mut self, interval_items: u64) -> anyhow::Result<bool>;

    fn end_checkpoint(&mut self) -> anyhow::Result<()>;
}

/// Built-in item-count algorithm with an optional time limit.
#[derive(Debug, Clone)]
pub struct ItemCheckpointAlgorithm {
    item_count: u64,
    time_limit: Option<Duration>,
    interval_started: Instant,
}

impl ItemCheckpointAlgorithm {
    pub fn new(item_count: u32, time_limit: Option<Duration>) -> Self {
        Self {
            item_count: u64::from(item_count.max(1)),
            time_limit,
            interval_started: Instant::now(),
        }
    }
}

impl CheckpointAlgorithm for ItemCheckpointAlgorithm {
    fn begin_checkpoint(&mut self) -> anyhow::Result<()> {
        self.interval_started = Instant::now();
        Ok(())
    }

    fn is_ready_to_checkpoint(&mut self, interval_items: u64) -> anyhow::Result<bool> {
        if interval_items >= self.item_count {
            return Ok(true);
        }
        Ok(self
            .time_limit
            .is_some_and(|limit| self.interval_started.elapsed() >= limit))
    }

    fn end_checkpoint(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Every failure the checkpoint path can raise. Always fatal to the step.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint algorithm failed: {0}")]
    Algorithm(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("failed to serialize {role} checkpoint: {source}")]
    Serialize {
        role: CheckpointRole,
        #[source]
        source: serde_json::Error,
    },

    #[error("stored {role} checkpoint is unreadable: {source}")]
    Corrupt {
        role: CheckpointRole,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to persist {role} checkpoint: {source}")]
    Store {
        role: CheckpointRole,
        #[source]
        source: RepositoryError,
    },
}

impl CheckpointError {
    fn algorithm(error: anyhow::Error) -> Self {
        CheckpointError::Algorithm(error.into())
    }
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Tokens read back for a restart.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoredCheckpoint {
    pub reader: Option<Value>,
    pub writer: Option<Value>,
}

/// One checkpoint manager per step (or partition) execution.
///
/// Persistence through a single manager is totally ordered: each
/// [`checkpoint`](Self::checkpoint) call completes both writes before the
/// controller moves on to the next interval.
///
/// Tokens written by [`checkpoint`](Self::checkpoint) stay pending until the
/// interval's transaction commits. [`confirm`](Self::confirm) accepts them and
/// [`revert`](Self::revert) writes the last committed tokens back.
pub struct CheckpointManager<R: JobRepository> {
    repo: Arc<R>,
    algorithm: Box<dyn CheckpointAlgorithm>,
    execution_id: Uuid,
    reader_key: CheckpointKey,
    writer_key: CheckpointKey,
    committed: RestoredCheckpoint,
    pending: Option<RestoredCheckpoint>,
}

impl<R: JobRepository> CheckpointManager<R> {
    /// `step_id` is the partition-scoped id for partition executions.
    pub fn new(
        repo: Arc<R>,
        algorithm: Box<dyn CheckpointAlgorithm>,
        instance_id: Uuid,
        execution_id: Uuid,
        step_id: &str,
    ) -> Self {
        Self {
            repo,
            algorithm,
            execution_id,
            reader_key: CheckpointKey::new(instance_id, step_id, CheckpointRole::Reader),
            writer_key: CheckpointKey::new(instance_id, step_id, CheckpointRole::Writer),
            committed: RestoredCheckpoint::default(),
            pending: None,
        }
    }

    pub fn checkpoint_timeout(&self) -> Result<Option<Duration>, CheckpointError> {
        self.algorithm
            .checkpoint_timeout()
            .map_err(CheckpointError::algorithm)
    }

    pub fn begin_checkpoint(&mut self) -> Result<(), CheckpointError> {
        self.algorithm
            .begin_checkpoint()
            .map_err(CheckpointError::algorithm)
    }

    pub fn is_ready_to_checkpoint(&mut self, interval_items: u64) -> Result<bool, CheckpointError> {
        self.algorithm
            .is_ready_to_checkpoint(interval_items)
            .map_err(CheckpointError::algorithm)
    }

    pub fn end_checkpoint(&mut self) -> Result<(), CheckpointError> {
        self.algorithm
            .end_checkpoint()
            .map_err(CheckpointError::algorithm)
    }

    /// Persist both restart tokens, reader first, as pending.
    ///
    /// The two writes are independent: if the writer token fails to persist
    /// the reader token already stored stays in place and the error is
    /// returned. Call [`revert`](Self::revert) to put the committed tokens back.
    pub async fn checkpoint(
        &mut self,
        reader: Option<&Value>,
        writer: Option<&Value>,
    ) -> Result<(), CheckpointError> {
        self.pending = Some(RestoredCheckpoint {
            reader: reader.cloned(),
            writer: writer.cloned(),
        });
        self.persist(&self.reader_key, reader).await?;
        self.persist(&self.writer_key, writer).await?;

        tracing::debug!(
            execution_id = %self.execution_id,
            step_id = %self.reader_key.step_id,
            "checkpoint persisted"
        );
        Ok(())
    }

    /// The interval's transaction committed: the pending tokens are now the
    /// restart point.
    pub fn confirm(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.committed = pending;
        }
    }

    /// The interval's transaction did not commit: write the last committed
    /// tokens back over the pending ones. A no-op when nothing is pending.
    pub async fn revert(&mut self) -> Result<(), CheckpointError> {
        if self.pending.take().is_none() {
            return Ok(());
        }
        self.persist(&self.reader_key, self.committed.reader.as_ref())
            .await?;
        self.persist(&self.writer_key, self.committed.writer.as_ref())
            .await?;

        tracing::debug!(
            execution_id = %self.execution_id,
            step_id = %self.reader_key.step_id,
            "checkpoint reverted to last commit"
        );
        Ok(())
    }

    /// Read back the tokens of the last persisted checkpoint and treat them as
    /// committed.
    pub async fn restore(&mut self) -> Result<RestoredCheckpoint, CheckpointError> {
        let restored = RestoredCheckpoint {
            reader: self.load(&self.reader_key).await?,
            writer: self.load(&self.writer_key).await?,
        };
        self.committed = restored.clone();
        Ok(restored)
    }

    async fn persist(&self, key: &CheckpointKey, token: Option<&Value>) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec(&token).map_err(|source| CheckpointError::Serialize {
            role: key.role,
            source,
        })?;
        self.repo
            .upsert_checkpoint(&CheckpointData::new(key.clone(), bytes))
            .await
            .map_err(|source| CheckpointError::Store {
                role: key.role,
                source,
            })
    }

    async fn load(&self, key: &CheckpointKey) -> Result<Option<Value>, CheckpointError> {
        let stored = self
            .repo
            .get_checkpoint(key)
            .await
            .map_err(|source| CheckpointError::Store {
                role: key.role,
                source,
            })?;
        match stored {
            Some(data) => serde_json::from_slice::<Option<Value>>(&data.token).map_err(|source| {
                CheckpointError::Corrupt {
                    role: key.role,
                    source,
                }
            }),
            None => Ok(None),
        }
    }
}
