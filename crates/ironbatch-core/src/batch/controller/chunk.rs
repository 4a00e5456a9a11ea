//! Chunk step body.
//!
//! Items are read and processed one at a time and buffered until the
//! checkpoint algorithm reports the interval complete, then written as one
//! list. Each interval runs inside its own transaction: the writer's output,
//! the reader and writer restart tokens, and the commit either all happen or
//! the interval is rolled back.

use std::time::Duration;

use ironbatch_types::config::KernelConfig;
use ironbatch_types::event::BatchEvent;
use ironbatch_types::execution::StepMetrics;
use ironbatch_types::model::{CheckpointPolicy, ChunkModel};
use ironbatch_types::status::BatchStatus;
use serde_json::Value;

use super::{PartitionReporter, StepError};
use crate::batch::artifact::{
    ArtifactContext, ArtifactError, ItemProcessor, ItemReader, ItemWriter,
};
use crate::batch::checkpoint::{
    CheckpointAlgorithm, CheckpointManager, ItemCheckpointAlgorithm, RestoredCheckpoint,
};
use crate::batch::context::BatchContext;
use crate::batch::retry::{FaultAction, FaultPhase, ItemFault, ItemFaultPolicy, LimitFaultPolicy};
use crate::batch::transaction::{TransactionAdapter, TransactionScope};
use crate::repository::JobRepository;

/// Step (or job) property overriding the transaction timeout, in seconds.
pub const TRANSACTION_TIMEOUT_PROPERTY: &str = "transaction.timeout";

/// The chunk artifacts for one step execution plus its running counters.
struct ChunkItems<'a> {
    chunk: &'a ChunkModel,
    reader: Box<dyn ItemReader>,
    processor: Option<Box<dyn ItemProcessor>>,
    writer: Box<dyn ItemWriter>,
    policy: Box<dyn ItemFaultPolicy>,
    metrics: StepMetrics,
}

struct Interval {
    read: u64,
    written: u64,
    end_of_data: bool,
}

impl ChunkItems<'_> {
    async fn open(&mut self, restored: RestoredCheckpoint) -> Result<(), StepError> {
        self.reader
            .open(restored.reader)
            .await
            .map_err(|e| ArtifactError::fault("reader", &self.chunk.reader, e))?;
        self.writer
            .open(restored.writer)
            .await
            .map_err(|e| ArtifactError::fault("writer", &self.chunk.writer, e))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StepError> {
        let reader = self
            .reader
            .close()
            .await
            .map_err(|e| ArtifactError::fault("reader", &self.chunk.reader, e));
        let writer = self
            .writer
            .close()
            .await
            .map_err(|e| ArtifactError::fault("writer", &self.chunk.writer, e));
        reader?;
        writer?;
        Ok(())
    }

    async fn read(&mut self, interval_items: u64) -> Result<Option<Value>, StepError> {
        loop {
            let error = match self.reader.read_item().await {
                Ok(item) => {
                    if item.is_some() {
                        self.metrics.read_count += 1;
                    }
                    return Ok(item);
                }
                Err(error) => error,
            };
            match self.policy.on_fault(&ItemFault {
                phase: FaultPhase::Read,
                error: &error,
                interval_items,
            }) {
                FaultAction::Retry => continue,
                FaultAction::Skip => self.metrics.read_skip_count += 1,
                FaultAction::Fail => {
                    return Err(ArtifactError::fault("reader", &self.chunk.reader, error).into());
                }
            }
        }
    }

    async fn process(&mut self, item: Value, interval_items: u64) -> Result<Option<Value>, StepError> {
        let Some(processor) = self.processor.as_mut() else {
            return Ok(Some(item));
        };
        loop {
            let error = match processor.process_item(item.clone()).await {
                Ok(Some(output)) => return Ok(Some(output)),
                Ok(None) => {
                    self.metrics.filter_count += 1;
                    return Ok(None);
                }
                Err(error) => error,
            };
            match self.policy.on_fault(&ItemFault {
                phase: FaultPhase::Process,
                error: &error,
                interval_items,
            }) {
                FaultAction::Retry => continue,
                FaultAction::Skip => {
                    self.metrics.process_skip_count += 1;
                    return Ok(None);
                }
                FaultAction::Fail => {
                    let name = self.chunk.processor.as_deref().unwrap_or_default();
                    return Err(ArtifactError::fault("processor", name, error).into());
                }
            }
        }
    }

    /// Write the buffered items; returns how many were written.
    async fn write(&mut self, buffer: Vec<Value>, interval_items: u64) -> Result<u64, StepError> {
        if buffer.is_empty() {
            return Ok(0);
        }
        loop {
            let error = match self.writer.write_items(buffer.clone()).await {
                Ok(()) => return Ok(buffer.len() as u64),
                Err(error) => error,
            };
            match self.policy.on_fault(&ItemFault {
                phase: FaultPhase::Write,
                error: &error,
                interval_items,
            }) {
                FaultAction::Retry => continue,
                FaultAction::Skip => {
                    self.metrics.write_skip_count += buffer.len() as u64;
                    return Ok(0);
                }
                FaultAction::Fail => {
                    return Err(ArtifactError::fault("writer", &self.chunk.writer, error).into());
                }
            }
        }
    }
}

/// Run a chunk step to completion, failure or stop.
///
/// `storage_step_id` is the id checkpoints are stored under (partition-scoped
/// for partitions). With `fresh_start` the stored checkpoints are ignored.
pub(crate) async fn run_chunk<R: JobRepository>(
    ctx: &BatchContext<R>,
    chunk: &ChunkModel,
    art_ctx: &ArtifactContext,
    storage_step_id: &str,
    fresh_start: bool,
    metrics: &mut StepMetrics,
    reporter: Option<&mut PartitionReporter>,
) -> Result<BatchStatus, StepError> {
    let registry = &ctx.artifacts;
    let mut items = ChunkItems {
        chunk,
        reader: registry.create_reader(&chunk.reader, art_ctx)?,
        processor: match &chunk.processor {
            Some(name) => Some(registry.create_processor(name, art_ctx)?),
            None => None,
        },
        writer: registry.create_writer(&chunk.writer, art_ctx)?,
        policy: match &chunk.fault_policy {
            Some(name) => registry.create_fault_policy(name, art_ctx)?,
            None => Box::new(LimitFaultPolicy::for_chunk(chunk)),
        },
        metrics: StepMetrics::default(),
    };
    let algorithm: Box<dyn CheckpointAlgorithm> = match &chunk.checkpoint {
        CheckpointPolicy::Item {
            item_count,
            time_limit_secs,
        } => Box::new(ItemCheckpointAlgorithm::new(
            *item_count,
            time_limit_secs.map(Duration::from_secs),
        )),
        CheckpointPolicy::Custom { algorithm } => {
            registry.create_checkpoint_algorithm(algorithm, art_ctx)?
        }
    };
    let mut checkpoints = CheckpointManager::new(
        ctx.repo.clone(),
        algorithm,
        art_ctx.instance_id,
        art_ctx.execution_id,
        storage_step_id,
    );
    let restored = if fresh_start {
        RestoredCheckpoint::default()
    } else {
        checkpoints.restore().await?
    };
    let mut tx = TransactionAdapter::new(
        ctx.transactions.clone(),
        transaction_timeout(art_ctx, &ctx.config),
    );

    let result = match items.open(restored).await {
        Ok(()) => {
            run_intervals(ctx, &mut items, &mut checkpoints, &mut tx, art_ctx, reporter).await
        }
        Err(error) => Err(error),
    };
    let closed = items.close().await;
    *metrics = items.metrics;

    let batch_status = result?;
    closed?;
    Ok(batch_status)
}

async fn run_intervals<R: JobRepository>(
    ctx: &BatchContext<R>,
    items: &mut ChunkItems<'_>,
    checkpoints: &mut CheckpointManager<R>,
    tx: &mut TransactionAdapter,
    art_ctx: &ArtifactContext,
    mut reporter: Option<&mut PartitionReporter>,
) -> Result<BatchStatus, StepError> {
    let default_timeout = tx.transaction_timeout();
    loop {
        if art_ctx.is_stop_requested() {
            tracing::info!(step_id = %art_ctx.step_id, "stop requested, ending at checkpoint boundary");
            return Ok(BatchStatus::Stopped);
        }
        let timeout = checkpoints.checkpoint_timeout()?.unwrap_or(default_timeout);
        tx.set_transaction_timeout(timeout);

        let interval = match run_interval(items, checkpoints, tx).await {
            Ok(interval) => interval,
            Err(error) => {
                items.metrics.rollback_count += 1;
                tracing::warn!(step_id = %art_ctx.step_id, error = %error, "checkpoint interval rolled back");
                return Err(error);
            }
        };
        items.metrics.commit_count += 1;
        items.metrics.write_count += interval.written;

        tracing::debug!(
            step_id = %art_ctx.step_id,
            items = interval.read,
            written = interval.written,
            "checkpoint committed"
        );
        ctx.events.publish(BatchEvent::CheckpointCommitted {
            execution_id: art_ctx.execution_id,
            step_id: art_ctx.step_id.clone(),
            partition: art_ctx.partition,
            items: interval.read,
        });
        if let Some(reporter) = reporter.as_deref_mut() {
            reporter.collect().await?;
        }

        if interval.end_of_data {
            return Ok(BatchStatus::Completed);
        }
    }
}

/// One checkpoint interval. Any error drops the transaction scope, which
/// rolls the interval back, and puts the last committed checkpoint back.
async fn run_interval<R: JobRepository>(
    items: &mut ChunkItems<'_>,
    checkpoints: &mut CheckpointManager<R>,
    tx: &mut TransactionAdapter,
) -> Result<Interval, StepError> {
    let scope = tx.scope().await?;
    checkpoints.begin_checkpoint()?;
    items.policy.begin_interval();

    let mut buffer = Vec::new();
    let mut read = 0u64;
    let mut end_of_data = false;
    loop {
        let Some(item) = items.read(read).await? else {
            end_of_data = true;
            break;
        };
        read += 1;
        if let Some(output) = items.process(item, read).await? {
            buffer.push(output);
        }
        if checkpoints.is_ready_to_checkpoint(read)? {
            break;
        }
    }

    let written = items.write(buffer, read).await?;
    let reader_token = items
        .reader
        .checkpoint_info()
        .await
        .map_err(|e| ArtifactError::fault("reader", &items.chunk.reader, e))?;
    let writer_token = items
        .writer
        .checkpoint_info()
        .await
        .map_err(|e| ArtifactError::fault("writer", &items.chunk.writer, e))?;
    if let Err(error) = commit_interval(checkpoints, scope, reader_token, writer_token).await {
        if let Err(revert) = checkpoints.revert().await {
            tracing::error!(error = %revert, "failed to restore checkpoint of rolled back interval");
        }
        return Err(error);
    }
    checkpoints.confirm();

    Ok(Interval {
        read,
        written,
        end_of_data,
    })
}

/// Persist the restart tokens and commit. The tokens only become the restart
/// point once the commit succeeds.
async fn commit_interval<R: JobRepository>(
    checkpoints: &mut CheckpointManager<R>,
    scope: TransactionScope<'_>,
    reader_token: Option<Value>,
    writer_token: Option<Value>,
) -> Result<(), StepError> {
    checkpoints
        .checkpoint(reader_token.as_ref(), writer_token.as_ref())
        .await?;
    checkpoints.end_checkpoint()?;
    scope.commit().await?;
    Ok(())
}

fn transaction_timeout(art_ctx: &ArtifactContext, config: &KernelConfig) -> Duration {
    match art_ctx.property(TRANSACTION_TIMEOUT_PROPERTY) {
        Some(raw) => match raw.parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(_) => {
                tracing::warn!(
                    step_id = %art_ctx.step_id,
                    value = raw,
                    "ignoring invalid transaction timeout"
                );
                config.default_transaction_timeout()
            }
        },
        None => config.default_transaction_timeout(),
    }
}
