//! Step controllers.
//!
//! [`StepController`] owns the bookkeeping every step shares: the restart
//! checks against the persisted [`StepStatus`], the start count, the
//! [`StepExecution`] record, and posting the final status. The step body is
//! delegated to one of the kind-specific controllers:
//! - `batchlet` -- a single task artifact invocation
//! - `chunk` -- read/process/write intervals under checkpoint and transaction control
//! - `partition` -- fan-out of a step over parallel partitions

pub mod batchlet;
pub mod chunk;
pub mod partition;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use ironbatch_types::error::RepositoryError;
use ironbatch_types::event::BatchEvent;
use ironbatch_types::execution::{StepExecution, StepMetrics, StepStatus, StepStatusKey};
use ironbatch_types::model::{StepKind, StepModel};
use ironbatch_types::status::BatchStatus;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use super::artifact::{ArtifactContext, ArtifactError, PartitionCollector, StepContext};
use super::checkpoint::CheckpointError;
use super::context::{BatchContext, ExecutionScope};
use super::navigator::NavigatorError;
use super::transaction::TransactionError;
use super::work_unit::PartitionMessage;
use crate::repository::JobRepository;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Everything that can go wrong while the kernel runs a step or walks a flow.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Navigation(#[from] NavigatorError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("step '{step_id}' reached its start limit of {limit}")]
    StartLimitExceeded { step_id: String, limit: u32 },

    #[error("illegal controller transition {from:?} -> {to:?}")]
    IllegalState {
        from: ControllerState,
        to: ControllerState,
    },
}

// ---------------------------------------------------------------------------
// Controller state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    NotStarted,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl ControllerState {
    pub fn start(self) -> Result<Self, StepError> {
        match self {
            ControllerState::NotStarted => Ok(ControllerState::Running),
            from => Err(StepError::IllegalState {
                from,
                to: ControllerState::Running,
            }),
        }
    }

    /// Move a running controller to the state matching the body's outcome.
    pub fn finish(self, batch_status: BatchStatus) -> Result<Self, StepError> {
        let to = match batch_status {
            BatchStatus::Completed => ControllerState::Completed,
            BatchStatus::Stopped | BatchStatus::Stopping => ControllerState::Stopped,
            _ => ControllerState::Failed,
        };
        match self {
            ControllerState::Running => Ok(to),
            from => Err(StepError::IllegalState { from, to }),
        }
    }

    pub fn batch_status(self) -> BatchStatus {
        match self {
            ControllerState::NotStarted => BatchStatus::Starting,
            ControllerState::Running => BatchStatus::Started,
            ControllerState::Completed => BatchStatus::Completed,
            ControllerState::Failed => BatchStatus::Failed,
            ControllerState::Stopped => BatchStatus::Stopped,
        }
    }
}

// ---------------------------------------------------------------------------
// Partition reporting
// ---------------------------------------------------------------------------

/// Passes a partition's collector data to the parent step's analyzer.
pub struct PartitionReporter {
    partition: u32,
    collector: Option<Box<dyn PartitionCollector>>,
    collector_name: String,
    results: mpsc::Sender<PartitionMessage>,
}

impl PartitionReporter {
    /// Invoke the collector (if any) and forward its data.
    pub async fn collect(&mut self) -> Result<(), StepError> {
        let Some(collector) = self.collector.as_mut() else {
            return Ok(());
        };
        let data: Option<Value> = collector
            .collect_partition_data()
            .await
            .map_err(|e| ArtifactError::fault("partition collector", &self.collector_name, e))?;
        if let Some(data) = data {
            // The parent only stops listening once every partition reported,
            // so a closed channel just means the step is already over.
            let _ = self
                .results
                .send(PartitionMessage::Data {
                    partition: self.partition,
                    data,
                })
                .await;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StepController
// ---------------------------------------------------------------------------

/// What the job runner learns about a finished (or skipped) step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub batch_status: BatchStatus,
    pub exit_status: String,
    /// `false` when a step completed by an earlier execution was skipped.
    pub executed: bool,
    pub metrics: StepMetrics,
    pub persistent_user_data: Option<Vec<u8>>,
}

pub struct StepController<R: JobRepository> {
    ctx: Arc<BatchContext<R>>,
    scope: ExecutionScope,
}

impl<R: JobRepository> StepController<R> {
    pub fn new(ctx: Arc<BatchContext<R>>, scope: ExecutionScope) -> Self {
        Self { ctx, scope }
    }

    pub fn context(&self) -> &Arc<BatchContext<R>> {
        &self.ctx
    }

    pub fn scope(&self) -> &ExecutionScope {
        &self.scope
    }

    /// Run a top-level (possibly partitioned) step.
    pub async fn run(&self, step: &StepModel) -> Result<StepOutcome, StepError> {
        let key = StepStatusKey::new(self.scope.instance_id, &step.id);
        self.execute(step, key, &HashMap::new(), false, None).await
    }

    /// Run partition `index` of a partitioned step.
    ///
    /// A `fresh` partition ignores whatever an earlier execution recorded for
    /// it (completion, checkpoints, user data) apart from its start count.
    pub async fn run_partition(
        &self,
        step: &StepModel,
        index: u32,
        properties: &HashMap<String, String>,
        fresh: bool,
        results: mpsc::Sender<PartitionMessage>,
    ) -> Result<StepOutcome, StepError> {
        let key = StepStatusKey::for_partition(self.scope.instance_id, &step.id, index);
        self.execute(step, key, properties, fresh, Some(results)).await
    }

    async fn execute(
        &self,
        step: &StepModel,
        key: StepStatusKey,
        extra_properties: &HashMap<String, String>,
        fresh: bool,
        results: Option<mpsc::Sender<PartitionMessage>>,
    ) -> Result<StepOutcome, StepError> {
        let repo = &self.ctx.repo;
        let partition = self.scope.partition_instance;
        let mut status = repo
            .get_step_status(&key)
            .await?
            .unwrap_or_else(|| StepStatus::new(key.clone()));

        if fresh {
            status.persistent_user_data = None;
        }

        let previously_completed =
            status.start_count > 0 && status.batch_status == BatchStatus::Completed;
        if previously_completed && !step.allow_start_if_complete && !fresh {
            tracing::info!(
                execution_id = %self.scope.execution_id,
                step_id = %key.step_id,
                "step already completed, skipping"
            );
            return Ok(StepOutcome {
                batch_status: BatchStatus::Completed,
                exit_status: status
                    .exit_status
                    .clone()
                    .unwrap_or_else(|| BatchStatus::Completed.to_string()),
                executed: false,
                metrics: StepMetrics::default(),
                persistent_user_data: status.persistent_user_data.clone(),
            });
        }
        if step.start_limit > 0 && status.start_count >= step.start_limit {
            return Err(StepError::StartLimitExceeded {
                step_id: key.step_id.clone(),
                limit: step.start_limit,
            });
        }

        let mut execution = StepExecution::new(self.scope.execution_id, &step.id, partition);
        execution.batch_status = BatchStatus::Started;
        status.start_count += 1;
        status.batch_status = BatchStatus::Started;
        status.exit_status = None;
        status.last_step_execution_id = Some(execution.id);
        repo.create_step_execution(&execution).await?;
        repo.upsert_step_status(&status).await?;

        tracing::info!(
            execution_id = %self.scope.execution_id,
            step_id = %key.step_id,
            start_count = status.start_count,
            "step started"
        );
        self.ctx.events.publish(BatchEvent::StepStarted {
            execution_id: self.scope.execution_id,
            step_id: step.id.clone(),
            partition,
        });

        let step_ctx = StepContext::with_user_data(status.persistent_user_data.clone());
        let art_ctx =
            self.scope
                .artifact_context(&step.id, &step.properties, extra_properties, step_ctx.clone());
        let mut metrics = StepMetrics::default();

        let state = ControllerState::NotStarted.start()?;
        let body = self
            .run_body(
                step,
                &key,
                &art_ctx,
                &mut status,
                fresh || previously_completed,
                &mut metrics,
                results,
            )
            .await;
        let batch_status = match body {
            Ok(batch_status) => batch_status,
            Err(error) => {
                tracing::error!(
                    execution_id = %self.scope.execution_id,
                    step_id = %key.step_id,
                    error = %error,
                    "step failed"
                );
                BatchStatus::Failed
            }
        };
        let batch_status = state.finish(batch_status)?.batch_status();
        let exit_status = step_ctx
            .exit_status()
            .unwrap_or_else(|| batch_status.to_string());
        let persistent_user_data = step_ctx.persistent_user_data();

        execution.batch_status = batch_status;
        execution.exit_status = Some(exit_status.clone());
        execution.ended_at = Some(Utc::now());
        execution.metrics = metrics;
        execution.persistent_user_data = persistent_user_data.clone();
        repo.update_step_execution(&execution).await?;

        status.batch_status = batch_status;
        status.exit_status = Some(exit_status.clone());
        status.persistent_user_data = persistent_user_data.clone();
        repo.upsert_step_status(&status).await?;

        tracing::info!(
            execution_id = %self.scope.execution_id,
            step_id = %key.step_id,
            batch_status = %batch_status,
            exit_status = %exit_status,
            "step finished"
        );
        self.ctx.events.publish(BatchEvent::StepFinished {
            execution_id: self.scope.execution_id,
            step_id: key.step_id.clone(),
            batch_status,
            exit_status: exit_status.clone(),
        });

        Ok(StepOutcome {
            batch_status,
            exit_status,
            executed: true,
            metrics,
            persistent_user_data,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_body(
        &self,
        step: &StepModel,
        key: &StepStatusKey,
        art_ctx: &ArtifactContext,
        status: &mut StepStatus,
        fresh_start: bool,
        metrics: &mut StepMetrics,
        results: Option<mpsc::Sender<PartitionMessage>>,
    ) -> Result<BatchStatus, StepError> {
        if let (Some(model), None) = (&step.partition, &results) {
            return partition::run_partitioned(self, step, model, art_ctx, status, fresh_start, metrics)
                .await;
        }

        let mut reporter = match results {
            Some(results) => Some(self.reporter(step, art_ctx, results)?),
            None => None,
        };
        match &step.kind {
            StepKind::Batchlet { artifact } => {
                batchlet::run_batchlet(&self.ctx, artifact, art_ctx, reporter.as_mut()).await
            }
            StepKind::Chunk(chunk) => {
                chunk::run_chunk(
                    &self.ctx,
                    chunk,
                    art_ctx,
                    &key.step_id,
                    fresh_start,
                    metrics,
                    reporter.as_mut(),
                )
                .await
            }
        }
    }

    fn reporter(
        &self,
        step: &StepModel,
        art_ctx: &ArtifactContext,
        results: mpsc::Sender<PartitionMessage>,
    ) -> Result<PartitionReporter, StepError> {
        let collector_name = step
            .partition
            .as_ref()
            .and_then(|p| p.collector.clone())
            .unwrap_or_default();
        let collector = if collector_name.is_empty() {
            None
        } else {
            Some(self.ctx.artifacts.create_collector(&collector_name, art_ctx)?)
        };
        Ok(PartitionReporter {
            partition: self.scope.partition_instance.unwrap_or_default(),
            collector,
            collector_name,
            results,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::batch::context::InMemoryModelResolver;
    use crate::batch::registry::ArtifactRegistry;
    use crate::batch::transaction::LocalTransactionManager;
    use crate::repository::InMemoryJobRepository;
    use futures_util::future::{BoxFuture, FutureExt};
    use ironbatch_types::config::KernelConfig;
    use ironbatch_types::execution::{JobExecution, JobInstance};
    use tokio_util::sync::CancellationToken;

    use crate::batch::artifact::Batchlet;

    /// Batchlet returning a fixed exit status, or failing when it is "FAIL".
    pub(crate) struct FixedBatchlet(pub String);

    impl Batchlet for FixedBatchlet {
        fn process(&mut self) -> BoxFuture<'_, anyhow::Result<String>> {
            let status = self.0.clone();
            async move {
                if status == "FAIL" {
                    anyhow::bail!("batchlet asked to fail");
                }
                Ok(status)
            }
            .boxed()
        }
    }

    pub(crate) struct Harness {
        pub ctx: Arc<BatchContext<InMemoryJobRepository>>,
        pub scope: ExecutionScope,
        pub transactions: LocalTransactionManager,
    }

    pub(crate) async fn harness(registry: ArtifactRegistry) -> Harness {
        harness_with_stop(registry, CancellationToken::new()).await
    }

    pub(crate) async fn harness_with_stop(
        registry: ArtifactRegistry,
        stop: CancellationToken,
    ) -> Harness {
        let repo = Arc::new(InMemoryJobRepository::new());
        let instance = JobInstance::new("job");
        let execution = JobExecution::new(&instance, HashMap::new());
        repo.create_job_instance(&instance).await.unwrap();
        repo.create_job_execution(&execution).await.unwrap();

        let transactions = LocalTransactionManager::new();
        let ctx = Arc::new(BatchContext::new(
            repo,
            Arc::new(InMemoryModelResolver::new()),
            Arc::new(registry),
            Arc::new(transactions.clone()),
            KernelConfig::default(),
        ));
        let scope = ExecutionScope {
            job_name: instance.job_name.clone(),
            instance_id: instance.id,
            execution_id: execution.id,
            parameters: HashMap::new(),
            job_properties: HashMap::new(),
            restart: false,
            stop,
            partition_instance: None,
        };
        Harness {
            ctx,
            scope,
            transactions,
        }
    }

    fn registry() -> ArtifactRegistry {
        let mut registry = ArtifactRegistry::new();
        registry.register_batchlet("ok", |_| Ok(FixedBatchlet("DONE".to_string())));
        registry.register_batchlet("fail", |_| Ok(FixedBatchlet("FAIL".to_string())));
        registry
    }

    #[test]
    fn controller_state_machine() {
        let running = ControllerState::NotStarted.start().unwrap();
        assert_eq!(running, ControllerState::Running);
        assert!(running.start().is_err());
        let done = running.finish(BatchStatus::Completed).unwrap();
        assert_eq!(done.batch_status(), BatchStatus::Completed);
        assert!(done.finish(BatchStatus::Failed).is_err());
        assert_eq!(
            ControllerState::Running.finish(BatchStatus::Abandoned).unwrap(),
            ControllerState::Failed
        );
    }

    #[tokio::test]
    async fn records_exit_status_and_start_count() {
        let h = harness(registry()).await;
        let controller = StepController::new(h.ctx.clone(), h.scope.clone());
        let step = StepModel::batchlet("s1", "ok");

        let outcome = controller.run(&step).await.unwrap();
        assert_eq!(outcome.batch_status, BatchStatus::Completed);
        assert_eq!(outcome.exit_status, "DONE");

        let key = StepStatusKey::new(h.scope.instance_id, "s1");
        let status = h.ctx.repo.get_step_status(&key).await.unwrap().unwrap();
        assert_eq!(status.start_count, 1);
        assert_eq!(status.exit_status.as_deref(), Some("DONE"));

        let executions = h.ctx.repo.list_step_executions(&h.scope.execution_id).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].batch_status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn completed_step_is_skipped_unless_allowed() {
        let h = harness(registry()).await;
        let controller = StepController::new(h.ctx.clone(), h.scope.clone());
        let mut step = StepModel::batchlet("s1", "ok");

        controller.run(&step).await.unwrap();
        let skipped = controller.run(&step).await.unwrap();
        assert!(!skipped.executed);
        assert_eq!(skipped.exit_status, "DONE");

        step.allow_start_if_complete = true;
        let rerun = controller.run(&step).await.unwrap();
        assert!(rerun.executed);

        let key = StepStatusKey::new(h.scope.instance_id, "s1");
        let status = h.ctx.repo.get_step_status(&key).await.unwrap().unwrap();
        assert_eq!(status.start_count, 2);
    }

    #[tokio::test]
    async fn failure_is_posted_and_start_limit_enforced() {
        let h = harness(registry()).await;
        let controller = StepController::new(h.ctx.clone(), h.scope.clone());
        let mut step = StepModel::batchlet("s1", "fail");
        step.start_limit = 2;

        for _ in 0..2 {
            let outcome = controller.run(&step).await.unwrap();
            assert_eq!(outcome.batch_status, BatchStatus::Failed);
            assert_eq!(outcome.exit_status, "FAILED");
        }
        let err = controller.run(&step).await.unwrap_err();
        assert!(matches!(err, StepError::StartLimitExceeded { limit: 2, .. }));

        let key = StepStatusKey::new(h.scope.instance_id, "s1");
        let status = h.ctx.repo.get_step_status(&key).await.unwrap().unwrap();
        assert_eq!(status.batch_status, BatchStatus::Failed);
        assert_eq!(status.start_count, 2);
    }
}
