//! Kernel service: the job execution API and the status store.
//!
//! The kernel is the only writer of [`JobExecution`] records. Every running
//! execution lives in a `DashMap` with its record behind a per-execution
//! `tokio::sync::Mutex`; the job itself runs on a spawned task watched by a
//! supervisor task, so a panic still ends in [`job_execution_done`] with a
//! failed outcome.
//!
//! [`job_execution_done`]: KernelService::job_execution_done

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use ironbatch_types::error::{RepositoryError, StatusTransitionError};
use ironbatch_types::event::BatchEvent;
use ironbatch_types::execution::{
    JobExecution, JobInstance, StepExecution, StepStatus, StepStatusKey,
};
use ironbatch_types::model::{FlowModel, JobModel, StepModel};
use ironbatch_types::partition::PartitionPlan;
use ironbatch_types::status::BatchStatus;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::callback::CompletionRegistry;
use super::context::{BatchContext, ExecutionScope};
use super::controller::StepError;
use super::job_runner::{JobOutcome, JobRunner};
use super::validate::{ModelError, validate_job};
use super::work_unit::{PartitionMessage, WorkUnit, WorkUnitBuilder};
use crate::repository::JobRepository;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("failed to resolve job '{job_name}': {source}")]
    Definition {
        job_name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("invalid job model: {0}")]
    Model(#[from] ModelError),

    #[error("no job named '{0}'")]
    NoSuchJob(String),

    #[error("no job execution {0}")]
    NoSuchExecution(Uuid),

    #[error("no job instance {0}")]
    NoSuchInstance(Uuid),

    #[error("job execution {0} already completed")]
    AlreadyComplete(Uuid),

    #[error("job execution {0} is not the most recent execution of its instance")]
    NotMostRecent(Uuid),

    #[error("job execution {execution_id} is still {status}")]
    StillRunning {
        execution_id: Uuid,
        status: BatchStatus,
    },

    #[error("job execution {0} was abandoned")]
    Abandoned(Uuid),

    #[error("job '{0}' is not restartable")]
    NotRestartable(String),

    #[error("job execution {execution_id} is not running ({status})")]
    NotRunning {
        execution_id: Uuid,
        status: BatchStatus,
    },

    #[error(transparent)]
    Transition(#[from] StatusTransitionError),

    #[error(transparent)]
    Step(#[from] StepError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Result of [`KernelService::wait_for_completion`]; both variants carry the
/// execution as re-read from the repository.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Finished(JobExecution),
    TimedOut(JobExecution),
}

impl WaitOutcome {
    pub fn execution(&self) -> &JobExecution {
        match self {
            WaitOutcome::Finished(execution) | WaitOutcome::TimedOut(execution) => execution,
        }
    }
}

// ---------------------------------------------------------------------------
// KernelService
// ---------------------------------------------------------------------------

struct RunningExecution {
    execution: Mutex<JobExecution>,
    scope: ExecutionScope,
}

struct KernelInner<R: JobRepository> {
    ctx: Arc<BatchContext<R>>,
    running: DashMap<Uuid, Arc<RunningExecution>>,
    completions: CompletionRegistry,
    restart_lock: Mutex<()>,
}

pub struct KernelService<R: JobRepository> {
    inner: Arc<KernelInner<R>>,
}

impl<R: JobRepository> Clone for KernelService<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: JobRepository> std::fmt::Debug for KernelService<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelService")
            .field("running", &self.inner.running.len())
            .field("completions", &self.inner.completions)
            .finish_non_exhaustive()
    }
}

impl<R: JobRepository> KernelService<R> {
    pub fn new(ctx: BatchContext<R>) -> Self {
        Self {
            inner: Arc::new(KernelInner {
                ctx: Arc::new(ctx),
                running: DashMap::new(),
                completions: CompletionRegistry::new(),
                restart_lock: Mutex::new(()),
            }),
        }
    }

    pub fn context(&self) -> &Arc<BatchContext<R>> {
        &self.inner.ctx
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.inner.ctx.events.subscribe()
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Start a new instance of `job_name`.
    pub async fn start_job(
        &self,
        job_name: &str,
        parameters: HashMap<String, String>,
    ) -> Result<Uuid, KernelError> {
        let model = self.resolve(job_name, &parameters)?;
        validate_job(&model)?;

        let repo = &self.inner.ctx.repo;
        let instance = JobInstance::new(job_name);
        let execution = JobExecution::new(&instance, parameters);
        repo.create_job_instance(&instance).await?;
        repo.create_job_execution(&execution).await?;

        let execution_id = execution.id;
        tracing::info!(
            %execution_id,
            instance_id = %instance.id,
            job_name,
            "job submitted"
        );
        self.launch(model, execution, false, None);
        Ok(execution_id)
    }

    /// Start a new execution of the instance `execution_id` belongs to.
    ///
    /// `overrides` replace parameters of the earlier execution. Nothing is
    /// written when the restart is refused.
    pub async fn restart_job(
        &self,
        execution_id: Uuid,
        overrides: HashMap<String, String>,
    ) -> Result<Uuid, KernelError> {
        let _guard = self.inner.restart_lock.lock().await;
        let repo = &self.inner.ctx.repo;

        let prior = repo
            .get_job_execution(&execution_id)
            .await?
            .ok_or(KernelError::NoSuchExecution(execution_id))?;
        match prior.batch_status {
            BatchStatus::Completed => return Err(KernelError::AlreadyComplete(execution_id)),
            BatchStatus::Abandoned => return Err(KernelError::Abandoned(execution_id)),
            status if !status.is_final() => {
                return Err(KernelError::StillRunning {
                    execution_id,
                    status,
                });
            }
            _ => {}
        }
        let most_recent = repo.most_recent_execution(&prior.instance_id).await?;
        if most_recent.map(|e| e.id) != Some(execution_id) {
            return Err(KernelError::NotMostRecent(execution_id));
        }

        let mut parameters = prior.parameters.clone();
        parameters.extend(overrides);
        let model = self.resolve(&prior.job_name, &parameters)?;
        validate_job(&model)?;
        if !model.restartable {
            return Err(KernelError::NotRestartable(prior.job_name.clone()));
        }
        let instance = repo
            .get_job_instance(&prior.instance_id)
            .await?
            .ok_or(KernelError::NoSuchInstance(prior.instance_id))?;

        let execution = JobExecution::new(&instance, parameters);
        repo.create_job_execution(&execution).await?;

        let restarted_id = execution.id;
        tracing::info!(
            execution_id = %restarted_id,
            prior_execution_id = %execution_id,
            instance_id = %instance.id,
            restart_position = prior.restart_position.as_deref(),
            "job restarted"
        );
        self.launch(model, execution, true, prior.restart_position);
        Ok(restarted_id)
    }

    /// Request a stop. The job ends at its next stop check.
    pub async fn stop_job(&self, execution_id: Uuid) -> Result<(), KernelError> {
        let Some(running) = self.running(&execution_id) else {
            let execution = self.get_job_execution(execution_id).await?;
            return Err(KernelError::NotRunning {
                execution_id,
                status: execution.batch_status,
            });
        };

        let mut execution = running.execution.lock().await;
        if !execution.batch_status.is_running() {
            return Err(KernelError::NotRunning {
                execution_id,
                status: execution.batch_status,
            });
        }
        execution.transition_to(BatchStatus::Stopping)?;
        self.inner.ctx.repo.update_job_execution(&execution).await?;
        drop(execution);

        running.scope.stop.cancel();
        tracing::info!(%execution_id, "stop requested");
        Ok(())
    }

    /// Mark a finished (or stopping) execution as never to be restarted.
    pub async fn abandon_job(&self, execution_id: Uuid) -> Result<(), KernelError> {
        if let Some(running) = self.running(&execution_id) {
            let mut execution = running.execution.lock().await;
            abandon(&mut execution)?;
            self.inner.ctx.repo.update_job_execution(&execution).await?;
        } else {
            let mut execution = self.get_job_execution(execution_id).await?;
            abandon(&mut execution)?;
            self.inner.ctx.repo.update_job_execution(&execution).await?;
        }
        tracing::info!(%execution_id, "job abandoned");
        Ok(())
    }

    /// Finalise an execution with the outcome of its job task.
    ///
    /// Runs at most once per execution; later calls are no-ops.
    pub async fn job_execution_done(&self, execution_id: Uuid, outcome: JobOutcome) {
        let Some((_, running)) = self.inner.running.remove(&execution_id) else {
            return;
        };

        let mut execution = running.execution.lock().await;
        if execution.batch_status != BatchStatus::Abandoned {
            let target = match (execution.batch_status, outcome.batch_status) {
                // A stop that arrived after the last element still counts.
                (BatchStatus::Stopping, BatchStatus::Completed) => BatchStatus::Stopped,
                (_, status) => status,
            };
            if let Some(exit_status) = &outcome.exit_status {
                execution.exit_status = Some(exit_status.clone());
            }
            if let Err(error) = drive_to(&mut execution, target) {
                tracing::warn!(%execution_id, error = %error, "forcing job execution to FAILED");
                // Every non-final state can move to FAILED directly.
                let _ = execution.transition_to(BatchStatus::Failed);
            }
            if execution.batch_status == BatchStatus::Stopped {
                execution.restart_position = outcome.restart_position;
            }
        }
        if let Err(error) = self.inner.ctx.repo.update_job_execution(&execution).await {
            tracing::error!(%execution_id, error = %error, "failed to persist final job status");
        }

        let batch_status = execution.batch_status;
        let exit_status = execution
            .exit_status
            .clone()
            .unwrap_or_else(|| batch_status.to_string());
        drop(execution);

        tracing::info!(
            %execution_id,
            batch_status = %batch_status,
            exit_status = %exit_status,
            "job finished"
        );
        self.inner.ctx.events.publish(BatchEvent::JobFinished {
            execution_id,
            batch_status,
            exit_status,
        });
        self.inner.completions.mark_completed(execution_id, batch_status);
    }

    // -- Lookups ------------------------------------------------------------

    pub async fn get_status(&self, execution_id: Uuid) -> Result<BatchStatus, KernelError> {
        Ok(self.get_job_execution(execution_id).await?.batch_status)
    }

    /// The live record for a running execution, the stored one otherwise.
    pub async fn get_job_execution(&self, execution_id: Uuid) -> Result<JobExecution, KernelError> {
        if let Some(running) = self.running(&execution_id) {
            return Ok(running.execution.lock().await.clone());
        }
        self.inner
            .ctx
            .repo
            .get_job_execution(&execution_id)
            .await?
            .ok_or(KernelError::NoSuchExecution(execution_id))
    }

    pub async fn get_job_instance(&self, instance_id: Uuid) -> Result<JobInstance, KernelError> {
        self.inner
            .ctx
            .repo
            .get_job_instance(&instance_id)
            .await?
            .ok_or(KernelError::NoSuchInstance(instance_id))
    }

    /// Executions of an instance, oldest first.
    pub async fn list_job_executions(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<JobExecution>, KernelError> {
        Ok(self.inner.ctx.repo.list_job_executions(&instance_id).await?)
    }

    pub async fn get_step_status(
        &self,
        instance_id: Uuid,
        step_id: &str,
    ) -> Result<Option<StepStatus>, KernelError> {
        let key = StepStatusKey::new(instance_id, step_id);
        Ok(self.inner.ctx.repo.get_step_status(&key).await?)
    }

    pub async fn list_step_executions(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<StepExecution>, KernelError> {
        Ok(self.inner.ctx.repo.list_step_executions(&execution_id).await?)
    }

    // -- Completion ---------------------------------------------------------

    /// Run `callback` once the execution is finalised (immediately if it
    /// already was in this process).
    pub fn on_completion<F>(&self, execution_id: Uuid, callback: F)
    where
        F: FnOnce(Uuid, BatchStatus) + Send + 'static,
    {
        self.inner.completions.on_completion(execution_id, callback);
    }

    pub fn on_any_completion<F>(&self, listener: F)
    where
        F: Fn(Uuid, BatchStatus) + Send + Sync + 'static,
    {
        self.inner.completions.subscribe_all(listener);
    }

    /// Wait up to `timeout` for the execution to finish.
    ///
    /// Waits in slices of at most the configured completion wait timeout and
    /// re-reads the execution after each one.
    pub async fn wait_for_completion(
        &self,
        execution_id: Uuid,
        timeout: Duration,
    ) -> Result<WaitOutcome, KernelError> {
        let start = Instant::now();
        let slice_limit = self.inner.ctx.config.completion_wait_timeout();
        loop {
            let execution = self.get_job_execution(execution_id).await?;
            let finalised = self.inner.completions.status(&execution_id).is_some()
                || (execution.batch_status.is_final() && self.running(&execution_id).is_none());
            if finalised {
                return Ok(WaitOutcome::Finished(execution));
            }

            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Ok(WaitOutcome::TimedOut(execution));
            }
            self.inner
                .completions
                .wait(execution_id, remaining.min(slice_limit))
                .await;
        }
    }

    // -- Work unit builders -------------------------------------------------

    pub fn build_new_parallel_partitions(
        &self,
        execution_id: Uuid,
        step: &StepModel,
        plan: &PartitionPlan,
        results: &mpsc::Sender<PartitionMessage>,
    ) -> Result<Vec<WorkUnit<R>>, KernelError> {
        Ok(self
            .builder(execution_id)?
            .build_new_parallel_partitions(step, plan, results))
    }

    pub async fn build_on_restart_parallel_partitions(
        &self,
        execution_id: Uuid,
        step: &StepModel,
        plan: &PartitionPlan,
        recorded: u32,
        results: &mpsc::Sender<PartitionMessage>,
    ) -> Result<Vec<WorkUnit<R>>, KernelError> {
        Ok(self
            .builder(execution_id)?
            .build_on_restart_parallel_partitions(step, plan, recorded, results)
            .await?)
    }

    pub fn build_new_flow_in_split_work_unit(
        &self,
        execution_id: Uuid,
        flow: &FlowModel,
        index: u32,
        results: &mpsc::Sender<PartitionMessage>,
    ) -> Result<WorkUnit<R>, KernelError> {
        Ok(self
            .builder(execution_id)?
            .build_new_flow_in_split_work_unit(flow, index, results))
    }

    pub fn build_on_restart_flow_in_split_work_unit(
        &self,
        execution_id: Uuid,
        flow: &FlowModel,
        index: u32,
        results: &mpsc::Sender<PartitionMessage>,
    ) -> Result<WorkUnit<R>, KernelError> {
        Ok(self
            .builder(execution_id)?
            .build_on_restart_flow_in_split_work_unit(flow, index, results))
    }

    // -- Internals ----------------------------------------------------------

    fn resolve(
        &self,
        job_name: &str,
        parameters: &HashMap<String, String>,
    ) -> Result<JobModel, KernelError> {
        self.inner
            .ctx
            .resolver
            .resolve(job_name, parameters)
            .map_err(|e| KernelError::Definition {
                job_name: job_name.to_string(),
                source: e.into(),
            })?
            .ok_or_else(|| KernelError::NoSuchJob(job_name.to_string()))
    }

    fn running(&self, execution_id: &Uuid) -> Option<Arc<RunningExecution>> {
        self.inner
            .running
            .get(execution_id)
            .map(|entry| entry.value().clone())
    }

    fn builder(&self, execution_id: Uuid) -> Result<WorkUnitBuilder<R>, KernelError> {
        let running = self
            .running(&execution_id)
            .ok_or(KernelError::NoSuchExecution(execution_id))?;
        Ok(WorkUnitBuilder::new(
            self.inner.ctx.clone(),
            running.scope.clone(),
        ))
    }

    /// Register the execution as running and spawn its job task plus the
    /// supervisor that finalises it.
    fn launch(
        &self,
        model: JobModel,
        execution: JobExecution,
        restart: bool,
        restart_at: Option<String>,
    ) {
        let execution_id = execution.id;
        let scope = ExecutionScope {
            job_name: execution.job_name.clone(),
            instance_id: execution.instance_id,
            execution_id,
            parameters: execution.parameters.clone(),
            job_properties: model.properties.clone(),
            restart,
            stop: CancellationToken::new(),
            partition_instance: None,
        };
        let running = Arc::new(RunningExecution {
            execution: Mutex::new(execution),
            scope,
        });
        self.inner.running.insert(execution_id, running.clone());

        let kernel = self.clone();
        let job = tokio::spawn(async move {
            kernel
                .run_execution(&running, &model, restart_at.as_deref())
                .await
        });

        let kernel = self.clone();
        tokio::spawn(async move {
            let outcome = match job.await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(error)) => {
                    tracing::error!(%execution_id, error = %error, "job execution failed");
                    JobOutcome::failed()
                }
                Err(error) => {
                    tracing::error!(%execution_id, error = %error, "job task terminated abnormally");
                    JobOutcome::failed()
                }
            };
            kernel.job_execution_done(execution_id, outcome).await;
        });
    }

    async fn run_execution(
        &self,
        running: &RunningExecution,
        model: &JobModel,
        restart_at: Option<&str>,
    ) -> Result<JobOutcome, KernelError> {
        let execution_id = running.scope.execution_id;
        {
            let mut execution = running.execution.lock().await;
            if execution.batch_status == BatchStatus::Stopping {
                return Ok(JobOutcome {
                    batch_status: BatchStatus::Stopped,
                    exit_status: None,
                    restart_position: None,
                });
            }
            execution.transition_to(BatchStatus::Started)?;
            self.inner.ctx.repo.update_job_execution(&execution).await?;
        }

        tracing::info!(%execution_id, job_name = %running.scope.job_name, "job started");
        self.inner.ctx.events.publish(BatchEvent::JobStarted {
            execution_id,
            job_name: running.scope.job_name.clone(),
            restart: running.scope.restart,
        });

        let runner = JobRunner::new(self.inner.ctx.clone(), running.scope.clone());
        Ok(runner.run_job(model, restart_at).await?)
    }
}

fn abandon(execution: &mut JobExecution) -> Result<(), KernelError> {
    if execution.batch_status.is_running() {
        return Err(KernelError::StillRunning {
            execution_id: execution.id,
            status: execution.batch_status,
        });
    }
    execution.transition_to(BatchStatus::Abandoned)?;
    Ok(())
}

/// Move to `target` through the intermediate states the lifecycle requires.
fn drive_to(execution: &mut JobExecution, target: BatchStatus) -> Result<(), StatusTransitionError> {
    use BatchStatus::*;
    match (execution.batch_status, target) {
        (Starting, Completed) => execution.transition_to(Started)?,
        (Starting | Started, Stopped) => execution.transition_to(Stopping)?,
        _ => {}
    }
    execution.transition_to(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::artifact::{ArtifactContext, Batchlet, ItemReader};
    use crate::batch::context::InMemoryModelResolver;
    use crate::batch::controller::chunk::tests::{CountingReader, RecordingWriter};
    use crate::batch::controller::tests::FixedBatchlet;
    use crate::batch::registry::ArtifactRegistry;
    use crate::batch::transaction::LocalTransactionManager;
    use crate::repository::InMemoryJobRepository;
    use futures_util::future::{BoxFuture, FutureExt};
    use ironbatch_types::config::KernelConfig;
    use ironbatch_types::model::{ChunkModel, ExecutionElement, Transition};
    use serde_json::Value;
    use tokio::sync::Notify;

    type Kernel = KernelService<InMemoryJobRepository>;

    const WAIT: Duration = Duration::from_secs(10);

    fn kernel(registry: ArtifactRegistry, models: Vec<JobModel>) -> Kernel {
        let mut resolver = InMemoryModelResolver::new();
        for model in models {
            resolver.insert(model);
        }
        KernelService::new(BatchContext::new(
            Arc::new(InMemoryJobRepository::new()),
            Arc::new(resolver),
            Arc::new(registry),
            Arc::new(LocalTransactionManager::new()),
            KernelConfig::default(),
        ))
    }

    fn job(id: &str, elements: Vec<ExecutionElement>) -> JobModel {
        JobModel {
            id: id.to_string(),
            restartable: true,
            properties: HashMap::new(),
            elements,
        }
    }

    /// Batchlet that blocks until released or stopped.
    struct GateBatchlet {
        entered: Arc<Notify>,
        release: Arc<Notify>,
        stop: CancellationToken,
    }

    impl Batchlet for GateBatchlet {
        fn process(&mut self) -> BoxFuture<'_, anyhow::Result<String>> {
            async move {
                self.entered.notify_one();
                tokio::select! {
                    _ = self.release.notified() => Ok("RELEASED".to_string()),
                    _ = self.stop.cancelled() => Ok("INTERRUPTED".to_string()),
                }
            }
            .boxed()
        }
    }

    struct PanickingBatchlet;

    impl Batchlet for PanickingBatchlet {
        fn process(&mut self) -> BoxFuture<'_, anyhow::Result<String>> {
            async move { panic!("batchlet blew up") }.boxed()
        }
    }

    struct Gate {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    fn registry() -> (ArtifactRegistry, Gate) {
        let gate = Gate {
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        };
        let mut registry = ArtifactRegistry::new();
        registry.register_batchlet("ok", |_| Ok(FixedBatchlet("DONE".to_string())));
        registry.register_batchlet("fail", |_| Ok(FixedBatchlet("FAIL".to_string())));
        registry.register_batchlet("panic", |_| Ok(PanickingBatchlet));
        let (entered, release) = (gate.entered.clone(), gate.release.clone());
        registry.register_batchlet("gate", move |ctx: &ArtifactContext| {
            Ok(GateBatchlet {
                entered: entered.clone(),
                release: release.clone(),
                stop: ctx.stop.clone(),
            })
        });
        (registry, gate)
    }

    async fn finished(kernel: &Kernel, execution_id: Uuid) -> JobExecution {
        match kernel.wait_for_completion(execution_id, WAIT).await.unwrap() {
            WaitOutcome::Finished(execution) => execution,
            WaitOutcome::TimedOut(execution) => panic!("timed out: {execution:?}"),
        }
    }

    #[tokio::test]
    async fn start_runs_to_completion_and_fires_callbacks() {
        let (registry, _gate) = registry();
        let kernel = kernel(
            registry,
            vec![job(
                "nightly",
                vec![
                    ExecutionElement::Step(StepModel::batchlet("a", "ok").then("b")),
                    ExecutionElement::Step(StepModel::batchlet("b", "ok")),
                ],
            )],
        );
        let mut events = kernel.subscribe();
        let id = kernel.start_job("nightly", HashMap::new()).await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        kernel.on_completion(id, move |_, status| {
            let _ = tx.send(status);
        });

        let execution = finished(&kernel, id).await;
        assert_eq!(execution.batch_status, BatchStatus::Completed);
        assert_eq!(execution.exit_status.as_deref(), Some("DONE"));
        assert!(execution.started_at.is_some() && execution.ended_at.is_some());
        assert_eq!(rx.await.unwrap(), BatchStatus::Completed);

        let first = events.recv().await.unwrap();
        assert!(matches!(first, BatchEvent::JobStarted { restart: false, .. }));
        assert_eq!(first.execution_id(), id);
        assert_eq!(kernel.list_step_executions(id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_job_and_invalid_model_are_rejected() {
        let (registry, _gate) = registry();
        let kernel = kernel(
            registry,
            vec![job("broken", vec![ExecutionElement::Step(
                StepModel::batchlet("a", "ok").then("ghost"),
            )])],
        );
        assert!(matches!(
            kernel.start_job("missing", HashMap::new()).await,
            Err(KernelError::NoSuchJob(_))
        ));
        assert!(matches!(
            kernel.start_job("broken", HashMap::new()).await,
            Err(KernelError::Model(ModelError::UnknownTarget { .. }))
        ));
    }

    #[tokio::test]
    async fn restart_of_completed_execution_changes_nothing() {
        let (registry, _gate) = registry();
        let kernel = kernel(
            registry,
            vec![job("once", vec![ExecutionElement::Step(StepModel::batchlet("a", "ok"))])],
        );
        let id = kernel.start_job("once", HashMap::new()).await.unwrap();
        let before = finished(&kernel, id).await;

        let err = kernel.restart_job(id, HashMap::new()).await.unwrap_err();
        assert!(matches!(err, KernelError::AlreadyComplete(e) if e == id));

        let executions = kernel.list_job_executions(before.instance_id).await.unwrap();
        assert_eq!(executions, vec![before.clone()]);
        let status = kernel.get_step_status(before.instance_id, "a").await.unwrap().unwrap();
        assert_eq!(status.start_count, 1);
    }

    #[tokio::test]
    async fn restart_increments_start_count_and_requires_most_recent() {
        let (registry, _gate) = registry();
        let kernel = kernel(
            registry,
            vec![job("flaky", vec![ExecutionElement::Step(StepModel::batchlet("a", "fail"))])],
        );
        let first = kernel.start_job("flaky", HashMap::new()).await.unwrap();
        let instance_id = finished(&kernel, first).await.instance_id;

        let mut latest = first;
        for _ in 0..3 {
            latest = kernel.restart_job(latest, HashMap::new()).await.unwrap();
            assert_eq!(finished(&kernel, latest).await.batch_status, BatchStatus::Failed);
        }

        let status = kernel.get_step_status(instance_id, "a").await.unwrap().unwrap();
        assert_eq!(status.start_count, 4);
        assert_eq!(kernel.list_job_executions(instance_id).await.unwrap().len(), 4);

        let err = kernel.restart_job(first, HashMap::new()).await.unwrap_err();
        assert!(matches!(err, KernelError::NotMostRecent(e) if e == first));
        assert!(matches!(
            kernel.restart_job(Uuid::now_v7(), HashMap::new()).await,
            Err(KernelError::NoSuchExecution(_))
        ));
    }

    #[tokio::test]
    async fn restart_merges_parameter_overrides() {
        let (registry, _gate) = registry();
        let kernel = kernel(
            registry,
            vec![job("flaky", vec![ExecutionElement::Step(StepModel::batchlet("a", "fail"))])],
        );
        let params = HashMap::from([
            ("date".to_string(), "2026-01-01".to_string()),
            ("mode".to_string(), "full".to_string()),
        ]);
        let first = kernel.start_job("flaky", params).await.unwrap();
        finished(&kernel, first).await;

        let overrides = HashMap::from([("mode".to_string(), "delta".to_string())]);
        let second = kernel.restart_job(first, overrides).await.unwrap();
        let execution = finished(&kernel, second).await;
        assert_eq!(execution.parameters["date"], "2026-01-01");
        assert_eq!(execution.parameters["mode"], "delta");
    }

    #[tokio::test]
    async fn stop_ends_running_job_and_restart_resumes() {
        let (registry, gate) = registry();
        let kernel = kernel(
            registry,
            vec![job(
                "gated",
                vec![
                    ExecutionElement::Step(StepModel::batchlet("a", "ok").then("b")),
                    ExecutionElement::Step(StepModel::batchlet("b", "gate")),
                ],
            )],
        );
        let id = kernel.start_job("gated", HashMap::new()).await.unwrap();
        gate.entered.notified().await;

        let running = kernel.get_job_execution(id).await.unwrap();
        assert_eq!(running.batch_status, BatchStatus::Started);
        assert!(matches!(
            kernel.restart_job(id, HashMap::new()).await,
            Err(KernelError::StillRunning { .. })
        ));
        let b = kernel.get_step_status(running.instance_id, "b").await.unwrap().unwrap();
        assert_eq!(b.batch_status, BatchStatus::Started);
        assert_eq!(b.exit_status, None);

        kernel.stop_job(id).await.unwrap();
        let stopped = finished(&kernel, id).await;
        assert_eq!(stopped.batch_status, BatchStatus::Stopped);
        assert!(matches!(
            kernel.stop_job(id).await,
            Err(KernelError::NotRunning {
                status: BatchStatus::Stopped,
                ..
            })
        ));
        let b = kernel.get_step_status(running.instance_id, "b").await.unwrap().unwrap();
        assert_eq!(b.exit_status.as_deref(), Some("INTERRUPTED"));

        let restarted = kernel.restart_job(id, HashMap::new()).await.unwrap();
        gate.entered.notified().await;
        gate.release.notify_one();
        let done = finished(&kernel, restarted).await;
        assert_eq!(done.batch_status, BatchStatus::Completed);
        assert_eq!(done.exit_status.as_deref(), Some("RELEASED"));

        let a = kernel.get_step_status(running.instance_id, "a").await.unwrap().unwrap();
        assert_eq!(a.start_count, 1);
    }

    #[tokio::test]
    async fn stop_transition_records_restart_position() {
        let (registry, _gate) = registry();
        let kernel = kernel(
            registry,
            vec![job(
                "staged",
                vec![
                    ExecutionElement::Step(
                        StepModel::batchlet("a", "ok")
                            .then("b")
                            .on(Transition::stop("DONE", None, Some("c"))),
                    ),
                    ExecutionElement::Step(StepModel::batchlet("b", "ok").then("c")),
                    ExecutionElement::Step(StepModel::batchlet("c", "ok")),
                ],
            )],
        );
        let id = kernel.start_job("staged", HashMap::new()).await.unwrap();
        let stopped = finished(&kernel, id).await;
        assert_eq!(stopped.batch_status, BatchStatus::Stopped);
        assert_eq!(stopped.restart_position.as_deref(), Some("c"));

        let restarted = kernel.restart_job(id, HashMap::new()).await.unwrap();
        assert_eq!(finished(&kernel, restarted).await.batch_status, BatchStatus::Completed);
        let steps: Vec<String> = kernel
            .list_step_executions(restarted)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.step_id)
            .collect();
        assert_eq!(steps, vec!["c"]);
    }

    #[tokio::test]
    async fn chunk_stop_mid_interval_waits_for_commit() {
        let reached = Arc::new(Notify::new());
        let resume = Arc::new(Notify::new());
        let writer = RecordingWriter::default();

        let (mut registry, _gate) = registry();
        let (r, s) = (reached.clone(), resume.clone());
        registry.register_reader("paused", move |_| {
            Ok(PausingReader {
                inner: CountingReader::new(9),
                pause_at: 2,
                reached: r.clone(),
                resume: s.clone(),
            })
        });
        let w = writer.clone();
        registry.register_writer("sink", move |_| Ok(w.clone()));
        let kernel = kernel(
            registry,
            vec![job(
                "nightly-load",
                vec![ExecutionElement::Step(StepModel::chunk(
                    "load",
                    ChunkModel::new("paused", "sink").item_count(3),
                ))],
            )],
        );

        let id = kernel.start_job("nightly-load", HashMap::new()).await.unwrap();
        reached.notified().await;
        let instance_id = kernel.get_job_execution(id).await.unwrap().instance_id;
        let status = kernel.get_step_status(instance_id, "load").await.unwrap().unwrap();
        assert_eq!(status.batch_status, BatchStatus::Started);
        assert_eq!(status.exit_status, None);

        kernel.stop_job(id).await.unwrap();
        resume.notify_one();
        let execution = finished(&kernel, id).await;
        assert_eq!(execution.batch_status, BatchStatus::Stopped);

        let lists = writer.written.lock().unwrap().clone();
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0].len(), 3);
        let status = kernel.get_step_status(instance_id, "load").await.unwrap().unwrap();
        assert_eq!(status.batch_status, BatchStatus::Stopped);
        assert_eq!(status.exit_status.as_deref(), Some("STOPPED"));
    }

    /// Reader that pauses once at `pause_at` until resumed.
    struct PausingReader {
        inner: CountingReader,
        pause_at: u64,
        reached: Arc<Notify>,
        resume: Arc<Notify>,
    }

    impl ItemReader for PausingReader {
        fn open(&mut self, checkpoint: Option<Value>) -> BoxFuture<'_, anyhow::Result<()>> {
            self.inner.open(checkpoint)
        }

        fn read_item(&mut self) -> BoxFuture<'_, anyhow::Result<Option<Value>>> {
            async move {
                let item = self.inner.read_item().await?;
                if item.as_ref().and_then(Value::as_u64) == Some(self.pause_at) {
                    self.reached.notify_one();
                    self.resume.notified().await;
                }
                Ok(item)
            }
            .boxed()
        }

        fn checkpoint_info(&mut self) -> BoxFuture<'_, anyhow::Result<Option<Value>>> {
            self.inner.checkpoint_info()
        }
    }

    #[tokio::test]
    async fn panicking_job_task_is_finalised_as_failed() {
        let (registry, _gate) = registry();
        let kernel = kernel(
            registry,
            vec![job("boom", vec![ExecutionElement::Step(StepModel::batchlet("a", "panic"))])],
        );
        let id = kernel.start_job("boom", HashMap::new()).await.unwrap();
        let execution = finished(&kernel, id).await;
        assert_eq!(execution.batch_status, BatchStatus::Failed);
        assert_eq!(execution.exit_status.as_deref(), Some("FAILED"));

        // The finalisation hook only takes effect once.
        kernel.job_execution_done(id, JobOutcome::failed()).await;
        assert_eq!(kernel.get_status(id).await.unwrap(), BatchStatus::Failed);
    }

    #[tokio::test]
    async fn abandoned_execution_cannot_restart() {
        let (registry, _gate) = registry();
        let kernel = kernel(
            registry,
            vec![job("flaky", vec![ExecutionElement::Step(StepModel::batchlet("a", "fail"))])],
        );
        let id = kernel.start_job("flaky", HashMap::new()).await.unwrap();
        finished(&kernel, id).await;

        kernel.abandon_job(id).await.unwrap();
        assert_eq!(kernel.get_status(id).await.unwrap(), BatchStatus::Abandoned);
        assert!(matches!(
            kernel.restart_job(id, HashMap::new()).await,
            Err(KernelError::Abandoned(_))
        ));
    }

    #[tokio::test]
    async fn non_restartable_job_is_refused() {
        let (registry, _gate) = registry();
        let mut model = job("strict", vec![ExecutionElement::Step(StepModel::batchlet("a", "fail"))]);
        model.restartable = false;
        let kernel = kernel(registry, vec![model]);
        let id = kernel.start_job("strict", HashMap::new()).await.unwrap();
        let execution = finished(&kernel, id).await;

        assert!(matches!(
            kernel.restart_job(id, HashMap::new()).await,
            Err(KernelError::NotRestartable(_))
        ));
        assert_eq!(kernel.list_job_executions(execution.instance_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn wait_times_out_while_running() {
        let (registry, gate) = registry();
        let kernel = kernel(
            registry,
            vec![job("gated", vec![ExecutionElement::Step(StepModel::batchlet("b", "gate"))])],
        );
        let id = kernel.start_job("gated", HashMap::new()).await.unwrap();
        gate.entered.notified().await;

        let outcome = kernel
            .wait_for_completion(id, Duration::from_millis(30))
            .await
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::TimedOut(_)));
        assert_eq!(outcome.execution().batch_status, BatchStatus::Started);

        let unit = kernel
            .build_new_flow_in_split_work_unit(
                id,
                &FlowModel::new("f", vec![ExecutionElement::Step(StepModel::batchlet("x", "ok"))]),
                0,
                &mpsc::channel(1).0,
            )
            .unwrap();
        assert_eq!(unit.scope().execution_id, id);

        gate.release.notify_one();
        assert_eq!(finished(&kernel, id).await.batch_status, BatchStatus::Completed);
        assert!(matches!(
            kernel.build_new_parallel_partitions(
                id,
                &StepModel::batchlet("x", "ok"),
                &PartitionPlan::new(1),
                &mpsc::channel(1).0
            ),
            Err(KernelError::NoSuchExecution(_))
        ));
    }
}
