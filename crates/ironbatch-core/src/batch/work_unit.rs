//! Parallel work units: partitions of a step and flows of a split.
//!
//! Units are built by [`WorkUnitBuilder`], run on their own tokio tasks by
//! [`dispatch`] and report through a bounded channel drained by
//! [`PartitionResultCollector`]. Every dispatched unit reports exactly one
//! [`PartitionMessage::Finished`], including units whose task panicked.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use ironbatch_types::error::RepositoryError;
use ironbatch_types::execution::StepStatusKey;
use ironbatch_types::model::{FlowModel, StepModel};
use ironbatch_types::partition::{PartitionPlan, PartitionResult};
use ironbatch_types::status::BatchStatus;
use serde_json::Value;
use tokio::sync::{Semaphore, mpsc};

use super::context::{BatchContext, ExecutionScope};
use super::controller::StepController;
use super::job_runner::{FlowOutcome, JobRunner};
use crate::repository::JobRepository;

/// Messages a work unit sends to its parent.
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionMessage {
    /// Collector data, sent at each checkpoint and when the unit finishes.
    Data { partition: u32, data: Value },
    /// Terminal result; always the last message from a unit.
    Finished(PartitionResult),
}

#[derive(Debug, Clone)]
pub enum WorkUnitKind {
    Partition {
        step: StepModel,
        properties: HashMap<String, String>,
        /// Ignore earlier records for this partition.
        fresh: bool,
    },
    SplitFlow {
        flow: FlowModel,
    },
}

/// One independently executable unit with its own execution scope.
pub struct WorkUnit<R: JobRepository> {
    kind: WorkUnitKind,
    index: u32,
    ctx: Arc<BatchContext<R>>,
    scope: ExecutionScope,
    results: mpsc::Sender<PartitionMessage>,
}

impl<R: JobRepository> WorkUnit<R> {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn kind(&self) -> &WorkUnitKind {
        &self.kind
    }

    pub fn scope(&self) -> &ExecutionScope {
        &self.scope
    }

    /// Run the unit to its terminal result.
    pub async fn run(self) -> PartitionResult {
        match &self.kind {
            WorkUnitKind::Partition {
                step,
                properties,
                fresh,
            } => {
                let controller = StepController::new(self.ctx.clone(), self.scope.clone());
                match controller
                    .run_partition(step, self.index, properties, *fresh, self.results.clone())
                    .await
                {
                    Ok(outcome) => PartitionResult {
                        partition: self.index,
                        batch_status: outcome.batch_status,
                        exit_status: Some(outcome.exit_status),
                        metrics: outcome.metrics,
                        persistent_user_data: outcome.persistent_user_data,
                    },
                    Err(error) => {
                        tracing::error!(
                            step_id = %step.id,
                            partition = self.index,
                            error = %error,
                            "partition failed"
                        );
                        PartitionResult::new(self.index, BatchStatus::Failed, None)
                    }
                }
            }
            WorkUnitKind::SplitFlow { flow } => {
                let runner = JobRunner::new(self.ctx.clone(), self.scope.clone());
                let outcome = runner
                    .run_elements(&flow.elements, flow.first.as_deref())
                    .await;
                let (batch_status, exit_status) = match outcome {
                    Ok(FlowOutcome::Exhausted { exit_status }) => {
                        (BatchStatus::Completed, Some(exit_status))
                    }
                    Ok(FlowOutcome::Ended { exit_status }) => (BatchStatus::Completed, exit_status),
                    Ok(FlowOutcome::Failed { exit_status }) => (BatchStatus::Failed, exit_status),
                    Ok(FlowOutcome::Stopped { exit_status, .. }) => {
                        (BatchStatus::Stopped, exit_status)
                    }
                    Err(error) => {
                        tracing::error!(flow_id = %flow.id, error = %error, "split flow failed");
                        (BatchStatus::Failed, None)
                    }
                };
                let exit_status = exit_status.or_else(|| Some(batch_status.to_string()));
                PartitionResult::new(self.index, batch_status, exit_status)
            }
        }
    }
}

/// Builds the work units of one partitioned step or split.
pub struct WorkUnitBuilder<R: JobRepository> {
    ctx: Arc<BatchContext<R>>,
    scope: ExecutionScope,
}

impl<R: JobRepository> WorkUnitBuilder<R> {
    pub fn new(ctx: Arc<BatchContext<R>>, scope: ExecutionScope) -> Self {
        Self { ctx, scope }
    }

    /// One unit per partition in `plan`, each starting from scratch.
    pub fn build_new_parallel_partitions(
        &self,
        step: &StepModel,
        plan: &PartitionPlan,
        results: &mpsc::Sender<PartitionMessage>,
    ) -> Vec<WorkUnit<R>> {
        (0..plan.partitions)
            .map(|index| self.partition_unit(step, plan, index, true, results))
            .collect()
    }

    /// Units for the `recorded` partitions of an earlier execution, leaving
    /// out those that already completed.
    pub async fn build_on_restart_parallel_partitions(
        &self,
        step: &StepModel,
        plan: &PartitionPlan,
        recorded: u32,
        results: &mpsc::Sender<PartitionMessage>,
    ) -> Result<Vec<WorkUnit<R>>, RepositoryError> {
        let mut units = Vec::new();
        for index in 0..recorded {
            let key = StepStatusKey::for_partition(self.scope.instance_id, &step.id, index);
            let completed = self
                .ctx
                .repo
                .get_step_status(&key)
                .await?
                .is_some_and(|status| status.batch_status == BatchStatus::Completed);
            if completed {
                tracing::debug!(step_id = %step.id, partition = index, "partition already completed");
                continue;
            }
            units.push(self.partition_unit(step, plan, index, false, results));
        }
        Ok(units)
    }

    pub fn build_new_flow_in_split_work_unit(
        &self,
        flow: &FlowModel,
        index: u32,
        results: &mpsc::Sender<PartitionMessage>,
    ) -> WorkUnit<R> {
        self.flow_unit(flow, index, self.scope.child(None), results)
    }

    /// Like [`build_new_flow_in_split_work_unit`](Self::build_new_flow_in_split_work_unit)
    /// but the flow's steps honor what earlier executions recorded.
    pub fn build_on_restart_flow_in_split_work_unit(
        &self,
        flow: &FlowModel,
        index: u32,
        results: &mpsc::Sender<PartitionMessage>,
    ) -> WorkUnit<R> {
        let mut scope = self.scope.child(None);
        scope.restart = true;
        self.flow_unit(flow, index, scope, results)
    }

    fn partition_unit(
        &self,
        step: &StepModel,
        plan: &PartitionPlan,
        index: u32,
        fresh: bool,
        results: &mpsc::Sender<PartitionMessage>,
    ) -> WorkUnit<R> {
        WorkUnit {
            kind: WorkUnitKind::Partition {
                step: step.clone(),
                properties: plan.properties_for(index),
                fresh,
            },
            index,
            ctx: self.ctx.clone(),
            scope: self.scope.child(Some(index)),
            results: results.clone(),
        }
    }

    fn flow_unit(
        &self,
        flow: &FlowModel,
        index: u32,
        scope: ExecutionScope,
        results: &mpsc::Sender<PartitionMessage>,
    ) -> WorkUnit<R> {
        WorkUnit {
            kind: WorkUnitKind::SplitFlow { flow: flow.clone() },
            index,
            ctx: self.ctx.clone(),
            scope,
            results: results.clone(),
        }
    }
}

/// Spawn every unit, running at most `threads` at once.
///
/// Each unit gets a supervisor task that waits on it and sends its
/// [`PartitionMessage::Finished`]; a unit whose task panics or is cancelled
/// is reported as abandoned. Returns the dispatched unit indices.
pub fn dispatch<R: JobRepository>(units: Vec<WorkUnit<R>>, threads: usize) -> Vec<u32> {
    let permits = Arc::new(Semaphore::new(threads.max(1)));
    let mut dispatched = Vec::with_capacity(units.len());

    for unit in units {
        let index = unit.index;
        let results = unit.results.clone();
        let permits = permits.clone();
        dispatched.push(index);

        let worker = tokio::spawn(async move {
            // The semaphore is never closed, so acquiring only waits.
            let _permit = permits.acquire_owned().await;
            unit.run().await
        });
        tokio::spawn(async move {
            let result = match worker.await {
                Ok(result) => result,
                Err(error) => {
                    tracing::warn!(partition = index, error = %error, "work unit terminated abnormally");
                    PartitionResult::abandoned(index)
                }
            };
            let _ = results.send(PartitionMessage::Finished(result)).await;
        });
    }
    dispatched
}

/// Drains a work-unit result channel until every expected unit has finished.
pub struct PartitionResultCollector {
    results: mpsc::Receiver<PartitionMessage>,
    pending: BTreeSet<u32>,
}

impl PartitionResultCollector {
    pub fn new(
        results: mpsc::Receiver<PartitionMessage>,
        expected: impl IntoIterator<Item = u32>,
    ) -> Self {
        Self {
            results,
            pending: expected.into_iter().collect(),
        }
    }

    /// Units that have not reported a final result yet.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Next message, or `None` once every expected unit has finished.
    ///
    /// If the channel closes while units are still pending, each of them is
    /// reported as abandoned so the caller always terminates.
    pub async fn next(&mut self) -> Option<PartitionMessage> {
        if self.pending.is_empty() {
            return None;
        }
        match self.results.recv().await {
            Some(PartitionMessage::Finished(result)) => {
                self.pending.remove(&result.partition);
                Some(PartitionMessage::Finished(result))
            }
            Some(data) => Some(data),
            None => {
                let index = self.pending.pop_first()?;
                tracing::warn!(partition = index, "work unit vanished without a result");
                Some(PartitionMessage::Finished(PartitionResult::abandoned(index)))
            }
        }
    }
}
