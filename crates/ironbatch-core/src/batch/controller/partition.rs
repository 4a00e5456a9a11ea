//! Partitioned step body.
//!
//! The parent step builds one work unit per partition, dispatches them under
//! the plan's concurrency bound and drains the result channel until every
//! unit has reported. Collector data and final statuses go to the analyzer
//! (if declared) on this task, so the analyzer never runs concurrently with
//! itself.
//!
//! The step's batch status is decided by the kernel, not the analyzer: any
//! failed or abandoned partition makes it `FAILED`, otherwise any stopped
//! partition or a pending stop request makes it `STOPPED`, otherwise it is
//! `COMPLETED`. An analyzer cannot override `FAILED` or `STOPPED`; it can only
//! set the step's exit status through the shared step context.

use ironbatch_types::event::BatchEvent;
use ironbatch_types::execution::{StepMetrics, StepStatus};
use ironbatch_types::model::{PartitionModel, StepModel};
use ironbatch_types::partition::PartitionPlan;
use ironbatch_types::status::BatchStatus;
use tokio::sync::mpsc;

use super::{StepController, StepError};
use crate::batch::artifact::{ArtifactContext, ArtifactError};
use crate::batch::work_unit::{PartitionMessage, PartitionResultCollector, WorkUnitBuilder, dispatch};
use crate::repository::JobRepository;

pub(crate) async fn run_partitioned<R: JobRepository>(
    controller: &StepController<R>,
    step: &StepModel,
    model: &PartitionModel,
    art_ctx: &ArtifactContext,
    status: &mut StepStatus,
    fresh_start: bool,
    metrics: &mut StepMetrics,
) -> Result<BatchStatus, StepError> {
    let ctx = controller.context();
    let plan = match &model.mapper {
        Some(name) => {
            let mut mapper = ctx.artifacts.create_mapper(name, art_ctx)?;
            mapper
                .map_partitions()
                .await
                .map_err(|e| ArtifactError::fault("partition mapper", name, e))?
        }
        None => model.plan.clone().unwrap_or_else(|| PartitionPlan::new(0)),
    };

    let recorded = if fresh_start { None } else { status.num_partitions };
    let partitions = match recorded {
        Some(count) if !plan.override_on_restart => count,
        _ => plan.partitions,
    };

    let (results_tx, results_rx) = mpsc::channel(ctx.config.partition_result_capacity.max(1));
    let builder = WorkUnitBuilder::new(ctx.clone(), controller.scope().clone());
    let units = match recorded {
        Some(count) if !plan.override_on_restart => {
            builder
                .build_on_restart_parallel_partitions(step, &plan, count, &results_tx)
                .await?
        }
        _ => builder.build_new_parallel_partitions(step, &plan, &results_tx),
    };
    drop(results_tx);

    status.num_partitions = Some(partitions);
    ctx.repo.upsert_step_status(status).await?;

    let mut analyzer = match &model.analyzer {
        Some(name) => Some((name.as_str(), ctx.artifacts.create_analyzer(name, art_ctx)?)),
        None => None,
    };

    tracing::info!(
        execution_id = %art_ctx.execution_id,
        step_id = %step.id,
        partitions,
        to_run = units.len(),
        "dispatching partitions"
    );
    let dispatched = dispatch(units, plan.threads_for(partitions));
    let mut collector = PartitionResultCollector::new(results_rx, dispatched);

    let mut failed = false;
    let mut stopped = false;
    let mut analyzer_error: Option<ArtifactError> = None;
    while let Some(message) = collector.next().await {
        match message {
            PartitionMessage::Data { partition, data } => {
                let Some((name, analyzer)) = analyzer.as_mut() else {
                    continue;
                };
                if analyzer_error.is_some() {
                    continue;
                }
                if let Err(e) = analyzer.analyze_collector_data(data).await {
                    tracing::error!(step_id = %step.id, partition, error = %e, "analyzer rejected collector data");
                    analyzer_error = Some(ArtifactError::fault("partition analyzer", name, e));
                }
            }
            PartitionMessage::Finished(result) => {
                if result.batch_status == BatchStatus::Abandoned {
                    tracing::warn!(step_id = %step.id, partition = result.partition, "partition abandoned");
                }
                failed |= result.is_failure();
                stopped |= result.batch_status == BatchStatus::Stopped;
                metrics.absorb(&result.metrics);
                ctx.events.publish(BatchEvent::PartitionFinished {
                    execution_id: art_ctx.execution_id,
                    step_id: step.id.clone(),
                    partition: result.partition,
                    batch_status: result.batch_status,
                });

                let Some((name, analyzer)) = analyzer.as_mut() else {
                    continue;
                };
                if analyzer_error.is_some() {
                    continue;
                }
                if let Err(e) = analyzer
                    .analyze_status(result.batch_status, result.exit_status.clone())
                    .await
                {
                    tracing::error!(step_id = %step.id, partition = result.partition, error = %e, "analyzer rejected partition status");
                    analyzer_error = Some(ArtifactError::fault("partition analyzer", name, e));
                }
            }
        }
    }

    if let Some(error) = analyzer_error {
        return Err(error.into());
    }
    Ok(if failed {
        BatchStatus::Failed
    } else if stopped || art_ctx.is_stop_requested() {
        BatchStatus::Stopped
    } else {
        BatchStatus::Completed
    })
}
