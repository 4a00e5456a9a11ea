//! Job runner: walks a job (or flow) model element by element.
//!
//! Steps run through the [`StepController`], nested flows recurse, splits fan
//! their flows out as work units and decisions consult a decider artifact.
//! After each element the [`ModelNavigator`] picks the next one from the
//! element's exit status.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use ironbatch_types::event::BatchEvent;
use ironbatch_types::execution::StepExecution;
use ironbatch_types::model::{DecisionModel, ExecutionElement, JobModel, SplitModel};
use ironbatch_types::status::BatchStatus;
use tokio::sync::mpsc;

use super::artifact::{ArtifactError, StepContext};
use super::context::{BatchContext, ExecutionScope};
use super::controller::{StepController, StepError};
use super::navigator::{ModelNavigator, Navigation};
use super::work_unit::{PartitionMessage, PartitionResultCollector, WorkUnitBuilder, dispatch};
use crate::repository::JobRepository;

/// How a flow (or the job's top-level element list) ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowOutcome {
    /// Ran off the end of the flow; carries the last element's exit status.
    Exhausted { exit_status: String },
    Ended { exit_status: Option<String> },
    Failed { exit_status: Option<String> },
    Stopped {
        exit_status: Option<String>,
        restart: Option<String>,
    },
}

/// Final result of running a job model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub batch_status: BatchStatus,
    /// `None` defaults to the batch status name.
    pub exit_status: Option<String>,
    /// Element a restart should begin at.
    pub restart_position: Option<String>,
}

impl JobOutcome {
    pub fn failed() -> Self {
        Self {
            batch_status: BatchStatus::Failed,
            exit_status: None,
            restart_position: None,
        }
    }
}

impl From<FlowOutcome> for JobOutcome {
    fn from(outcome: FlowOutcome) -> Self {
        let (batch_status, exit_status, restart_position) = match outcome {
            FlowOutcome::Exhausted { exit_status } => {
                (BatchStatus::Completed, Some(exit_status), None)
            }
            FlowOutcome::Ended { exit_status } => (BatchStatus::Completed, exit_status, None),
            FlowOutcome::Failed { exit_status } => (BatchStatus::Failed, exit_status, None),
            FlowOutcome::Stopped {
                exit_status,
                restart,
            } => (BatchStatus::Stopped, exit_status, restart),
        };
        Self {
            batch_status,
            exit_status,
            restart_position,
        }
    }
}

enum ElementResult {
    /// Navigate on from this element.
    Continue {
        batch_status: BatchStatus,
        exit_status: String,
    },
    /// The enclosing flow is over.
    Terminate(FlowOutcome),
}

pub struct JobRunner<R: JobRepository> {
    ctx: Arc<BatchContext<R>>,
    scope: ExecutionScope,
}

impl<R: JobRepository> JobRunner<R> {
    pub fn new(ctx: Arc<BatchContext<R>>, scope: ExecutionScope) -> Self {
        Self { ctx, scope }
    }

    /// Run the whole job, starting at `restart_at` if it names a top-level
    /// element and at the first element otherwise.
    pub async fn run_job(
        &self,
        job: &JobModel,
        restart_at: Option<&str>,
    ) -> Result<JobOutcome, StepError> {
        let first = restart_at.filter(|id| job.elements.iter().any(|e| e.id() == *id));
        if restart_at.is_some() && first.is_none() {
            tracing::warn!(
                execution_id = %self.scope.execution_id,
                restart_at,
                "restart position is not a top-level element, starting from the top"
            );
        }
        let outcome = self.run_elements(&job.elements, first).await?;
        Ok(JobOutcome::from(outcome))
    }

    /// Run one sibling list until it terminates or runs out of elements.
    pub fn run_elements<'a>(
        &'a self,
        elements: &'a [ExecutionElement],
        first: Option<&'a str>,
    ) -> BoxFuture<'a, Result<FlowOutcome, StepError>> {
        async move {
            let navigator = ModelNavigator::with_first(elements, first);
            let mut current = navigator.first()?;
            let mut previous: Option<&ExecutionElement> = None;

            loop {
                if self.scope.stop.is_cancelled() {
                    return Ok(FlowOutcome::Stopped {
                        exit_status: None,
                        restart: None,
                    });
                }

                let (batch_status, exit_status) = match self.run_element(current, previous).await? {
                    ElementResult::Continue {
                        batch_status,
                        exit_status,
                    } => (batch_status, exit_status),
                    ElementResult::Terminate(outcome) => return Ok(outcome),
                };

                let navigation = match batch_status {
                    BatchStatus::Stopped | BatchStatus::Stopping => {
                        return Ok(FlowOutcome::Stopped {
                            exit_status: None,
                            restart: None,
                        });
                    }
                    BatchStatus::Failed | BatchStatus::Abandoned => {
                        match navigator.next_on_failure(current, &exit_status)? {
                            Some(navigation) => navigation,
                            None => return Ok(FlowOutcome::Failed { exit_status: None }),
                        }
                    }
                    _ => navigator.next(current, &exit_status)?,
                };

                match navigation {
                    Navigation::Next(next) => {
                        tracing::debug!(
                            execution_id = %self.scope.execution_id,
                            from = current.id(),
                            to = next.id(),
                            exit_status = %exit_status,
                            "transition"
                        );
                        previous = Some(current);
                        current = next;
                    }
                    Navigation::End { exit_status } => return Ok(FlowOutcome::Ended { exit_status }),
                    Navigation::Fail { exit_status } => {
                        return Ok(FlowOutcome::Failed { exit_status });
                    }
                    Navigation::Stop {
                        exit_status,
                        restart,
                    } => {
                        return Ok(FlowOutcome::Stopped {
                            exit_status,
                            restart,
                        });
                    }
                    Navigation::EndOfFlow => return Ok(FlowOutcome::Exhausted { exit_status }),
                }
            }
        }
        .boxed()
    }

    async fn run_element(
        &self,
        element: &ExecutionElement,
        previous: Option<&ExecutionElement>,
    ) -> Result<ElementResult, StepError> {
        match element {
            ExecutionElement::Step(step) => {
                let outcome = StepController::new(self.ctx.clone(), self.scope.clone())
                    .run(step)
                    .await?;
                Ok(ElementResult::Continue {
                    batch_status: outcome.batch_status,
                    exit_status: outcome.exit_status,
                })
            }
            ExecutionElement::Flow(flow) => {
                match self.run_elements(&flow.elements, flow.first.as_deref()).await? {
                    FlowOutcome::Exhausted { exit_status } => Ok(ElementResult::Continue {
                        batch_status: BatchStatus::Completed,
                        exit_status,
                    }),
                    terminated => Ok(ElementResult::Terminate(terminated)),
                }
            }
            ExecutionElement::Split(split) => self.run_split(split).await,
            ExecutionElement::Decision(decision) => self.run_decision(decision, previous).await,
        }
    }

    async fn run_split(&self, split: &SplitModel) -> Result<ElementResult, StepError> {
        let (results_tx, results_rx) =
            mpsc::channel(self.ctx.config.partition_result_capacity.max(1));
        let builder = WorkUnitBuilder::new(self.ctx.clone(), self.scope.clone());
        let units: Vec<_> = split
            .flows
            .iter()
            .zip(0u32..)
            .map(|(flow, index)| {
                if self.scope.restart {
                    builder.build_on_restart_flow_in_split_work_unit(flow, index, &results_tx)
                } else {
                    builder.build_new_flow_in_split_work_unit(flow, index, &results_tx)
                }
            })
            .collect();
        drop(results_tx);

        tracing::info!(
            execution_id = %self.scope.execution_id,
            split_id = %split.id,
            flows = units.len(),
            "running split"
        );
        let threads = units.len();
        let mut collector = PartitionResultCollector::new(results_rx, dispatch(units, threads));

        let mut failed = false;
        let mut stopped = false;
        while let Some(message) = collector.next().await {
            let PartitionMessage::Finished(result) = message else {
                continue;
            };
            failed |= result.is_failure();
            stopped |= result.batch_status == BatchStatus::Stopped;
            self.ctx.events.publish(BatchEvent::PartitionFinished {
                execution_id: self.scope.execution_id,
                step_id: split.id.clone(),
                partition: result.partition,
                batch_status: result.batch_status,
            });
        }

        if failed {
            return Ok(ElementResult::Terminate(FlowOutcome::Failed { exit_status: None }));
        }
        if stopped || self.scope.stop.is_cancelled() {
            return Ok(ElementResult::Terminate(FlowOutcome::Stopped {
                exit_status: None,
                restart: None,
            }));
        }
        Ok(ElementResult::Continue {
            batch_status: BatchStatus::Completed,
            exit_status: BatchStatus::Completed.to_string(),
        })
    }

    async fn run_decision(
        &self,
        decision: &DecisionModel,
        previous: Option<&ExecutionElement>,
    ) -> Result<ElementResult, StepError> {
        let executions = match previous {
            Some(element) => self.previous_executions(element).await?,
            None => Vec::new(),
        };
        let art_ctx = self.scope.artifact_context(
            &decision.id,
            &HashMap::new(),
            &HashMap::new(),
            StepContext::default(),
        );
        let mut decider = self.ctx.artifacts.create_decider(&decision.decider, &art_ctx)?;
        let exit_status = decider
            .decide(executions)
            .await
            .map_err(|e| ArtifactError::fault("decider", &decision.decider, e))?;

        tracing::info!(
            execution_id = %self.scope.execution_id,
            decision_id = %decision.id,
            exit_status = %exit_status,
            "decision made"
        );
        Ok(ElementResult::Continue {
            batch_status: BatchStatus::Completed,
            exit_status,
        })
    }

    /// Step executions of this job execution belonging to `element`.
    async fn previous_executions(
        &self,
        element: &ExecutionElement,
    ) -> Result<Vec<StepExecution>, StepError> {
        let mut step_ids = HashSet::new();
        collect_step_ids(element, &mut step_ids);
        let executions = self
            .ctx
            .repo
            .list_step_executions(&self.scope.execution_id)
            .await?;
        Ok(executions
            .into_iter()
            .filter(|execution| step_ids.contains(execution.step_id.as_str()))
            .collect())
    }
}

fn collect_step_ids<'a>(element: &'a ExecutionElement, ids: &mut HashSet<&'a str>) {
    match element {
        ExecutionElement::Step(step) => {
            ids.insert(step.id.as_str());
        }
        ExecutionElement::Flow(flow) => {
            for element in &flow.elements {
                collect_step_ids(element, ids);
            }
        }
        ExecutionElement::Split(split) => {
            for flow in &split.flows {
                for element in &flow.elements {
                    collect_step_ids(element, ids);
                }
            }
        }
        ExecutionElement::Decision(_) => {}
    }
}
