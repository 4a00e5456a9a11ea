//! Batchlet step body.

use ironbatch_types::status::BatchStatus;

use super::{PartitionReporter, StepError};
use crate::batch::artifact::{ArtifactContext, ArtifactError};
use crate::batch::context::BatchContext;
use crate::repository::JobRepository;

/// Invoke the batchlet once. A stop requested before or during the call
/// ends the step as stopped.
pub(crate) async fn run_batchlet<R: JobRepository>(
    ctx: &BatchContext<R>,
    artifact: &str,
    art_ctx: &ArtifactContext,
    reporter: Option<&mut PartitionReporter>,
) -> Result<BatchStatus, StepError> {
    if art_ctx.is_stop_requested() {
        return Ok(BatchStatus::Stopped);
    }

    let mut batchlet = ctx.artifacts.create_batchlet(artifact, art_ctx)?;
    let exit_status = batchlet
        .process()
        .await
        .map_err(|e| ArtifactError::fault("batchlet", artifact, e))?;
    if art_ctx.step.exit_status().is_none() {
        art_ctx.step.set_exit_status(exit_status);
    }

    if let Some(reporter) = reporter {
        reporter.collect().await?;
    }

    if art_ctx.is_stop_requested() {
        tracing::info!(step_id = %art_ctx.step_id, "batchlet returned after stop request");
        return Ok(BatchStatus::Stopped);
    }
    Ok(BatchStatus::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::controller::StepController;
    use crate::batch::controller::tests::{FixedBatchlet, harness};
    use crate::batch::registry::ArtifactRegistry;
    use ironbatch_types::model::StepModel;

    #[tokio::test]
    async fn stop_before_invocation_skips_batchlet() {
        let mut registry = ArtifactRegistry::new();
        registry.register_batchlet("ok", |_| Ok(FixedBatchlet("DONE".to_string())));
        let h = harness(registry).await;
        h.scope.stop.cancel();

        let outcome = StepController::new(h.ctx.clone(), h.scope.clone())
            .run(&StepModel::batchlet("s", "ok"))
            .await
            .unwrap();
        assert_eq!(outcome.batch_status, BatchStatus::Stopped);
        assert_eq!(outcome.exit_status, "STOPPED");
    }

    #[tokio::test]
    async fn artifact_exit_status_wins_over_return_value() {
        let mut registry = ArtifactRegistry::new();
        registry.register_batchlet("custom", |ctx: &ArtifactContext| {
            ctx.step.set_exit_status("CUSTOM");
            Ok(FixedBatchlet("IGNORED".to_string()))
        });
        let h = harness(registry).await;

        let outcome = StepController::new(h.ctx.clone(), h.scope.clone())
            .run(&StepModel::batchlet("s", "custom"))
            .await
            .unwrap();
        assert_eq!(outcome.batch_status, BatchStatus::Completed);
        assert_eq!(outcome.exit_status, "CUSTOM");
    }

    #[tokio::test]
    async fn unknown_batchlet_fails_step() {
        let h = harness(ArtifactRegistry::new()).await;
        let outcome = StepController::new(h.ctx.clone(), h.scope.clone())
            .run(&StepModel::batchlet("s", "missing"))
            .await
            .unwrap();
        assert_eq!(outcome.batch_status, BatchStatus::Failed);
    }
}
