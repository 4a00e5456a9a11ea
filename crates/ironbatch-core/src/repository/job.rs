//! Job repository trait definition.
//!
//! Defines the storage interface for job instances, job executions, step
//! executions, per-step restart status and checkpoint tokens. The
//! infrastructure layer (ironbatch-infra) implements this trait with SQLite
//! persistence.

use ironbatch_types::checkpoint::{CheckpointData, CheckpointKey};
use ironbatch_types::error::RepositoryError;
use ironbatch_types::execution::{
    JobExecution, JobInstance, StepExecution, StepStatus, StepStatusKey,
};
use uuid::Uuid;

/// Repository trait for batch kernel persistence.
///
/// Covers four entity families:
/// - **Instances / executions:** one instance per logical job, many executions each.
/// - **Step executions:** one record per entry into a step or partition.
/// - **Step status:** restart bookkeeping kept across executions of an instance.
/// - **Checkpoints:** opaque reader/writer tokens, upserted at interval boundaries.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait JobRepository: Send + Sync + 'static {
    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    fn create_job_instance(
        &self,
        instance: &JobInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_job_instance(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<JobInstance>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    fn create_job_execution(
        &self,
        execution: &JobExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace the stored execution record. Fails with `NotFound` when absent.
    fn update_job_execution(
        &self,
        execution: &JobExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_job_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<JobExecution>, RepositoryError>> + Send;

    /// All executions of an instance, oldest first.
    fn list_job_executions(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<JobExecution>, RepositoryError>> + Send;

    /// The most recently created execution of an instance.
    fn most_recent_execution(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<JobExecution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step executions
    // -----------------------------------------------------------------------

    fn create_step_execution(
        &self,
        step: &StepExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn update_step_execution(
        &self,
        step: &StepExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Step executions of one job execution, in creation order.
    fn list_step_executions(
        &self,
        job_execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepExecution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step status
    // -----------------------------------------------------------------------

    fn get_step_status(
        &self,
        key: &StepStatusKey,
    ) -> impl std::future::Future<Output = Result<Option<StepStatus>, RepositoryError>> + Send;

    fn upsert_step_status(
        &self,
        status: &StepStatus,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    fn get_checkpoint(
        &self,
        key: &CheckpointKey,
    ) -> impl std::future::Future<Output = Result<Option<CheckpointData>, RepositoryError>> + Send;

    fn upsert_checkpoint(
        &self,
        data: &CheckpointData,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
