//! In-process `JobRepository` backed by hash maps.

use std::collections::HashMap;

use ironbatch_types::checkpoint::{CheckpointData, CheckpointKey};
use ironbatch_types::error::RepositoryError;
use ironbatch_types::execution::{
    JobExecution, JobInstance, StepExecution, StepStatus, StepStatusKey,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::JobRepository;

#[derive(Default)]
struct Tables {
    instances: HashMap<Uuid, JobInstance>,
    executions: HashMap<Uuid, JobExecution>,
    /// Execution ids per instance, in creation order.
    executions_by_instance: HashMap<Uuid, Vec<Uuid>>,
    step_executions: Vec<StepExecution>,
    step_status: HashMap<StepStatusKey, StepStatus>,
    checkpoints: HashMap<CheckpointKey, CheckpointData>,
}

/// Non-durable repository. State lives as long as the value.
#[derive(Default)]
pub struct InMemoryJobRepository {
    tables: RwLock<Tables>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobRepository for InMemoryJobRepository {
    async fn create_job_instance(&self, instance: &JobInstance) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        if tables.instances.contains_key(&instance.id) {
            return Err(RepositoryError::Conflict(format!(
                "job instance {} already exists",
                instance.id
            )));
        }
        tables.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_job_instance(&self, id: &Uuid) -> Result<Option<JobInstance>, RepositoryError> {
        Ok(self.tables.read().await.instances.get(id).cloned())
    }

    async fn create_job_execution(&self, execution: &JobExecution) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        if !tables.instances.contains_key(&execution.instance_id) {
            return Err(RepositoryError::NotFound);
        }
        if tables.executions.contains_key(&execution.id) {
            return Err(RepositoryError::Conflict(format!(
                "job execution {} already exists",
                execution.id
            )));
        }
        tables.executions.insert(execution.id, execution.clone());
        tables
            .executions_by_instance
            .entry(execution.instance_id)
            .or_default()
            .push(execution.id);
        Ok(())
    }

    async fn update_job_execution(&self, execution: &JobExecution) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        match tables.executions.get_mut(&execution.id) {
            Some(stored) => {
                *stored = execution.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn get_job_execution(&self, id: &Uuid) -> Result<Option<JobExecution>, RepositoryError> {
        Ok(self.tables.read().await.executions.get(id).cloned())
    }

    async fn list_job_executions(
        &self,
        instance_id: &Uuid,
    ) -> Result<Vec<JobExecution>, RepositoryError> {
        let tables = self.tables.read().await;
        let ids = tables
            .executions_by_instance
            .get(instance_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| tables.executions.get(id).cloned())
            .collect())
    }

    async fn most_recent_execution(
        &self,
        instance_id: &Uuid,
    ) -> Result<Option<JobExecution>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .executions_by_instance
            .get(instance_id)
            .and_then(|ids| ids.last())
            .and_then(|id| tables.executions.get(id).cloned()))
    }

    async fn create_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        if !tables.executions.contains_key(&step.job_execution_id) {
            return Err(RepositoryError::NotFound);
        }
        tables.step_executions.push(step.clone());
        Ok(())
    }

    async fn update_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        match tables.step_executions.iter_mut().find(|s| s.id == step.id) {
            Some(stored) => {
                *stored = step.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list_step_executions(
        &self,
        job_execution_id: &Uuid,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        Ok(self
            .tables
            .read()
            .await
            .step_executions
            .iter()
            .filter(|s| s.job_execution_id == *job_execution_id)
            .cloned()
            .collect())
    }

    async fn get_step_status(
        &self,
        key: &StepStatusKey,
    ) -> Result<Option<StepStatus>, RepositoryError> {
        Ok(self.tables.read().await.step_status.get(key).cloned())
    }

    async fn upsert_step_status(&self, status: &StepStatus) -> Result<(), RepositoryError> {
        self.tables
            .write()
            .await
            .step_status
            .insert(status.key.clone(), status.clone());
        Ok(())
    }

    async fn get_checkpoint(
        &self,
        key: &CheckpointKey,
    ) -> Result<Option<CheckpointData>, RepositoryError> {
        Ok(self.tables.read().await.checkpoints.get(key).cloned())
    }

    async fn upsert_checkpoint(&self, data: &CheckpointData) -> Result<(), RepositoryError> {
        self.tables
            .write()
            .await
            .checkpoints
            .insert(data.key.clone(), data.clone());
        Ok(())
    }
}
