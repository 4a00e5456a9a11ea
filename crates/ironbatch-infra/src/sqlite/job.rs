//! SQLite job repository implementation.
//!
//! Implements `JobRepository` from `ironbatch-core` using sqlx with split
//! read/write pools. Execution records keep an insertion sequence so that
//! "most recent" never depends on timestamp resolution; step status and
//! checkpoint tokens are upserted by their natural keys.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ironbatch_core::repository::JobRepository;
use ironbatch_types::checkpoint::{CheckpointData, CheckpointKey};
use ironbatch_types::error::RepositoryError;
use ironbatch_types::execution::{
    JobExecution, JobInstance, StepExecution, StepMetrics, StepStatus, StepStatusKey,
};
use ironbatch_types::status::BatchStatus;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `JobRepository`.
pub struct SqliteJobRepository {
    pool: DatabasePool,
}

impl SqliteJobRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

const EXECUTION_COLUMNS: &str = "id, instance_id, job_name, batch_status, exit_status, parameters, \
     restart_position, created_at, started_at, ended_at, last_updated";

const STEP_EXECUTION_COLUMNS: &str = "id, job_execution_id, step_id, partition_index, batch_status, \
     exit_status, started_at, ended_at, metrics, persistent_user_data";

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct JobExecutionRow {
    id: String,
    instance_id: String,
    job_name: String,
    batch_status: String,
    exit_status: Option<String>,
    parameters: String,
    restart_position: Option<String>,
    created_at: String,
    started_at: Option<String>,
    ended_at: Option<String>,
    last_updated: String,
}

impl JobExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            instance_id: row.try_get("instance_id")?,
            job_name: row.try_get("job_name")?,
            batch_status: row.try_get("batch_status")?,
            exit_status: row.try_get("exit_status")?,
            parameters: row.try_get("parameters")?,
            restart_position: row.try_get("restart_position")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            last_updated: row.try_get("last_updated")?,
        })
    }

    fn into_execution(self) -> Result<JobExecution, RepositoryError> {
        let parameters: HashMap<String, String> = serde_json::from_str(&self.parameters)
            .map_err(|e| RepositoryError::Query(format!("invalid parameters JSON: {e}")))?;

        Ok(JobExecution {
            id: parse_uuid(&self.id)?,
            instance_id: parse_uuid(&self.instance_id)?,
            job_name: self.job_name,
            batch_status: parse_status(&self.batch_status)?,
            exit_status: self.exit_status,
            parameters,
            created_at: parse_datetime(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            ended_at: self.ended_at.as_deref().map(parse_datetime).transpose()?,
            last_updated: parse_datetime(&self.last_updated)?,
            restart_position: self.restart_position,
        })
    }
}

struct StepExecutionRow {
    id: String,
    job_execution_id: String,
    step_id: String,
    partition_index: Option<i64>,
    batch_status: String,
    exit_status: Option<String>,
    started_at: String,
    ended_at: Option<String>,
    metrics: String,
    persistent_user_data: Option<Vec<u8>>,
}

impl StepExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            job_execution_id: row.try_get("job_execution_id")?,
            step_id: row.try_get("step_id")?,
            partition_index: row.try_get("partition_index")?,
            batch_status: row.try_get("batch_status")?,
            exit_status: row.try_get("exit_status")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            metrics: row.try_get("metrics")?,
            persistent_user_data: row.try_get("persistent_user_data")?,
        })
    }

    fn into_step_execution(self) -> Result<StepExecution, RepositoryError> {
        let metrics: StepMetrics = serde_json::from_str(&self.metrics)
            .map_err(|e| RepositoryError::Query(format!("invalid metrics JSON: {e}")))?;

        Ok(StepExecution {
            id: parse_uuid(&self.id)?,
            job_execution_id: parse_uuid(&self.job_execution_id)?,
            step_id: self.step_id,
            partition: self.partition_index.map(|p| p as u32),
            batch_status: parse_status(&self.batch_status)?,
            exit_status: self.exit_status,
            started_at: parse_datetime(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(parse_datetime).transpose()?,
            metrics,
            persistent_user_data: self.persistent_user_data,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_status(s: &str) -> Result<BatchStatus, RepositoryError> {
    s.parse::<BatchStatus>().map_err(RepositoryError::Query)
}

/// Map constraint violations onto the repository's error vocabulary.
fn map_write_error(e: sqlx::Error) -> RepositoryError {
    if let Some(db) = e.as_database_error() {
        if db.is_foreign_key_violation() {
            return RepositoryError::NotFound;
        }
        if db.is_unique_violation() {
            return RepositoryError::Conflict(db.message().to_string());
        }
    }
    RepositoryError::Query(e.to_string())
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

// ---------------------------------------------------------------------------
// JobRepository impl
// ---------------------------------------------------------------------------

impl JobRepository for SqliteJobRepository {
    async fn create_job_instance(&self, instance: &JobInstance) -> Result<(), RepositoryError> {
        sqlx::query("INSERT INTO job_instances (id, job_name, created_at) VALUES (?, ?, ?)")
            .bind(instance.id.to_string())
            .bind(&instance.job_name)
            .bind(format_datetime(&instance.created_at))
            .execute(&self.pool.writer)
            .await
            .map_err(map_write_error)?;
        Ok(())
    }

    async fn get_job_instance(&self, id: &Uuid) -> Result<Option<JobInstance>, RepositoryError> {
        let row = sqlx::query("SELECT id, job_name, created_at FROM job_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let id: String = row.try_get("id").map_err(query_error)?;
                let job_name: String = row.try_get("job_name").map_err(query_error)?;
                let created_at: String = row.try_get("created_at").map_err(query_error)?;
                Ok(Some(JobInstance {
                    id: parse_uuid(&id)?,
                    job_name,
                    created_at: parse_datetime(&created_at)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn create_job_execution(&self, execution: &JobExecution) -> Result<(), RepositoryError> {
        let parameters = serde_json::to_string(&execution.parameters)
            .map_err(|e| RepositoryError::Query(format!("serialize parameters: {e}")))?;

        sqlx::query(
            r#"INSERT INTO job_executions
               (id, instance_id, job_name, batch_status, exit_status, parameters,
                restart_position, created_at, started_at, ended_at, last_updated, seq)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                       (SELECT COALESCE(MAX(seq), 0) + 1 FROM job_executions))"#,
        )
        .bind(execution.id.to_string())
        .bind(execution.instance_id.to_string())
        .bind(&execution.job_name)
        .bind(execution.batch_status.as_str())
        .bind(&execution.exit_status)
        .bind(&parameters)
        .bind(&execution.restart_position)
        .bind(format_datetime(&execution.created_at))
        .bind(execution.started_at.as_ref().map(format_datetime))
        .bind(execution.ended_at.as_ref().map(format_datetime))
        .bind(format_datetime(&execution.last_updated))
        .execute(&self.pool.writer)
        .await
        .map_err(map_write_error)?;

        Ok(())
    }

    async fn update_job_execution(&self, execution: &JobExecution) -> Result<(), RepositoryError> {
        let parameters = serde_json::to_string(&execution.parameters)
            .map_err(|e| RepositoryError::Query(format!("serialize parameters: {e}")))?;

        let result = sqlx::query(
            r#"UPDATE job_executions SET
                 batch_status = ?, exit_status = ?, parameters = ?, restart_position = ?,
                 started_at = ?, ended_at = ?, last_updated = ?
               WHERE id = ?"#,
        )
        .bind(execution.batch_status.as_str())
        .bind(&execution.exit_status)
        .bind(&parameters)
        .bind(&execution.restart_position)
        .bind(execution.started_at.as_ref().map(format_datetime))
        .bind(execution.ended_at.as_ref().map(format_datetime))
        .bind(format_datetime(&execution.last_updated))
        .bind(execution.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(map_write_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_job_execution(&self, id: &Uuid) -> Result<Option<JobExecution>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = JobExecutionRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn list_job_executions(
        &self,
        instance_id: &Uuid,
    ) -> Result<Vec<JobExecution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE instance_id = ? ORDER BY seq ASC"
        ))
        .bind(instance_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = JobExecutionRow::from_row(row).map_err(query_error)?;
            executions.push(r.into_execution()?);
        }
        Ok(executions)
    }

    async fn most_recent_execution(
        &self,
        instance_id: &Uuid,
    ) -> Result<Option<JobExecution>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE instance_id = ? ORDER BY seq DESC LIMIT 1"
        ))
        .bind(instance_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = JobExecutionRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn create_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let metrics = serde_json::to_string(&step.metrics)
            .map_err(|e| RepositoryError::Query(format!("serialize metrics: {e}")))?;

        sqlx::query(
            r#"INSERT INTO step_executions
               (id, job_execution_id, step_id, partition_index, batch_status, exit_status,
                started_at, ended_at, metrics, persistent_user_data, seq)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                       (SELECT COALESCE(MAX(seq), 0) + 1 FROM step_executions))"#,
        )
        .bind(step.id.to_string())
        .bind(step.job_execution_id.to_string())
        .bind(&step.step_id)
        .bind(step.partition.map(i64::from))
        .bind(step.batch_status.as_str())
        .bind(&step.exit_status)
        .bind(format_datetime(&step.started_at))
        .bind(step.ended_at.as_ref().map(format_datetime))
        .bind(&metrics)
        .bind(&step.persistent_user_data)
        .execute(&self.pool.writer)
        .await
        .map_err(map_write_error)?;

        Ok(())
    }

    async fn update_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let metrics = serde_json::to_string(&step.metrics)
            .map_err(|e| RepositoryError::Query(format!("serialize metrics: {e}")))?;

        let result = sqlx::query(
            r#"UPDATE step_executions SET
                 batch_status = ?, exit_status = ?, ended_at = ?, metrics = ?,
                 persistent_user_data = ?
               WHERE id = ?"#,
        )
        .bind(step.batch_status.as_str())
        .bind(&step.exit_status)
        .bind(step.ended_at.as_ref().map(format_datetime))
        .bind(&metrics)
        .bind(&step.persistent_user_data)
        .bind(step.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(map_write_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_step_executions(
        &self,
        job_execution_id: &Uuid,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_EXECUTION_COLUMNS} FROM step_executions WHERE job_execution_id = ? ORDER BY seq ASC"
        ))
        .bind(job_execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = StepExecutionRow::from_row(row).map_err(query_error)?;
            steps.push(r.into_step_execution()?);
        }
        Ok(steps)
    }

    async fn get_step_status(
        &self,
        key: &StepStatusKey,
    ) -> Result<Option<StepStatus>, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT batch_status, exit_status, start_count, num_partitions,
                      persistent_user_data, last_step_execution_id
               FROM step_status WHERE instance_id = ? AND step_id = ?"#,
        )
        .bind(key.instance_id.to_string())
        .bind(&key.step_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let batch_status: String = row.try_get("batch_status").map_err(query_error)?;
        let start_count: i64 = row.try_get("start_count").map_err(query_error)?;
        let num_partitions: Option<i64> = row.try_get("num_partitions").map_err(query_error)?;
        let last_step_execution_id: Option<String> =
            row.try_get("last_step_execution_id").map_err(query_error)?;

        Ok(Some(StepStatus {
            key: key.clone(),
            batch_status: parse_status(&batch_status)?,
            exit_status: row.try_get("exit_status").map_err(query_error)?,
            start_count: start_count as u32,
            num_partitions: num_partitions.map(|n| n as u32),
            persistent_user_data: row.try_get("persistent_user_data").map_err(query_error)?,
            last_step_execution_id: last_step_execution_id
                .as_deref()
                .map(parse_uuid)
                .transpose()?,
        }))
    }

    async fn upsert_step_status(&self, status: &StepStatus) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO step_status
               (instance_id, step_id, batch_status, exit_status, start_count, num_partitions,
                persistent_user_data, last_step_execution_id)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(instance_id, step_id) DO UPDATE SET
                 batch_status = excluded.batch_status,
                 exit_status = excluded.exit_status,
                 start_count = excluded.start_count,
                 num_partitions = excluded.num_partitions,
                 persistent_user_data = excluded.persistent_user_data,
                 last_step_execution_id = excluded.last_step_execution_id"#,
        )
        .bind(status.key.instance_id.to_string())
        .bind(&status.key.step_id)
        .bind(status.batch_status.as_str())
        .bind(&status.exit_status)
        .bind(i64::from(status.start_count))
        .bind(status.num_partitions.map(i64::from))
        .bind(&status.persistent_user_data)
        .bind(status.last_step_execution_id.map(|id| id.to_string()))
        .execute(&self.pool.writer)
        .await
        .map_err(map_write_error)?;

        Ok(())
    }

    async fn get_checkpoint(
        &self,
        key: &CheckpointKey,
    ) -> Result<Option<CheckpointData>, RepositoryError> {
        let row = sqlx::query(
            "SELECT token, updated_at FROM checkpoint_data WHERE instance_id = ? AND step_id = ? AND role = ?",
        )
        .bind(key.instance_id.to_string())
        .bind(&key.step_id)
        .bind(key.role.as_str())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let updated_at: String = row.try_get("updated_at").map_err(query_error)?;
        Ok(Some(CheckpointData {
            key: key.clone(),
            token: row.try_get("token").map_err(query_error)?,
            updated_at: parse_datetime(&updated_at)?,
        }))
    }

    async fn upsert_checkpoint(&self, data: &CheckpointData) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO checkpoint_data (instance_id, step_id, role, token, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(instance_id, step_id, role) DO UPDATE SET
                 token = excluded.token,
                 updated_at = excluded.updated_at"#,
        )
        .bind(data.key.instance_id.to_string())
        .bind(&data.key.step_id)
        .bind(data.key.role.as_str())
        .bind(&data.token)
        .bind(format_datetime(&data.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(map_write_error)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironbatch_types::checkpoint::CheckpointRole;
    use tempfile::TempDir;

    async fn test_repo() -> (SqliteJobRepository, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::open_in(dir.path()).await.unwrap();
        (SqliteJobRepository::new(pool), dir)
    }

    async fn instance(repo: &SqliteJobRepository) -> JobInstance {
        let instance = JobInstance::new("payroll");
        repo.create_job_instance(&instance).await.unwrap();
        instance
    }

    #[tokio::test]
    async fn instance_round_trip() {
        let (repo, _dir) = test_repo().await;
        let instance = instance(&repo).await;

        let stored = repo.get_job_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(stored, instance);
        assert!(repo.get_job_instance(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn execution_lifecycle_is_persisted() {
        let (repo, _dir) = test_repo().await;
        let instance = instance(&repo).await;
        let params = HashMap::from([("date".to_string(), "2026-03-01".to_string())]);
        let mut exec = JobExecution::new(&instance, params);
        repo.create_job_execution(&exec).await.unwrap();

        exec.transition_to(BatchStatus::Started).unwrap();
        exec.transition_to(BatchStatus::Stopping).unwrap();
        exec.transition_to(BatchStatus::Stopped).unwrap();
        exec.restart_position = Some("load".to_string());
        repo.update_job_execution(&exec).await.unwrap();

        let stored = repo.get_job_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(stored, exec);
        assert_eq!(stored.exit_status.as_deref(), Some("STOPPED"));
        assert_eq!(stored.parameters["date"], "2026-03-01");
    }

    #[tokio::test]
    async fn most_recent_follows_insertion_order() {
        let (repo, _dir) = test_repo().await;
        let instance = instance(&repo).await;
        let ids: Vec<Uuid> = {
            let mut ids = Vec::new();
            for _ in 0..3 {
                let exec = JobExecution::new(&instance, HashMap::new());
                repo.create_job_execution(&exec).await.unwrap();
                ids.push(exec.id);
            }
            ids
        };

        let recent = repo.most_recent_execution(&instance.id).await.unwrap().unwrap();
        assert_eq!(recent.id, ids[2]);
        let listed: Vec<Uuid> = repo
            .list_job_executions(&instance.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(listed, ids);
        assert!(repo.most_recent_execution(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn orphan_execution_and_missing_update_are_not_found() {
        let (repo, _dir) = test_repo().await;
        let orphan = JobExecution::new(&JobInstance::new("ghost"), HashMap::new());

        let err = repo.create_job_execution(&orphan).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
        let err = repo.update_job_execution(&orphan).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn duplicate_instance_is_conflict() {
        let (repo, _dir) = test_repo().await;
        let instance = instance(&repo).await;
        let err = repo.create_job_instance(&instance).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn step_executions_keep_metrics_and_order() {
        let (repo, _dir) = test_repo().await;
        let instance = instance(&repo).await;
        let exec = JobExecution::new(&instance, HashMap::new());
        repo.create_job_execution(&exec).await.unwrap();

        let mut first = StepExecution::new(exec.id, "extract", None);
        let second = StepExecution::new(exec.id, "load", Some(2));
        repo.create_step_execution(&first).await.unwrap();
        repo.create_step_execution(&second).await.unwrap();

        first.batch_status = BatchStatus::Completed;
        first.exit_status = Some("COMPLETED".to_string());
        first.ended_at = Some(Utc::now());
        first.metrics.read_count = 7;
        first.metrics.commit_count = 3;
        first.persistent_user_data = Some(vec![1, 2, 3]);
        repo.update_step_execution(&first).await.unwrap();

        let steps = repo.list_step_executions(&exec.id).await.unwrap();
        assert_eq!(steps, vec![first, second]);
        assert_eq!(steps[1].partition, Some(2));
    }

    #[tokio::test]
    async fn step_status_upsert_overwrites() {
        let (repo, _dir) = test_repo().await;
        let instance = instance(&repo).await;
        let key = StepStatusKey::new(instance.id, "load");

        let mut status = StepStatus::new(key.clone());
        status.batch_status = BatchStatus::Started;
        status.start_count = 1;
        repo.upsert_step_status(&status).await.unwrap();
        assert_eq!(repo.get_step_status(&key).await.unwrap().unwrap().exit_status, None);

        status.batch_status = BatchStatus::Failed;
        status.exit_status = Some("FAILED".to_string());
        status.start_count = 2;
        status.num_partitions = Some(4);
        status.last_step_execution_id = Some(Uuid::now_v7());
        status.persistent_user_data = Some(b"cursor".to_vec());
        repo.upsert_step_status(&status).await.unwrap();

        let stored = repo.get_step_status(&key).await.unwrap().unwrap();
        assert_eq!(stored, status);
        let other = StepStatusKey::for_partition(instance.id, "load", 0);
        assert!(repo.get_step_status(&other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn checkpoint_upsert_is_keyed_by_role() {
        let (repo, _dir) = test_repo().await;
        let instance = instance(&repo).await;
        let reader = CheckpointKey::new(instance.id, "load", CheckpointRole::Reader);
        let writer = CheckpointKey::new(instance.id, "load", CheckpointRole::Writer);

        repo.upsert_checkpoint(&CheckpointData::new(reader.clone(), b"3".to_vec()))
            .await
            .unwrap();
        repo.upsert_checkpoint(&CheckpointData::new(writer.clone(), b"w".to_vec()))
            .await
            .unwrap();
        repo.upsert_checkpoint(&CheckpointData::new(reader.clone(), b"6".to_vec()))
            .await
            .unwrap();

        assert_eq!(repo.get_checkpoint(&reader).await.unwrap().unwrap().token, b"6".to_vec());
        assert_eq!(repo.get_checkpoint(&writer).await.unwrap().unwrap().token, b"w".to_vec());
        let missing = CheckpointKey::new(instance.id, "other", CheckpointRole::Reader);
        assert!(repo.get_checkpoint(&missing).await.unwrap().is_none());
    }
}
