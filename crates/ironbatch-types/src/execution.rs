//! Execution tracking records: job instances, job executions, step executions
//! and the per-step restart status.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StatusTransitionError;
use crate::status::BatchStatus;

// ---------------------------------------------------------------------------
// Job instance / execution
// ---------------------------------------------------------------------------

/// Identity for one logical job. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: Uuid,
    pub job_name: String,
    pub created_at: DateTime<Utc>,
}

impl JobInstance {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_name: job_name.into(),
            created_at: Utc::now(),
        }
    }
}

/// One attempt to run a [`JobInstance`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    /// UUIDv7 execution ID.
    pub id: Uuid,
    /// Owning job instance.
    pub instance_id: Uuid,
    /// Job name (denormalized for display).
    pub job_name: String,
    /// Current lifecycle status.
    pub batch_status: BatchStatus,
    /// Exit status; always `Some` once `batch_status` is final.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<String>,
    /// Job parameters supplied at start or restart.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    /// Element to resume at, recorded by a `stop` transition with a `restart` attribute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_position: Option<String>,
}

impl JobExecution {
    /// Create a new execution in `STARTING` state.
    pub fn new(instance: &JobInstance, parameters: HashMap<String, String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            instance_id: instance.id,
            job_name: instance.job_name.clone(),
            batch_status: BatchStatus::Starting,
            exit_status: None,
            parameters,
            created_at: now,
            started_at: None,
            ended_at: None,
            last_updated: now,
            restart_position: None,
        }
    }

    /// Move to `next`, enforcing the forward-only lifecycle.
    ///
    /// Stamps `started_at` on `STARTED` and `ended_at` on final statuses. A final
    /// status always leaves `exit_status` set, defaulting to the status name.
    pub fn transition_to(&mut self, next: BatchStatus) -> Result<(), StatusTransitionError> {
        if self.batch_status == next {
            return Ok(());
        }
        if !self.batch_status.can_transition_to(next) {
            return Err(StatusTransitionError {
                execution_id: self.id,
                from: self.batch_status,
                to: next,
            });
        }

        let now = Utc::now();
        self.batch_status = next;
        self.last_updated = now;
        if next == BatchStatus::Started {
            self.started_at = Some(now);
        }
        if next.is_final() {
            self.ended_at.get_or_insert(now);
            if self.exit_status.is_none() {
                self.exit_status = Some(next.to_string());
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Step execution
// ---------------------------------------------------------------------------

/// Counters maintained by the chunk controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub read_count: u64,
    pub write_count: u64,
    pub filter_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
    pub read_skip_count: u64,
    pub process_skip_count: u64,
    pub write_skip_count: u64,
}

impl StepMetrics {
    /// Fold another set of counters into this one (partition roll-up).
    pub fn absorb(&mut self, other: &StepMetrics) {
        self.read_count += other.read_count;
        self.write_count += other.write_count;
        self.filter_count += other.filter_count;
        self.commit_count += other.commit_count;
        self.rollback_count += other.rollback_count;
        self.read_skip_count += other.read_skip_count;
        self.process_skip_count += other.process_skip_count;
        self.write_skip_count += other.write_skip_count;
    }
}

/// One entry into a step (or into one partition of a step).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    pub job_execution_id: Uuid,
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<u32>,
    pub batch_status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metrics: StepMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_user_data: Option<Vec<u8>>,
}

impl StepExecution {
    pub fn new(job_execution_id: Uuid, step_id: impl Into<String>, partition: Option<u32>) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_execution_id,
            step_id: step_id.into(),
            partition,
            batch_status: BatchStatus::Starting,
            exit_status: None,
            started_at: Utc::now(),
            ended_at: None,
            metrics: StepMetrics::default(),
            persistent_user_data: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Step status (restart bookkeeping)
// ---------------------------------------------------------------------------

/// Key of a [`StepStatus`] record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepStatusKey {
    pub instance_id: Uuid,
    pub step_id: String,
}

impl StepStatusKey {
    pub fn new(instance_id: Uuid, step_id: impl Into<String>) -> Self {
        Self {
            instance_id,
            step_id: step_id.into(),
        }
    }

    /// Key of the status record for one partition of `step_id`.
    pub fn for_partition(instance_id: Uuid, step_id: &str, partition: u32) -> Self {
        Self::new(instance_id, partition_step_id(step_id, partition))
    }
}

/// Step id under which a partition's status and checkpoints are stored.
pub fn partition_step_id(step_id: &str, partition: u32) -> String {
    format!("{step_id}:partition-{partition}")
}

/// Persistent per-step record, kept across all executions of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStatus {
    pub key: StepStatusKey,
    pub batch_status: BatchStatus,
    /// Unset while the step is running; posted when the step finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<String>,
    /// Number of times the step has been (re)entered.
    pub start_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_partitions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_user_data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_step_execution_id: Option<Uuid>,
}

impl StepStatus {
    pub fn new(key: StepStatusKey) -> Self {
        Self {
            key,
            batch_status: BatchStatus::Starting,
            exit_status: None,
            start_count: 0,
            num_partitions: None,
            persistent_user_data: None,
            last_step_execution_id: None,
        }
    }
}
