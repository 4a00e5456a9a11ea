//! Event types for the kernel event bus.
//!
//! `BatchEvent` is broadcast as executions move through their lifecycle.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::BatchStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    /// A job execution moved to STARTED.
    JobStarted {
        execution_id: Uuid,
        job_name: String,
        restart: bool,
    },

    /// A step (or one partition of a step) was entered.
    StepStarted {
        execution_id: Uuid,
        step_id: String,
        partition: Option<u32>,
    },

    /// A chunk interval committed.
    CheckpointCommitted {
        execution_id: Uuid,
        step_id: String,
        partition: Option<u32>,
        /// Items written in the committed interval.
        items: u64,
    },

    StepFinished {
        execution_id: Uuid,
        step_id: String,
        batch_status: BatchStatus,
        exit_status: String,
    },

    /// A partition or split flow delivered its terminal result.
    PartitionFinished {
        execution_id: Uuid,
        step_id: String,
        partition: u32,
        batch_status: BatchStatus,
    },

    /// Fired exactly once per execution, after the final status is persisted.
    JobFinished {
        execution_id: Uuid,
        batch_status: BatchStatus,
        exit_status: String,
    },
}

impl BatchEvent {
    pub fn execution_id(&self) -> Uuid {
        match self {
            BatchEvent::JobStarted { execution_id, .. }
            | BatchEvent::StepStarted { execution_id, .. }
            | BatchEvent::CheckpointCommitted { execution_id, .. }
            | BatchEvent::StepFinished { execution_id, .. }
            | BatchEvent::PartitionFinished { execution_id, .. }
            | BatchEvent::JobFinished { execution_id, .. } => *execution_id,
        }
    }
}
