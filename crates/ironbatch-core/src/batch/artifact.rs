//! Batch artifact traits.
//!
//! Artifacts are the user code a job model names: readers, processors and
//! writers for chunk steps, batchlets, deciders, and the partition mapper,
//! collector and analyzer. They are object-safe (boxed futures) because the
//! kernel only learns their concrete types through the
//! [`ArtifactRegistry`](super::registry::ArtifactRegistry) at runtime.
//!
//! Every artifact method returns `anyhow::Result`; the kernel wraps failures
//! into [`ArtifactError`] with the artifact's kind and name attached.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::future::{BoxFuture, FutureExt};
use ironbatch_types::execution::StepExecution;
use ironbatch_types::partition::PartitionPlan;
use ironbatch_types::status::BatchStatus;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("no {kind} artifact registered under '{name}'")]
    NotFound { kind: &'static str, name: String },

    #[error("failed to create {kind} artifact '{name}': {source}")]
    Create {
        kind: &'static str,
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{kind} artifact '{name}' failed: {source}")]
    Fault {
        kind: &'static str,
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ArtifactError {
    pub fn fault(kind: &'static str, name: &str, error: anyhow::Error) -> Self {
        ArtifactError::Fault {
            kind,
            name: name.to_string(),
            source: error.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Context handed to artifact factories
// ---------------------------------------------------------------------------

/// Mutable per-step state shared between the controller and its artifacts.
///
/// An artifact may set the step's exit status (overriding the default, which is
/// the batch status name) and persistent user data that survives restarts.
#[derive(Debug, Clone, Default)]
pub struct StepContext {
    inner: Arc<Mutex<StepContextInner>>,
}

#[derive(Debug, Default)]
struct StepContextInner {
    exit_status: Option<String>,
    persistent_user_data: Option<Vec<u8>>,
}

impl StepContext {
    pub fn with_user_data(persistent_user_data: Option<Vec<u8>>) -> Self {
        let ctx = Self::default();
        ctx.set_persistent_user_data(persistent_user_data);
        ctx
    }

    pub fn exit_status(&self) -> Option<String> {
        self.lock().exit_status.clone()
    }

    pub fn set_exit_status(&self, exit_status: impl Into<String>) {
        self.lock().exit_status = Some(exit_status.into());
    }

    pub fn persistent_user_data(&self) -> Option<Vec<u8>> {
        self.lock().persistent_user_data.clone()
    }

    pub fn set_persistent_user_data(&self, data: Option<Vec<u8>>) {
        self.lock().persistent_user_data = data;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StepContextInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Everything an artifact factory may inspect when building an artifact.
#[derive(Debug, Clone)]
pub struct ArtifactContext {
    pub job_name: String,
    pub instance_id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    pub partition: Option<u32>,
    pub job_parameters: HashMap<String, String>,
    /// Job properties overlaid with step properties, then partition properties.
    pub properties: HashMap<String, String>,
    /// Cancelled when a stop is requested for this execution.
    pub stop: CancellationToken,
    pub step: StepContext,
}

impl ArtifactContext {
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }
}

// ---------------------------------------------------------------------------
// Chunk artifacts
// ---------------------------------------------------------------------------

/// Source of items for a chunk step.
pub trait ItemReader: Send {
    /// Open the reader, positioned after the item recorded in `checkpoint` if any.
    fn open(&mut self, checkpoint: Option<Value>) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Next item, or `None` at end of data.
    fn read_item(&mut self) -> BoxFuture<'_, anyhow::Result<Option<Value>>>;

    /// Restart marker persisted at each checkpoint.
    fn checkpoint_info(&mut self) -> BoxFuture<'_, anyhow::Result<Option<Value>>> {
        futures_util::future::ready(Ok(None)).boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, anyhow::Result<()>> {
        futures_util::future::ready(Ok(())).boxed()
    }
}

/// Item transformation. Returning `None` filters the item out.
pub trait ItemProcessor: Send {
    fn process_item(&mut self, item: Value) -> BoxFuture<'_, anyhow::Result<Option<Value>>>;
}

/// Sink for the items buffered during one checkpoint interval.
pub trait ItemWriter: Send {
    fn open(&mut self, checkpoint: Option<Value>) -> BoxFuture<'_, anyhow::Result<()>> {
        let _ = checkpoint;
        futures_util::future::ready(Ok(())).boxed()
    }

    fn write_items(&mut self, items: Vec<Value>) -> BoxFuture<'_, anyhow::Result<()>>;

    fn checkpoint_info(&mut self) -> BoxFuture<'_, anyhow::Result<Option<Value>>> {
        futures_util::future::ready(Ok(None)).boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, anyhow::Result<()>> {
        futures_util::future::ready(Ok(())).boxed()
    }
}

// ---------------------------------------------------------------------------
// Task and routing artifacts
// ---------------------------------------------------------------------------

/// Task-oriented step body. The returned string is the step's exit status.
pub trait Batchlet: Send {
    fn process(&mut self) -> BoxFuture<'_, anyhow::Result<String>>;
}

/// Chooses the exit status a decision element transitions on.
///
/// `executions` holds the step executions of the element that ran before the
/// decision (several when it follows a split or a partitioned step).
pub trait Decider: Send {
    fn decide(&mut self, executions: Vec<StepExecution>) -> BoxFuture<'_, anyhow::Result<String>>;
}

// ---------------------------------------------------------------------------
// Partition artifacts
// ---------------------------------------------------------------------------

/// Computes the partition plan at runtime.
pub trait PartitionMapper: Send {
    fn map_partitions(&mut self) -> BoxFuture<'_, anyhow::Result<PartitionPlan>>;
}

/// Runs inside a partition and gathers data for the analyzer.
pub trait PartitionCollector: Send {
    fn collect_partition_data(&mut self) -> BoxFuture<'_, anyhow::Result<Option<Value>>>;
}

/// Runs on the parent step and sees every partition's data and final status.
pub trait PartitionAnalyzer: Send {
    fn analyze_collector_data(&mut self, data: Value) -> BoxFuture<'_, anyhow::Result<()>>;

    fn analyze_status(
        &mut self,
        batch_status: BatchStatus,
        exit_status: Option<String>,
    ) -> BoxFuture<'_, anyhow::Result<()>>;
}
