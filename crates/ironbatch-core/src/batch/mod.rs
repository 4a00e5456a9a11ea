//! The batch execution kernel.
//!
//! [`KernelService`] owns the job lifecycle. A job runs on a [`JobRunner`]
//! that walks the model with a [`ModelNavigator`]; each step runs on a
//! [`controller::StepController`], and partitions and split flows run as
//! [`WorkUnit`]s on their own tasks.

pub mod artifact;
pub mod callback;
pub mod checkpoint;
pub mod context;
pub mod controller;
pub mod job_runner;
pub mod kernel;
pub mod navigator;
pub mod registry;
pub mod retry;
pub mod transaction;
pub mod validate;
pub mod work_unit;

pub use artifact::{
    ArtifactContext, ArtifactError, Batchlet, Decider, ItemProcessor, ItemReader, ItemWriter,
    PartitionAnalyzer, PartitionCollector, PartitionMapper, StepContext,
};
pub use callback::CompletionRegistry;
pub use checkpoint::{CheckpointAlgorithm, CheckpointManager, ItemCheckpointAlgorithm};
pub use context::{BatchContext, ExecutionScope, InMemoryModelResolver, JobModelResolver};
pub use controller::{StepController, StepError, StepOutcome};
pub use job_runner::{FlowOutcome, JobOutcome, JobRunner};
pub use kernel::{KernelError, KernelService, WaitOutcome};
pub use navigator::{ModelNavigator, Navigation, NavigatorError};
pub use registry::ArtifactRegistry;
pub use retry::{FaultAction, ItemFaultPolicy, LimitFaultPolicy};
pub use transaction::{LocalTransactionManager, Transaction, TransactionManager};
pub use validate::{ModelError, validate_job};
pub use work_unit::{PartitionMessage, WorkUnit, WorkUnitBuilder};
