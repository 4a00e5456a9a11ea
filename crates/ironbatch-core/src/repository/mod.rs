//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (ironbatch-infra) implements. The core crate never depends on any
//! specific storage technology; `memory` provides an in-process store used by
//! tests and embedded deployments.

pub mod job;
pub mod memory;

pub use job::JobRepository;
pub use memory::InMemoryJobRepository;
