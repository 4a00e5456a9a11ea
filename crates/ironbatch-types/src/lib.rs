//! Shared domain types for ironbatch.
//!
//! This crate contains the records the batch kernel persists (job instances,
//! executions, step status, checkpoint tokens), the resolved job model, and
//! the configuration and event types shared across the workspace.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod model;
pub mod partition;
pub mod status;
