//! Batch execution kernel and repository trait definitions for ironbatch.
//!
//! This crate defines the "ports" (repository, transaction manager, artifact
//! traits) that the infrastructure layer and job authors implement. It depends
//! only on `ironbatch-types` -- never on `ironbatch-infra` or any database/IO crate.

pub mod batch;
pub mod event;
pub mod repository;
