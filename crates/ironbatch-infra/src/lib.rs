//! Infrastructure layer for ironbatch.
//!
//! Contains the SQLite implementation of the `JobRepository` port defined in
//! `ironbatch-core`, the kernel configuration loader, and [`open_kernel`],
//! which wires both into a ready [`KernelService`].

pub mod config;
pub mod sqlite;

use std::path::Path;
use std::sync::Arc;

use ironbatch_core::batch::{
    ArtifactRegistry, BatchContext, JobModelResolver, KernelService, TransactionManager,
};

use crate::sqlite::{DatabasePool, SqliteJobRepository};

/// Build a kernel persisting to `{data_dir}/ironbatch.db` and configured from
/// `{data_dir}/ironbatch.toml`.
pub async fn open_kernel(
    data_dir: &Path,
    resolver: Arc<dyn JobModelResolver>,
    artifacts: Arc<ArtifactRegistry>,
    transactions: Arc<dyn TransactionManager>,
) -> Result<KernelService<SqliteJobRepository>, sqlx::Error> {
    tokio::fs::create_dir_all(data_dir).await?;
    let config = config::load_kernel_config(data_dir).await;
    let pool = DatabasePool::open_in(data_dir).await?;
    tracing::info!(data_dir = %data_dir.display(), "batch kernel opened");

    Ok(KernelService::new(BatchContext::new(
        Arc::new(SqliteJobRepository::new(pool)),
        resolver,
        artifacts,
        transactions,
        config,
    )))
}
