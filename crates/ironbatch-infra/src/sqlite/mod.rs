//! SQLite storage layer.
//!
//! The job repository backed by SQLite with WAL mode and split read/write
//! connection pools.

pub mod job;
pub mod pool;

pub use job::SqliteJobRepository;
pub use pool::DatabasePool;
