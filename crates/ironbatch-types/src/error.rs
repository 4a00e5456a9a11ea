use thiserror::Error;
use uuid::Uuid;

use crate::status::BatchStatus;

/// Errors from repository operations (used by trait definitions in ironbatch-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// A status change that does not follow the lifecycle graph.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("execution {execution_id}: illegal status transition {from} -> {to}")]
pub struct StatusTransitionError {
    pub execution_id: Uuid,
    pub from: BatchStatus,
    pub to: BatchStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn test_status_transition_error_display() {
        let err = StatusTransitionError {
            execution_id: Uuid::nil(),
            from: BatchStatus::Completed,
            to: BatchStatus::Started,
        };
        assert!(err.to_string().contains("COMPLETED -> STARTED"));
    }
}
