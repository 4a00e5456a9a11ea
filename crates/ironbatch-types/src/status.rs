//! Batch lifecycle status.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status shared by job executions, step executions and partitions.
///
/// The forward graph is:
///
/// ```text
/// STARTING -> STARTED -> COMPLETED
///     |          |
///     |          +-----> STOPPING -> STOPPED
///     +-> STOPPING       |
///     +-> FAILED         +-> FAILED
/// ```
///
/// `ABANDONED` is an administrative state reachable from any state except
/// `STARTING` and `STARTED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
    Completed,
    Abandoned,
}

impl BatchStatus {
    /// All seven statuses, in lifecycle order.
    pub const ALL: [BatchStatus; 7] = [
        BatchStatus::Starting,
        BatchStatus::Started,
        BatchStatus::Stopping,
        BatchStatus::Stopped,
        BatchStatus::Failed,
        BatchStatus::Completed,
        BatchStatus::Abandoned,
    ];

    /// Whether this status ends a polling or waiting contract.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            BatchStatus::Stopped
                | BatchStatus::Failed
                | BatchStatus::Completed
                | BatchStatus::Abandoned
        )
    }

    /// Whether the execution is actively running (stop is only valid here).
    pub fn is_running(self) -> bool {
        matches!(self, BatchStatus::Starting | BatchStatus::Started)
    }

    /// Whether `next` is a legal forward move from `self`.
    pub fn can_transition_to(self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        match (self, next) {
            (Starting, Started | Stopping | Failed) => true,
            (Started, Completed | Stopping | Failed) => true,
            (Stopping, Stopped | Failed | Abandoned) => true,
            (Stopped | Failed | Completed, Abandoned) => true,
            _ => false,
        }
    }

    /// Canonical upper-case name, also used as the default exit status.
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Stopping => "STOPPING",
            BatchStatus::Stopped => "STOPPED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Abandoned => "ABANDONED",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BatchStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown batch status: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_four_statuses_are_final() {
        let finals: Vec<_> = BatchStatus::ALL
            .into_iter()
            .filter(|s| s.is_final())
            .collect();
        assert_eq!(
            finals,
            vec![
                BatchStatus::Stopped,
                BatchStatus::Failed,
                BatchStatus::Completed,
                BatchStatus::Abandoned
            ]
        );
    }

    #[test]
    fn forward_transitions() {
        assert!(BatchStatus::Starting.can_transition_to(BatchStatus::Started));
        assert!(BatchStatus::Started.can_transition_to(BatchStatus::Completed));
        assert!(BatchStatus::Started.can_transition_to(BatchStatus::Stopping));
        assert!(BatchStatus::Stopping.can_transition_to(BatchStatus::Stopped));
        assert!(BatchStatus::Completed.can_transition_to(BatchStatus::Abandoned));
    }

    #[test]
    fn backward_and_running_abandon_rejected() {
        assert!(!BatchStatus::Completed.can_transition_to(BatchStatus::Started));
        assert!(!BatchStatus::Stopped.can_transition_to(BatchStatus::Starting));
        assert!(!BatchStatus::Started.can_transition_to(BatchStatus::Abandoned));
        assert!(!BatchStatus::Starting.can_transition_to(BatchStatus::Abandoned));
        assert!(!BatchStatus::Abandoned.can_transition_to(BatchStatus::Completed));
    }

    #[test]
    fn serde_uses_upper_case_names() {
        let json = serde_json::to_string(&BatchStatus::Stopping).unwrap();
        assert_eq!(json, "\"STOPPING\"");
        let parsed: BatchStatus = serde_json::from_str("\"ABANDONED\"").unwrap();
        assert_eq!(parsed, BatchStatus::Abandoned);
    }

    #[test]
    fn from_str_matches_display() {
        for status in BatchStatus::ALL {
            assert_eq!(status.to_string().parse::<BatchStatus>().unwrap(), status);
        }
        assert!("RUNNING".parse::<BatchStatus>().is_err());
    }
}
