//! Partition plans and the terminal results partitions report back.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::execution::StepMetrics;
use crate::status::BatchStatus;

/// How a step is split into parallel partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlan {
    /// Number of partitions to run.
    pub partitions: u32,
    /// Maximum partitions running at once (0 means one per partition).
    #[serde(default)]
    pub threads: u32,
    /// Properties for each partition, indexed by partition number.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partition_properties: Vec<HashMap<String, String>>,
    /// On restart, use this plan instead of the partition count recorded earlier.
    #[serde(default)]
    pub override_on_restart: bool,
}

impl PartitionPlan {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions,
            threads: 0,
            partition_properties: Vec::new(),
            override_on_restart: false,
        }
    }

    pub fn with_threads(mut self, threads: u32) -> Self {
        self.threads = threads;
        self
    }

    /// Effective concurrency bound; never zero.
    pub fn effective_threads(&self) -> usize {
        self.threads_for(self.partitions)
    }

    /// Concurrency bound when `partitions` units actually run, as on a
    /// restart that keeps the recorded partition count.
    pub fn threads_for(&self, partitions: u32) -> usize {
        let threads = if self.threads == 0 {
            partitions
        } else {
            self.threads.min(partitions)
        };
        threads.max(1) as usize
    }

    /// Properties for partition `index`, empty when none were declared.
    pub fn properties_for(&self, index: u32) -> HashMap<String, String> {
        self.partition_properties
            .get(index as usize)
            .cloned()
            .unwrap_or_default()
    }
}

/// Terminal result of one work unit (a partition or a flow in a split).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionResult {
    /// Partition (or flow) index within its parent step or split.
    pub partition: u32,
    pub batch_status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<String>,
    #[serde(default)]
    pub metrics: StepMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_user_data: Option<Vec<u8>>,
}

impl PartitionResult {
    pub fn new(partition: u32, batch_status: BatchStatus, exit_status: Option<String>) -> Self {
        Self {
            partition,
            batch_status,
            exit_status,
            metrics: StepMetrics::default(),
            persistent_user_data: None,
        }
    }

    /// Result reported for a unit whose worker died without reporting.
    pub fn abandoned(partition: u32) -> Self {
        Self::new(
            partition,
            BatchStatus::Abandoned,
            Some(BatchStatus::Abandoned.to_string()),
        )
    }

    /// Whether this result fails the parent step.
    pub fn is_failure(&self) -> bool {
        matches!(
            self.batch_status,
            BatchStatus::Failed | BatchStatus::Abandoned
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_threads_is_bounded_by_partitions() {
        assert_eq!(PartitionPlan::new(4).effective_threads(), 4);
        assert_eq!(PartitionPlan::new(4).with_threads(2).effective_threads(), 2);
        assert_eq!(PartitionPlan::new(2).with_threads(8).effective_threads(), 2);
        assert_eq!(PartitionPlan::new(0).effective_threads(), 1);
    }

    #[test]
    fn missing_partition_properties_are_empty() {
        let mut plan = PartitionPlan::new(2);
        plan.partition_properties = vec![HashMap::from([("range".to_string(), "0-99".to_string())])];
        assert_eq!(plan.properties_for(0).get("range").map(String::as_str), Some("0-99"));
        assert!(plan.properties_for(1).is_empty());
    }

    #[test]
    fn abandoned_result_fails_parent() {
        let result = PartitionResult::abandoned(3);
        assert!(result.is_failure());
        assert_eq!(result.exit_status.as_deref(), Some("ABANDONED"));
        assert!(!PartitionResult::new(0, BatchStatus::Completed, None).is_failure());
    }
}
