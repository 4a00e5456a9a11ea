//! Kernel configuration types.
//!
//! `KernelConfig` represents the `ironbatch.toml` file in the data directory.
//! Every field has a default so an empty or partial file is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Capacity of the bounded channel partitions report results on.
    #[serde(default = "default_partition_result_capacity")]
    pub partition_result_capacity: usize,

    /// Upper bound for a single wait on the completion registry.
    #[serde(default = "default_completion_wait_timeout_ms")]
    pub completion_wait_timeout_ms: u64,

    /// Transaction timeout used when neither the step nor the checkpoint
    /// algorithm supplies one.
    #[serde(default = "default_transaction_timeout_secs")]
    pub default_transaction_timeout_secs: u64,

    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_partition_result_capacity() -> usize {
    64
}

fn default_completion_wait_timeout_ms() -> u64 {
    5_000
}

fn default_transaction_timeout_secs() -> u64 {
    180
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl KernelConfig {
    pub fn completion_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_wait_timeout_ms)
    }

    pub fn default_transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.default_transaction_timeout_secs)
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            partition_result_capacity: default_partition_result_capacity(),
            completion_wait_timeout_ms: default_completion_wait_timeout_ms(),
            default_transaction_timeout_secs: default_transaction_timeout_secs(),
            event_bus_capacity: default_event_bus_capacity(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Tracing subscriber settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    #[serde(default = "default_filter")]
    pub filter: String,

    /// Bridge spans to the OpenTelemetry stdout exporter.
    #[serde(default)]
    pub otel: bool,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            otel: false,
        }
    }
}
