//! Item fault handling for chunk steps.
//!
//! When a reader, processor or writer call fails, the chunk controller asks
//! an [`ItemFaultPolicy`] what to do. The default [`LimitFaultPolicy`] retries
//! in place up to `retry_limit` per checkpoint interval, then skips up to
//! `skip_limit` for the whole step, then fails the step. A job model may name
//! a custom policy artifact instead.

use std::fmt;

use ironbatch_types::model::ChunkModel;

/// Which chunk phase raised the fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPhase {
    Read,
    Process,
    Write,
}

impl fmt::Display for FaultPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FaultPhase::Read => "read",
            FaultPhase::Process => "process",
            FaultPhase::Write => "write",
        })
    }
}

/// A failed artifact call inside a checkpoint interval.
#[derive(Debug)]
pub struct ItemFault<'a> {
    pub phase: FaultPhase,
    pub error: &'a anyhow::Error,
    /// Items read so far in the current interval.
    pub interval_items: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Repeat the failed call.
    Retry,
    /// Drop the item (or, for writes, the buffered items) and carry on.
    Skip,
    /// Roll back the interval and fail the step.
    Fail,
}

/// Decides how an item fault is handled. One instance per step execution.
pub trait ItemFaultPolicy: Send {
    /// Called when a checkpoint interval begins.
    fn begin_interval(&mut self) {}

    fn on_fault(&mut self, fault: &ItemFault<'_>) -> FaultAction;
}

// ---------------------------------------------------------------------------
// LimitFaultPolicy
// ---------------------------------------------------------------------------

/// Counts retries and skips against the limits declared on the chunk.
///
/// Retries are counted per interval, skips per step execution. `None` for a
/// limit disables that action entirely.
#[derive(Debug, Clone, Default)]
pub struct LimitFaultPolicy {
    retry_limit: Option<u32>,
    skip_limit: Option<u32>,
    retries: u32,
    skips: u32,
}

impl LimitFaultPolicy {
    pub fn new(retry_limit: Option<u32>, skip_limit: Option<u32>) -> Self {
        Self {
            retry_limit,
            skip_limit,
            retries: 0,
            skips: 0,
        }
    }

    pub fn for_chunk(chunk: &ChunkModel) -> Self {
        Self::new(chunk.retry_limit, chunk.skip_limit)
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn skips(&self) -> u32 {
        self.skips
    }
}

impl ItemFaultPolicy for LimitFaultPolicy {
    fn begin_interval(&mut self) {
        self.retries = 0;
    }

    fn on_fault(&mut self, fault: &ItemFault<'_>) -> FaultAction {
        if self.retry_limit.is_some_and(|limit| self.retries < limit) {
            self.retries += 1;
            tracing::warn!(
                phase = %fault.phase,
                attempt = self.retries,
                interval_items = fault.interval_items,
                error = %fault.error,
                "retrying chunk item"
            );
            return FaultAction::Retry;
        }
        if self.skip_limit.is_some_and(|limit| self.skips < limit) {
            self.skips += 1;
            tracing::warn!(
                phase = %fault.phase,
                skipped = self.skips,
                error = %fault.error,
                "skipping chunk item"
            );
            return FaultAction::Skip;
        }
        FaultAction::Fail
    }
}
