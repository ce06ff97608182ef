//! Store and writer configuration
//!
//! Plain config structs with sensible defaults. The writer settings trade
//! batching efficiency against ordering and failure-visibility guarantees:
//! - `batch_size`: rows buffered per (type, operation) before auto-flush
//! - `flush_between_types`: flush everything when the written type changes,
//!   preserving cross-type ordering at the backend
//! - strict vs best-effort failure handling is chosen per writer at
//!   acquisition time, not here

use serde::{Deserialize, Serialize};

/// Failure handling mode for a batched writer, fixed at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureMode {
    /// Batch execution errors are rethrown to the caller with the failing
    /// statement text attached.
    Strict,
    /// Batch execution errors are logged and swallowed; the failed batch's
    /// statistics are not incremented.
    BestEffort,
}

impl FailureMode {
    pub fn is_strict(self) -> bool {
        matches!(self, FailureMode::Strict)
    }
}

/// Batched writer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Rows buffered per (record type, operation kind) before the batch is
    /// executed automatically. Default: 1000.
    pub batch_size: usize,

    /// When true, a write whose record type differs from the immediately
    /// preceding write's type first flushes every pending batch. Default:
    /// false (batch per type, cross-type order undefined).
    pub flush_between_types: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            flush_between_types: false,
        }
    }
}

impl WriterConfig {
    /// Writer config with a custom batch size.
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            flush_between_types: false,
        }
    }

    /// Enable strict cross-type ordering.
    pub fn ordered(mut self) -> Self {
        self.flush_between_types = true;
        self
    }
}

/// Top-level record store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Writer defaults used by vended writers.
    pub writer: WriterConfig,
}
