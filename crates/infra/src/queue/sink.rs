//! One-way handoff of exhausted durable operations.

use retrykit_core::OperationError;

use super::error::HandoffError;
use super::types::QueuedOperation;

/// Receives durable operations the queue gave up on.
///
/// The queue calls this at most once per entry, after the entry has already
/// been removed. There is no reference back from the sink to the queue.
pub trait FailureSink: Send + Sync {
    fn accept(&self, operation: &QueuedOperation, error: &OperationError)
        -> Result<(), HandoffError>;
}
