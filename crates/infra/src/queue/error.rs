//! Queue errors.

use thiserror::Error;

use retrykit_core::{OperationKind, PolicyError};

use crate::store::KvError;

/// Queue operation error.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid retry policy: {0}")]
    InvalidPolicy(#[from] PolicyError),

    #[error("no handler registered for operation kind `{0}`")]
    NoHandler(OperationKind),

    #[error("durable operations need a failure sink")]
    NoFailureSink,

    #[error("unsupported queue snapshot version {0}")]
    UnsupportedSnapshotVersion(u32),

    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(#[from] KvError),
}

/// A failure sink refused an exhausted operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("handoff failed: {0}")]
pub struct HandoffError(pub String);
