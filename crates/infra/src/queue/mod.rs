//! Durable operation queue.
//!
//! Callers enqueue serializable [`Command`](retrykit_core::Command)s with a
//! priority and a retry schedule. A drain pass (manual or via
//! [`DrainScheduler`]) attempts eligible entries through the handler
//! registered for their kind. Exhausted durable entries are handed to a
//! [`FailureSink`], normally the persistent failure store.

mod error;
mod operation_queue;
mod registry;
mod scheduler;
mod sink;
mod types;

pub use error::{HandoffError, QueueError};
pub use operation_queue::OperationQueue;
pub use registry::{HandlerRegistry, OperationHandler};
pub use scheduler::{DEFAULT_DRAIN_INTERVAL, DrainHandle, DrainScheduler};
pub use sink::FailureSink;
pub use types::{
    AttemptOutcome, DrainReport, OperationMetadata, OperationState, QUEUE_SNAPSHOT_VERSION,
    QueuePolicy, QueueSnapshot, QueueStatus, QueuedOperation,
};
