//! `retrykit-core`: retry building blocks with no storage or scheduling concerns.
//!
//! This crate holds the backoff schedule, retry policies, the failure model,
//! the clock abstraction and the [`BackoffExecutor`] that ties them together.

pub mod backoff;
pub mod clock;
pub mod error;
pub mod executor;
pub mod id;
pub mod operation;
pub mod policy;

pub use backoff::Backoff;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{FailureClass, IdParseError, OperationError, PolicyError};
pub use executor::{BackoffExecutor, RetryOutcome, execute_with_retry};
pub use id::{OperationId, RecordId};
pub use operation::{Command, OperationKind};
pub use policy::{RetryPolicy, RetryRule};
