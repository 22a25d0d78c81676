//! Failure model shared by the executor, the queue and the store.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whether a failed attempt is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Network or server-side trouble; another attempt may succeed.
    Transient,
    /// Validation or client-side rejection; repeating will not help.
    Permanent,
}

/// Typed failure returned by a single attempt of an operation.
///
/// The transport that performs the attempt decides the class; retry
/// predicates usually only look at [`OperationError::is_transient`].
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{class:?} failure: {message}")]
pub struct OperationError {
    pub class: FailureClass,
    pub message: String,
}

impl OperationError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Transient,
            message: msg.into(),
        }
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Permanent,
            message: msg.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class == FailureClass::Transient
    }
}

/// A backoff configuration that cannot produce a sane schedule.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PolicyError {
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("exponential_base must be a finite number greater than 1 (got {0})")]
    InvalidExponentialBase(f64),

    #[error("max_delay ({max_ms}ms) is shorter than base_delay ({base_ms}ms)")]
    DelayBoundsInverted { base_ms: u128, max_ms: u128 },
}

/// An identifier string that is not a UUID.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {kind}: {reason}")]
pub struct IdParseError {
    pub kind: &'static str,
    pub reason: String,
}
