//! Retry policies: a backoff schedule plus a "should this error be retried" predicate.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;
use crate::error::{OperationError, PolicyError};

type Predicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Immutable retry policy.
///
/// The predicate is consulted before the attempt counter: an error it rejects
/// is never retried, even with attempts left.
pub struct RetryPolicy<E = OperationError> {
    backoff: Backoff,
    predicate: Predicate<E>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            backoff: self.backoff.clone(),
            predicate: Arc::clone(&self.predicate),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("backoff", &self.backoff)
            .field("predicate", &"<fn>")
            .finish()
    }
}

impl<E> Default for RetryPolicy<E> {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            predicate: Arc::new(|_: &E| true),
        }
    }
}

impl<E> RetryPolicy<E> {
    /// Policy that retries every error on `backoff`'s schedule.
    pub fn new(backoff: Backoff) -> Result<Self, PolicyError> {
        backoff.validate()?;
        Ok(Self {
            backoff,
            ..Default::default()
        })
    }

    /// Replace the predicate.
    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.predicate = Arc::new(predicate);
        self
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn max_attempts(&self) -> u32 {
        self.backoff.max_attempts
    }

    pub fn should_retry(&self, error: &E) -> bool {
        (self.predicate)(error)
    }
}

impl RetryPolicy<OperationError> {
    /// Retry transient failures only; permanent ones fail fast.
    pub fn transient_only(backoff: Backoff) -> Result<Self, PolicyError> {
        Ok(Self::new(backoff)?.retry_if(OperationError::is_transient))
    }
}

/// Serializable retry predicate for work that must outlive the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryRule {
    /// Retry every failure.
    #[default]
    Always,
    /// Retry [`crate::FailureClass::Transient`] failures only.
    TransientOnly,
}

impl RetryRule {
    pub fn allows(&self, error: &OperationError) -> bool {
        match self {
            RetryRule::Always => true,
            RetryRule::TransientOnly => error.is_transient(),
        }
    }

    /// Build an executor policy with this rule as its predicate.
    pub fn policy(self, backoff: Backoff) -> Result<RetryPolicy<OperationError>, PolicyError> {
        Ok(RetryPolicy::new(backoff)?.retry_if(move |e| self.allows(e)))
    }
}
