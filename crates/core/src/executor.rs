//! Backoff executor: run one operation until it succeeds or the policy gives up.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::policy::RetryPolicy;

/// Result of one executor invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T, E> {
    /// The value on success, or the last error on failure.
    pub result: Result<T, E>,
    /// Attempts made, always at least 1.
    pub attempts: u32,
    /// Time from the first attempt to the final outcome, delays included.
    pub elapsed: Duration,
}

impl<T, E> RetryOutcome<T, E> {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }

    pub fn value(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&E> {
        self.result.as_ref().err()
    }

    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

/// Stateless retry loop over an injected [`Clock`].
#[derive(Clone)]
pub struct BackoffExecutor {
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for BackoffExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffExecutor").finish_non_exhaustive()
    }
}

impl Default for BackoffExecutor {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl BackoffExecutor {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run `operation` under `policy`.
    ///
    /// Stops on the first success, on an error the predicate rejects, or once
    /// `max_attempts` attempts have failed. Between attempts the task is
    /// suspended on the clock for the policy's backoff delay.
    pub async fn execute<T, E, F, Fut>(
        &self,
        policy: &RetryPolicy<E>,
        mut operation: F,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let started = self.clock.now();
        let max_attempts = policy.max_attempts().max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "operation succeeded after retries");
                    }
                    return self.finish(Ok(value), attempt, started);
                }
                Err(error) => error,
            };

            if !policy.should_retry(&error) {
                debug!(attempt, error = %error, "error is not retryable");
                return self.finish(Err(error), attempt, started);
            }

            if attempt >= max_attempts {
                warn!(attempts = attempt, error = %error, "retries exhausted");
                return self.finish(Err(error), attempt, started);
            }

            let delay = policy.backoff().delay_after(attempt);
            debug!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "attempt failed, backing off"
            );
            self.clock.sleep(delay).await;
        }
    }

    fn finish<T, E>(
        &self,
        result: Result<T, E>,
        attempts: u32,
        started: chrono::DateTime<chrono::Utc>,
    ) -> RetryOutcome<T, E> {
        RetryOutcome {
            result,
            attempts,
            elapsed: (self.clock.now() - started).to_std().unwrap_or_default(),
        }
    }
}

/// Run `operation` under `policy` on the system clock.
pub async fn execute_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy<E>,
    operation: F,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    BackoffExecutor::default().execute(policy, operation).await
}
