//! Run a command now, and keep it if it cannot be completed.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use retrykit_core::{
    BackoffExecutor, Clock, Command, OperationError, OperationId, OperationKind, PolicyError,
    RecordId, RetryOutcome,
};

use crate::queue::{HandlerRegistry, OperationMetadata, OperationQueue, QueuePolicy};
use crate::store::{FailureStore, StoreError};

/// Durable runner error. Operation failures are reported in
/// [`RunReport::outcome`], not here.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid retry policy: {0}")]
    InvalidPolicy(#[from] PolicyError),

    #[error("no handler registered for operation kind `{0}`")]
    NoHandler(OperationKind),

    #[error("failed to persist exhausted operation: {0}")]
    Store(#[from] StoreError),
}

/// What [`DurableRunner::run`] did with a command.
#[derive(Debug)]
pub struct RunReport {
    pub outcome: RetryOutcome<(), OperationError>,
    /// Set when the failure was written to the store.
    pub stored: Option<RecordId>,
    /// Set when the failure was handed to the queue for later attempts.
    pub deferred: Option<OperationId>,
}

/// Executes commands through the backoff executor and routes durable
/// failures onward.
///
/// A durable command that fails with a transient error is re-enqueued when a
/// queue is attached (the queue persists it if it exhausts there too).
/// Otherwise, or when the queue refuses it, a durable failure is written
/// straight to the store.
pub struct DurableRunner {
    executor: BackoffExecutor,
    registry: HandlerRegistry,
    store: Arc<FailureStore>,
    queue: Option<Arc<OperationQueue>>,
}

impl DurableRunner {
    pub fn new(registry: HandlerRegistry, store: Arc<FailureStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            executor: BackoffExecutor::new(clock),
            registry,
            store,
            queue: None,
        }
    }

    pub fn with_queue(mut self, queue: Arc<OperationQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub async fn run(
        &self,
        command: Command,
        policy: QueuePolicy,
        priority: i32,
        metadata: OperationMetadata,
    ) -> Result<RunReport, RunError> {
        let retry_policy = policy.retry_rule.policy(policy.backoff.clone())?;
        let handler = self
            .registry
            .resolve(&command.kind)
            .ok_or_else(|| RunError::NoHandler(command.kind.clone()))?;

        let outcome = self
            .executor
            .execute(&retry_policy, || {
                let handler = Arc::clone(&handler);
                let command = command.clone();
                async move { handler.handle(command).await }
            })
            .await;

        let mut report = RunReport {
            outcome,
            stored: None,
            deferred: None,
        };

        let Some(error) = report.outcome.error() else {
            return Ok(report);
        };
        if !metadata.durable {
            return Ok(report);
        }

        let message = error.message.clone();
        if let Some(queue) = self.queue.as_ref().filter(|_| error.is_transient()) {
            match queue.enqueue(command.clone(), policy, priority, metadata) {
                Ok(id) => {
                    info!(operation_id = %id, kind = %command.kind, "failed operation deferred to queue");
                    report.deferred = Some(id);
                    return Ok(report);
                }
                Err(err) => {
                    warn!(kind = %command.kind, error = %err, "queue refused failed operation, persisting instead");
                }
            }
        }

        let id = self
            .store
            .store_failure(command.kind.clone(), command.payload.clone(), message, priority)?;
        warn!(record_id = %id, kind = %command.kind, "failed operation persisted");
        report.stored = Some(id);

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::store::InMemoryKv;
    use retrykit_core::{Backoff, ManualClock};
    use serde_json::json;
    use std::time::Duration;

    fn policy() -> QueuePolicy {
        QueuePolicy::new(Backoff {
            max_attempts: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            exponential_base: 2.0,
            jitter: false,
        })
    }

    fn parts(fail: OperationError) -> (HandlerRegistry, Arc<FailureStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(
            FailureStore::open(Arc::new(InMemoryKv::new()), StoreConfig::default(), clock.clone())
                .unwrap(),
        );
        let registry = HandlerRegistry::new().with("create", move |_cmd: Command| {
            let fail = fail.clone();
            async move { Err::<(), _>(fail) }
        });
        (registry, store, clock)
    }

    fn create() -> Command {
        Command::new(OperationKind::Create, json!({ "sku": "A-1" }))
    }

    #[tokio::test]
    async fn durable_failure_is_stored_without_a_queue() {
        let (registry, store, clock) = parts(OperationError::transient("503"));
        let runner = DurableRunner::new(registry, store.clone(), clock.clone());

        let report = runner
            .run(create(), policy(), 3, OperationMetadata::durable())
            .await
            .unwrap();

        assert_eq!(report.outcome.attempts, 2);
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(100)]);
        let record = store.get(report.stored.unwrap()).unwrap();
        assert_eq!(record.payload, json!({ "sku": "A-1" }));
        assert_eq!(record.priority, 3);
        assert_eq!(record.last_error, "503");
    }

    #[tokio::test]
    async fn transient_durable_failure_is_deferred_when_queue_attached() {
        let (registry, store, clock) = parts(OperationError::transient("503"));
        let queue = OperationQueue::new(registry.clone(), clock.clone())
            .with_failure_sink(store.clone())
            .arc();
        let runner = DurableRunner::new(registry, store.clone(), clock).with_queue(queue.clone());

        let report = runner
            .run(create(), policy(), 0, OperationMetadata::durable())
            .await
            .unwrap();

        assert!(report.stored.is_none());
        assert!(queue.get(report.deferred.unwrap()).is_some());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn refused_deferral_falls_back_to_the_store() {
        let (registry, store, clock) = parts(OperationError::transient("503"));
        // No failure sink, so the queue will not accept durable entries.
        let queue = OperationQueue::new(registry.clone(), clock.clone()).arc();
        let runner = DurableRunner::new(registry, store.clone(), clock).with_queue(queue.clone());

        let report = runner
            .run(create(), policy(), 2, OperationMetadata::durable())
            .await
            .unwrap();

        assert!(report.deferred.is_none());
        assert!(queue.is_empty());
        let record = store.get(report.stored.unwrap()).unwrap();
        assert_eq!(record.payload, json!({ "sku": "A-1" }));
        assert_eq!(record.priority, 2);
        assert_eq!(record.last_error, "503");
    }

    #[tokio::test]
    async fn permanent_failure_skips_the_queue() {
        let (registry, store, clock) = parts(OperationError::permanent("422"));
        let queue = OperationQueue::new(registry.clone(), clock.clone())
            .with_failure_sink(store.clone())
            .arc();
        let runner = DurableRunner::new(registry, store.clone(), clock).with_queue(queue.clone());

        let report = runner
            .run(create(), policy().transient_only(), 0, OperationMetadata::durable())
            .await
            .unwrap();

        assert_eq!(report.outcome.attempts, 1);
        assert!(report.stored.is_some());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn non_durable_failure_is_only_reported() {
        let (registry, store, clock) = parts(OperationError::transient("503"));
        let runner = DurableRunner::new(registry, store.clone(), clock);

        let report = runner
            .run(create(), policy(), 0, OperationMetadata::default())
            .await
            .unwrap();

        assert!(!report.outcome.succeeded());
        assert!(report.stored.is_none() && report.deferred.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn unknown_kind_is_an_error() {
        let (registry, store, clock) = parts(OperationError::transient("503"));
        let runner = DurableRunner::new(registry, store, clock);

        let err = runner
            .run(
                Command::new(OperationKind::Delete, json!({})),
                policy(),
                0,
                OperationMetadata::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::NoHandler(OperationKind::Delete)));
    }
}
