//! Background task that drains a queue on a fixed interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::operation_queue::OperationQueue;

/// Default interval between drain passes.
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_secs(5);

/// Spawns periodic drain passes over an [`OperationQueue`].
pub struct DrainScheduler;

impl DrainScheduler {
    /// Start draining `queue` every `interval`.
    ///
    /// The first pass runs immediately. A tick that lands while the previous
    /// pass is still running is skipped.
    pub fn spawn(queue: Arc<OperationQueue>, interval: Duration) -> DrainHandle {
        let shutdown = Arc::new(Notify::new());
        let passes = Arc::new(AtomicU64::new(0));

        let task = {
            let shutdown = shutdown.clone();
            let passes = passes.clone();
            tokio::spawn(async move {
                tracing::info!(interval_ms = interval.as_millis() as u64, "drain scheduler started");

                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = shutdown.notified() => {
                            tracing::info!("drain scheduler received shutdown signal");
                            break;
                        }
                        _ = ticker.tick() => {
                            if let Some(report) = queue.drain().await {
                                passes.fetch_add(1, Ordering::Relaxed);
                                if report.handoff_failures > 0 {
                                    tracing::error!(
                                        handoff_failures = report.handoff_failures,
                                        "durable operations were lost during drain"
                                    );
                                }
                            }
                        }
                    }
                }

                tracing::info!("drain scheduler stopped");
            })
        };

        DrainHandle {
            shutdown,
            passes,
            task,
        }
    }
}

/// Handle to a running [`DrainScheduler`] task.
pub struct DrainHandle {
    shutdown: Arc<Notify>,
    passes: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl DrainHandle {
    /// Completed drain passes so far.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Stop the scheduler and wait for the task to exit.
    ///
    /// A pass that is already running finishes first.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(err) = self.task.await {
            tracing::error!(error = %err, "drain scheduler task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{HandlerRegistry, OperationMetadata, QueuePolicy};
    use retrykit_core::{Backoff, Command, ManualClock, OperationError, OperationKind};
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn drains_on_each_tick_until_shutdown() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let registry = HandlerRegistry::new().with("*", move |_cmd: Command| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), OperationError>(()) }
        });
        let clock = Arc::new(ManualClock::starting_now());
        let queue = OperationQueue::new(registry, clock).arc();

        let handle = DrainScheduler::spawn(queue.clone(), Duration::from_secs(5));
        queue
            .enqueue(
                Command::new(OperationKind::Create, serde_json::json!({})),
                QueuePolicy::new(Backoff::default()),
                0,
                OperationMetadata::default(),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        let passes = handle.passes();
        handle.shutdown().await;

        assert!(passes >= 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_before_first_tick_returns() {
        let clock = Arc::new(ManualClock::starting_now());
        let queue = OperationQueue::new(HandlerRegistry::new(), clock).arc();

        let handle = DrainScheduler::spawn(queue, Duration::from_secs(60));
        handle.shutdown().await;
    }
}
