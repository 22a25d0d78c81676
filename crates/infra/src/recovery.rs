//! Replay of persisted failures, typically at startup or when connectivity
//! returns.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use retrykit_core::Command;

use crate::queue::HandlerRegistry;
use crate::store::{FailureStore, StoreError};

/// Counts from one [`RecoveryPass::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Succeeded and deleted from the store.
    pub replayed: usize,
    /// Failed again; retry count incremented.
    pub failed: usize,
    /// No handler registered for the record's kind.
    pub skipped: usize,
}

/// One sweep over the replayable records of a [`FailureStore`].
pub struct RecoveryPass {
    store: Arc<FailureStore>,
    registry: HandlerRegistry,
}

impl RecoveryPass {
    pub fn new(store: Arc<FailureStore>, registry: HandlerRegistry) -> Self {
        Self { store, registry }
    }

    /// Attempt every replayable record once, highest priority first.
    ///
    /// Handler failures are recorded on the record. Store write failures stop
    /// the pass and are returned.
    pub async fn run(&self) -> Result<ReplayReport, StoreError> {
        let records = self.store.list_replayable();
        let mut report = ReplayReport::default();

        if records.is_empty() {
            debug!("no failure records to replay");
            return Ok(report);
        }

        for record in records {
            let Some(handler) = self.registry.resolve(&record.kind) else {
                warn!(record_id = %record.id, kind = %record.kind, "no handler for failure record, skipping");
                report.skipped += 1;
                continue;
            };

            let command = Command::new(record.kind.clone(), record.payload.clone());
            match handler.handle(command).await {
                Ok(()) => {
                    self.store.mark_replayed(record.id)?;
                    report.replayed += 1;
                }
                Err(error) => {
                    debug!(record_id = %record.id, error = %error, "replay failed");
                    self.store.record_retry_failure(record.id, error.message)?;
                    report.failed += 1;
                }
            }
        }

        info!(
            replayed = report.replayed,
            failed = report.failed,
            skipped = report.skipped,
            "recovery pass finished"
        );
        Ok(report)
    }
}
