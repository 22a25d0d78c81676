//! In-memory priority queue of deferred operations with per-entry backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, info, warn};

use retrykit_core::clock::add_duration;
use retrykit_core::{Clock, Command, OperationError, OperationId};

use super::error::QueueError;
use super::registry::HandlerRegistry;
use super::sink::FailureSink;
use super::types::{
    AttemptOutcome, DrainReport, OperationMetadata, OperationState, QUEUE_SNAPSHOT_VERSION,
    QueuePolicy, QueueSnapshot, QueueStatus, QueuedOperation,
};
use crate::store::KeyValueStore;

/// Durable operation queue.
///
/// Entries are kept sorted by `(priority desc, next_eligible_at asc)`.
/// [`OperationQueue::drain`] makes at most one attempt per eligible entry per
/// pass; enqueue and remove never suspend and may run while a pass is in
/// progress.
pub struct OperationQueue {
    entries: Mutex<Vec<QueuedOperation>>,
    registry: HandlerRegistry,
    clock: Arc<dyn Clock>,
    sink: Option<Arc<dyn FailureSink>>,
    draining: AtomicBool,
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("len", &self.len())
            .field("registry", &self.registry)
            .field("has_sink", &self.sink.is_some())
            .field("draining", &self.is_draining())
            .finish()
    }
}

impl OperationQueue {
    pub fn new(registry: HandlerRegistry, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            registry,
            clock,
            sink: None,
            draining: AtomicBool::new(false),
        }
    }

    /// Route exhausted durable entries to `sink`.
    pub fn with_failure_sink(mut self, sink: Arc<dyn FailureSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Register a command for deferred execution.
    ///
    /// Returns immediately; the first attempt happens on the next drain pass.
    pub fn enqueue(
        &self,
        command: Command,
        policy: QueuePolicy,
        priority: i32,
        metadata: OperationMetadata,
    ) -> Result<OperationId, QueueError> {
        policy.validate()?;
        if !self.registry.contains(&command.kind) {
            return Err(QueueError::NoHandler(command.kind));
        }
        if metadata.durable && self.sink.is_none() {
            return Err(QueueError::NoFailureSink);
        }

        let op = QueuedOperation::new(command, policy, priority, metadata, self.clock.now());
        let id = op.id;
        debug!(operation_id = %id, kind = %op.command.kind, priority, "operation enqueued");

        let mut entries = self.lock();
        entries.push(op);
        entries.sort_by(QueuedOperation::drain_order);
        Ok(id)
    }

    /// Cancel an entry in any state. Returns `false` if it was not queued.
    ///
    /// An entry that is mid-attempt finishes that attempt; its result is
    /// discarded.
    pub fn remove(&self, id: OperationId) -> bool {
        let mut entries = self.lock();
        match entries.iter().position(|e| e.id == id) {
            Some(pos) => {
                let removed = entries.remove(pos);
                debug!(operation_id = %id, state = ?removed.state, "operation removed");
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: OperationId) -> Option<QueuedOperation> {
        self.lock().iter().find(|e| e.id == id).cloned()
    }

    /// All entries in drain order.
    pub fn entries(&self) -> Vec<QueuedOperation> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn status(&self) -> QueueStatus {
        let now = self.clock.now();
        let entries = self.lock();

        let mut status = QueueStatus {
            total: entries.len(),
            ..Default::default()
        };
        for entry in entries.iter() {
            match entry.state {
                OperationState::Pending => {
                    status.pending += 1;
                    if entry.next_eligible_at <= now {
                        status.eligible += 1;
                    }
                    status.next_eligible_at = Some(match status.next_eligible_at {
                        Some(at) => at.min(entry.next_eligible_at),
                        None => entry.next_eligible_at,
                    });
                }
                OperationState::Running => status.running += 1,
            }
        }
        status
    }

    /// Run one drain pass.
    ///
    /// Returns `None` without doing anything if another pass is still running.
    /// Eligible entries are snapshotted at the start and attempted once each,
    /// in drain order; entries removed before their turn are skipped.
    pub async fn drain(&self) -> Option<DrainReport> {
        let Some(_guard) = DrainGuard::acquire(&self.draining) else {
            debug!("drain pass already running, skipping");
            return None;
        };

        let now = self.clock.now();
        let due: Vec<OperationId> = self
            .lock()
            .iter()
            .filter(|e| e.is_eligible(now))
            .map(|e| e.id)
            .collect();

        let mut report = DrainReport::default();
        for id in due {
            let Some(command) = self.begin_attempt(id) else {
                continue;
            };
            let result = self.attempt(command).await;
            let (outcome, refused) = self.settle(id, result);
            report.record(id, outcome);
            report.unpersisted.extend(refused);
        }

        self.lock().sort_by(QueuedOperation::drain_order);

        if report.attempted() > 0 {
            info!(
                attempted = report.attempted(),
                succeeded = report.succeeded,
                deferred = report.deferred,
                exhausted = report.exhausted,
                cancelled = report.cancelled,
                "drain pass finished"
            );
        }
        Some(report)
    }

    fn begin_attempt(&self, id: OperationId) -> Option<Command> {
        let now = self.clock.now();
        let mut entries = self.lock();
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id && e.state == OperationState::Pending)?;
        entry.begin_attempt(now);
        debug!(
            operation_id = %id,
            attempt = entry.attempts_used,
            max_attempts = entry.max_attempts(),
            "attempting operation"
        );
        Some(entry.command.clone())
    }

    async fn attempt(&self, command: Command) -> Result<(), OperationError> {
        match self.registry.resolve(&command.kind) {
            Some(handler) => handler.handle(command).await,
            None => Err(OperationError::transient(format!(
                "no handler registered for operation kind `{}`",
                command.kind
            ))),
        }
    }

    /// Apply an attempt's result. A durable entry the sink refused is handed
    /// back so it is not lost.
    fn settle(
        &self,
        id: OperationId,
        result: Result<(), OperationError>,
    ) -> (AttemptOutcome, Option<QueuedOperation>) {
        let now = self.clock.now();
        let mut entries = self.lock();

        let Some(pos) = entries.iter().position(|e| e.id == id) else {
            debug!(operation_id = %id, "operation removed mid-attempt, discarding result");
            return (AttemptOutcome::Cancelled, None);
        };

        let error = match result {
            Ok(()) => {
                entries.remove(pos);
                debug!(operation_id = %id, "operation succeeded");
                return (AttemptOutcome::Succeeded, None);
            }
            Err(error) => error,
        };

        let entry = &mut entries[pos];
        entry.last_error = Some(error.message.clone());

        if !entry.is_exhausted_by(&error) {
            let delay = entry.policy.backoff.delay_after(entry.attempts_used);
            entry.next_eligible_at = add_duration(now, delay);
            entry.state = OperationState::Pending;
            let next_eligible_at = entry.next_eligible_at;
            debug!(
                operation_id = %id,
                attempt = entry.attempts_used,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "operation deferred"
            );
            entries.sort_by(QueuedOperation::drain_order);
            return (AttemptOutcome::Deferred { next_eligible_at }, None);
        }

        let entry = entries.remove(pos);
        drop(entries);

        warn!(
            operation_id = %id,
            kind = %entry.command.kind,
            attempts = entry.attempts_used,
            error = %error,
            "operation exhausted"
        );

        let durable = entry.metadata.durable;
        let handed_off = durable && self.hand_off(&entry, &error);
        let outcome = AttemptOutcome::Exhausted {
            error: error.message,
            durable,
            handed_off,
        };
        let refused = (durable && !handed_off).then_some(entry);
        (outcome, refused)
    }

    fn hand_off(&self, entry: &QueuedOperation, error: &OperationError) -> bool {
        let Some(sink) = &self.sink else {
            error!(
                operation_id = %entry.id,
                kind = %entry.command.kind,
                "durable operation exhausted with no failure sink configured"
            );
            return false;
        };

        match sink.accept(entry, error) {
            Ok(()) => true,
            Err(err) => {
                error!(
                    operation_id = %entry.id,
                    kind = %entry.command.kind,
                    error = %err,
                    "failed to hand off exhausted durable operation"
                );
                false
            }
        }
    }

    /// Serializable image of every entry. In-flight entries appear as pending.
    pub fn snapshot(&self) -> QueueSnapshot {
        let operations = self
            .lock()
            .iter()
            .cloned()
            .map(|mut op| {
                op.state = OperationState::Pending;
                op
            })
            .collect();
        QueueSnapshot {
            version: QUEUE_SNAPSHOT_VERSION,
            operations,
        }
    }

    /// Load entries from a snapshot, skipping ids already queued.
    ///
    /// Returns how many entries were added. A snapshot holding durable
    /// entries is refused as a whole when no failure sink is configured.
    pub fn restore(&self, snapshot: QueueSnapshot) -> Result<usize, QueueError> {
        if snapshot.version != QUEUE_SNAPSHOT_VERSION {
            return Err(QueueError::UnsupportedSnapshotVersion(snapshot.version));
        }
        if self.sink.is_none() && snapshot.operations.iter().any(|op| op.metadata.durable) {
            return Err(QueueError::NoFailureSink);
        }

        let mut entries = self.lock();
        let mut added = 0;
        for mut op in snapshot.operations {
            if entries.iter().any(|e| e.id == op.id) {
                continue;
            }
            if !self.registry.contains(&op.command.kind) {
                warn!(
                    operation_id = %op.id,
                    kind = %op.command.kind,
                    "restored operation has no registered handler"
                );
            }
            op.state = OperationState::Pending;
            entries.push(op);
            added += 1;
        }
        entries.sort_by(QueuedOperation::drain_order);
        info!(added, total = entries.len(), "queue restored from snapshot");
        Ok(added)
    }

    /// Persist the whole queue under `key`.
    pub fn save_to(&self, kv: &dyn KeyValueStore, key: &str) -> Result<(), QueueError> {
        let json = serde_json::to_string(&self.snapshot())?;
        kv.set(key, &json)?;
        Ok(())
    }

    /// Rehydrate from `key`; a missing key restores nothing.
    pub fn load_from(&self, kv: &dyn KeyValueStore, key: &str) -> Result<usize, QueueError> {
        match kv.get(key)? {
            Some(json) => self.restore(serde_json::from_str(&json)?),
            None => Ok(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<QueuedOperation>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Marks a drain pass as running for as long as it lives.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
