//! Queue entry types and policies.

use std::collections::BTreeMap;
use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use retrykit_core::{Backoff, Command, OperationError, OperationId, PolicyError, RetryRule};

/// Version tag written into queue snapshots.
pub const QUEUE_SNAPSHOT_VERSION: u32 = 1;

/// Schedule and retry rule for one queued operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueuePolicy {
    pub backoff: Backoff,
    pub retry_rule: RetryRule,
}

impl QueuePolicy {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            retry_rule: RetryRule::Always,
        }
    }

    pub fn transient_only(mut self) -> Self {
        self.retry_rule = RetryRule::TransientOnly;
        self
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        self.backoff.validate()
    }
}

/// Caller-supplied metadata carried alongside a queued command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationMetadata {
    /// Hand the command to the failure sink if it exhausts its attempts.
    pub durable: bool,
    /// Free-form labels for diagnostics.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl OperationMetadata {
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Where an entry is in its lifecycle while it is still in the queue.
///
/// Succeeded and exhausted entries are removed, so they have no state here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Waiting for `next_eligible_at`.
    Pending,
    /// An attempt is in flight.
    Running,
}

/// A deferred operation owned by an [`crate::queue::OperationQueue`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: OperationId,
    pub command: Command,
    /// Higher runs first.
    pub priority: i32,
    pub attempts_used: u32,
    pub policy: QueuePolicy,
    pub metadata: OperationMetadata,
    pub state: OperationState,
    /// Not drained before this instant.
    pub next_eligible_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Most recent failure message.
    pub last_error: Option<String>,
}

impl QueuedOperation {
    pub fn new(
        command: Command,
        policy: QueuePolicy,
        priority: i32,
        metadata: OperationMetadata,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: OperationId::new(),
            command,
            priority,
            attempts_used: 0,
            policy,
            metadata,
            state: OperationState::Pending,
            next_eligible_at: now,
            created_at: now,
            last_attempt_at: None,
            last_error: None,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.backoff.max_attempts
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == OperationState::Pending && self.next_eligible_at <= now
    }

    /// Mark the entry as running and count the attempt.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) {
        self.state = OperationState::Running;
        self.attempts_used += 1;
        self.last_attempt_at = Some(now);
    }

    /// Whether a failure with `error` ends this entry's life.
    pub fn is_exhausted_by(&self, error: &OperationError) -> bool {
        !self.policy.backoff.allows_another(self.attempts_used)
            || !self.policy.retry_rule.allows(error)
    }

    /// Drain order: priority desc, then next_eligible_at asc; creation time and
    /// id break remaining ties so the order is total.
    pub fn drain_order(a: &Self, b: &Self) -> Ordering {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.next_eligible_at.cmp(&b.next_eligible_at))
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    }
}

/// Counts reported by [`crate::queue::OperationQueue::status`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    /// Pending entries whose `next_eligible_at` has passed.
    pub eligible: usize,
    /// Earliest `next_eligible_at` among pending entries.
    pub next_eligible_at: Option<DateTime<Utc>>,
}

/// What happened to one entry during a drain pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum AttemptOutcome {
    Succeeded,
    Deferred { next_eligible_at: DateTime<Utc> },
    /// Removed after its last allowed attempt or a non-retryable error.
    /// `handed_off` is true once a durable entry reached the failure sink.
    Exhausted {
        error: String,
        durable: bool,
        handed_off: bool,
    },
    /// Removed while its attempt was in flight; the result was discarded.
    Cancelled,
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainReport {
    /// Attempts in the order they were made.
    pub attempts: Vec<(OperationId, AttemptOutcome)>,
    pub succeeded: usize,
    pub deferred: usize,
    pub exhausted: usize,
    pub cancelled: usize,
    /// Durable entries the failure sink refused.
    pub handoff_failures: usize,
    /// The refused entries themselves, no longer queued. The caller owns them.
    pub unpersisted: Vec<QueuedOperation>,
}

impl DrainReport {
    pub fn attempted(&self) -> usize {
        self.attempts.len()
    }

    pub(crate) fn record(&mut self, id: OperationId, outcome: AttemptOutcome) {
        match &outcome {
            AttemptOutcome::Succeeded => self.succeeded += 1,
            AttemptOutcome::Deferred { .. } => self.deferred += 1,
            AttemptOutcome::Exhausted {
                durable,
                handed_off,
                ..
            } => {
                self.exhausted += 1;
                if *durable && !*handed_off {
                    self.handoff_failures += 1;
                }
            }
            AttemptOutcome::Cancelled => self.cancelled += 1,
        }
        self.attempts.push((id, outcome));
    }
}

/// Serializable image of a whole queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub version: u32,
    pub operations: Vec<QueuedOperation>,
}
