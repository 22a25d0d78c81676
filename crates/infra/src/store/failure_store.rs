//! Persistent store of durable operations that ran out of attempts.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use retrykit_core::{Clock, OperationError, OperationKind, RecordId};

use super::kv::{KeyValueStore, KvError};
use super::record::{PersistedFailureRecord, StoreDocument};
use crate::config::StoreConfig;
use crate::queue::{FailureSink, HandoffError, QueuedOperation};

/// Failure store error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend stayed over quota after one eviction cycle.
    #[error("storage full: write failed after evicting {evicted} records")]
    StorageFull { evicted: usize },

    #[error("failure record not found: {0}")]
    NotFound(RecordId),

    #[error("unsupported store schema version {0}")]
    UnsupportedVersion(u64),

    #[error("corrupt store document: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(#[from] KvError),
}

/// Summary counts for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub replayable: usize,
    /// Records that used up their replay attempts.
    pub exhausted: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub by_kind: BTreeMap<String, usize>,
}

/// Durable collection of [`PersistedFailureRecord`]s.
///
/// Records are cached in memory and written through to a single key on every
/// mutation. The cache is only updated once the write has succeeded.
pub struct FailureStore {
    kv: Arc<dyn KeyValueStore>,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    records: Mutex<Vec<PersistedFailureRecord>>,
}

impl std::fmt::Debug for FailureStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureStore")
            .field("config", &self.config)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl FailureStore {
    /// Load the collection stored under `config.storage_key`.
    ///
    /// Legacy documents are migrated and written back in the current layout.
    /// Expired records are dropped.
    pub fn open(
        kv: Arc<dyn KeyValueStore>,
        config: StoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let (mut records, migrated) = match kv.get(&config.storage_key)? {
            Some(json) => {
                let decoded = StoreDocument::decode(&json)?;
                (decoded.document.records, decoded.migrated_from)
            }
            None => (Vec::new(), None),
        };

        let store = Self {
            kv,
            config,
            clock,
            records: Mutex::new(Vec::new()),
        };

        let loaded = records.len();
        let evicted = store.enforce_retention(&mut records);
        if let Some(from) = migrated {
            info!(from_version = from, records = records.len(), "migrated legacy failure store");
        }
        if migrated.is_some() || evicted > 0 {
            store.write_with_eviction(&mut records, None)?;
        }

        info!(
            key = %store.config.storage_key,
            loaded,
            retained = records.len(),
            "failure store opened"
        );
        *store.lock() = records;
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Persist a new failure record and apply retention.
    ///
    /// The returned id may already be gone if the new record was itself the
    /// lowest-priority one over the count limit.
    pub fn store_failure(
        &self,
        kind: OperationKind,
        payload: Value,
        last_error: impl Into<String>,
        priority: i32,
    ) -> Result<RecordId, StoreError> {
        let record = PersistedFailureRecord::new(kind, payload, last_error, priority, self.clock.now());
        let id = record.id;

        let mut records = self.lock();
        let mut next = records.clone();
        next.push(record);
        self.enforce_retention(&mut next);
        self.write_with_eviction(&mut next, Some(id))?;

        if next.iter().any(|r| r.id == id) {
            debug!(record_id = %id, priority, total = next.len(), "failure record stored");
        } else {
            warn!(record_id = %id, priority, "new failure record evicted by retention");
        }
        *records = next;
        Ok(id)
    }

    /// Records still allowed another replay, highest priority and oldest first.
    ///
    /// Records past `max_age` are left out even before retention removes them.
    pub fn list_replayable(&self) -> Vec<PersistedFailureRecord> {
        let now = self.clock.now();
        let mut out: Vec<_> = self
            .lock()
            .iter()
            .filter(|r| r.retry_count < self.config.max_replay_attempts && !self.is_expired(r, now))
            .cloned()
            .collect();
        out.sort_by(PersistedFailureRecord::replay_order);
        out
    }

    /// Delete a record after a successful replay. Returns `false` if absent.
    pub fn mark_replayed(&self, id: RecordId) -> Result<bool, StoreError> {
        let mut records = self.lock();
        if !records.iter().any(|r| r.id == id) {
            return Ok(false);
        }
        let mut next: Vec<_> = records.iter().filter(|r| r.id != id).cloned().collect();
        self.write_with_eviction(&mut next, None)?;
        *records = next;
        debug!(record_id = %id, "failure record replayed");
        Ok(true)
    }

    /// Count a failed replay against a record.
    pub fn record_retry_failure(
        &self,
        id: RecordId,
        last_error: impl Into<String>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut records = self.lock();
        let mut next = records.clone();
        let record = next
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))?;
        record.retry_count += 1;
        record.last_error = last_error.into();
        record.last_attempt_at = Some(now);
        let retry_count = record.retry_count;

        self.write_with_eviction(&mut next, Some(id))?;
        *records = next;
        debug!(record_id = %id, retry_count, "replay failed");
        Ok(())
    }

    pub fn get(&self, id: RecordId) -> Option<PersistedFailureRecord> {
        self.lock().iter().find(|r| r.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Every record in replay order, exhausted ones included.
    pub fn all(&self) -> Vec<PersistedFailureRecord> {
        let mut out = self.lock().clone();
        out.sort_by(PersistedFailureRecord::replay_order);
        out
    }

    pub fn stats(&self) -> StoreStats {
        let records = self.lock();
        let mut stats = StoreStats {
            total: records.len(),
            ..Default::default()
        };
        for record in records.iter() {
            if record.retry_count < self.config.max_replay_attempts {
                stats.replayable += 1;
            } else {
                stats.exhausted += 1;
            }
            stats.oldest = Some(match stats.oldest {
                Some(at) => at.min(record.timestamp),
                None => record.timestamp,
            });
            *stats.by_kind.entry(record.kind.to_string()).or_default() += 1;
        }
        stats
    }

    /// Apply retention now. Returns how many records were dropped.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let mut records = self.lock();
        let mut next = records.clone();
        let evicted = self.enforce_retention(&mut next);
        if evicted > 0 {
            self.write_with_eviction(&mut next, None)?;
            *records = next;
        }
        Ok(evicted)
    }

    /// Delete every record and the stored key.
    pub fn clear(&self) -> Result<(), StoreError> {
        let mut records = self.lock();
        self.kv.remove(&self.config.storage_key)?;
        let cleared = records.len();
        records.clear();
        info!(cleared, "failure store cleared");
        Ok(())
    }

    /// The whole collection as a versioned JSON document.
    pub fn export_all(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string_pretty(&StoreDocument::new(self.all()))?)
    }

    /// Merge records from an exported document or a legacy bare array.
    ///
    /// Incoming records replace stored ones with the same id. Retention is
    /// applied to the merged set. Returns how many records were read.
    pub fn import_all(&self, json: &str) -> Result<usize, StoreError> {
        let incoming = StoreDocument::decode(json)?.document.records;
        let count = incoming.len();

        let mut records = self.lock();
        let mut next: Vec<_> = records
            .iter()
            .filter(|r| !incoming.iter().any(|i| i.id == r.id))
            .cloned()
            .collect();
        next.extend(incoming);
        let evicted = self.enforce_retention(&mut next);
        self.write_with_eviction(&mut next, None)?;
        *records = next;

        info!(imported = count, evicted, total = records.len(), "failure records imported");
        Ok(count)
    }

    /// Drop expired records, then the lowest-priority/oldest ones over the
    /// count limit. Returns how many were dropped.
    fn enforce_retention(&self, records: &mut Vec<PersistedFailureRecord>) -> usize {
        let before = records.len();
        let now = self.clock.now();
        records.retain(|r| !self.is_expired(r, now));
        let expired = before - records.len();

        let over = records.len().saturating_sub(self.config.max_records);
        if over > 0 {
            records.sort_by(PersistedFailureRecord::eviction_order);
            *records = records.split_off(over);
        }
        records.sort_by(PersistedFailureRecord::replay_order);

        if expired + over > 0 {
            debug!(expired, over_limit = over, "retention evicted failure records");
        }
        expired + over
    }

    fn is_expired(&self, record: &PersistedFailureRecord, now: DateTime<Utc>) -> bool {
        let max_age = chrono::Duration::from_std(self.config.max_age).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(record.timestamp) > max_age
    }

    fn write(&self, records: &[PersistedFailureRecord]) -> Result<(), StoreError> {
        let json = serde_json::to_string(&StoreDocument::new(records.to_vec()))?;
        self.kv.set(&self.config.storage_key, &json)?;
        Ok(())
    }

    /// Write `records`; on a quota error evict the oldest half of the records
    /// other than `keep` and try exactly once more.
    fn write_with_eviction(
        &self,
        records: &mut Vec<PersistedFailureRecord>,
        keep: Option<RecordId>,
    ) -> Result<(), StoreError> {
        match self.write(records) {
            Err(StoreError::Storage(KvError::QuotaExceeded { needed, limit })) => {
                let mut others: Vec<_> = records
                    .iter()
                    .filter(|r| Some(r.id) != keep)
                    .map(|r| (r.timestamp, r.id))
                    .collect();
                others.sort();
                let evict = others.len().div_ceil(2);
                let doomed: Vec<RecordId> = others.into_iter().take(evict).map(|(_, id)| id).collect();
                records.retain(|r| !doomed.contains(&r.id));

                warn!(needed, limit, evicted = evict, "store over quota, evicted oldest records");

                match self.write(records) {
                    Err(StoreError::Storage(KvError::QuotaExceeded { .. })) => {
                        Err(StoreError::StorageFull { evicted: evict })
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PersistedFailureRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FailureSink for FailureStore {
    fn accept(
        &self,
        operation: &QueuedOperation,
        error: &OperationError,
    ) -> Result<(), HandoffError> {
        self.store_failure(
            operation.command.kind.clone(),
            operation.command.payload.clone(),
            error.message.clone(),
            operation.priority,
        )
        .map(|record_id| {
            info!(operation_id = %operation.id, record_id = %record_id, "exhausted operation persisted");
        })
        .map_err(|e| HandoffError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryKv;
    use proptest::prelude::*;
    use retrykit_core::ManualClock;
    use serde_json::json;
    use std::time::Duration;

    fn open_with(config: StoreConfig) -> (FailureStore, Arc<InMemoryKv>, Arc<ManualClock>) {
        let kv = Arc::new(InMemoryKv::new());
        let clock = Arc::new(ManualClock::starting_now());
        let store = FailureStore::open(kv.clone(), config, clock.clone()).unwrap();
        (store, kv, clock)
    }

    fn store_n(store: &FailureStore, clock: &ManualClock, priorities: &[i32]) -> Vec<RecordId> {
        priorities
            .iter()
            .map(|p| {
                clock.advance(Duration::from_secs(1));
                store
                    .store_failure(OperationKind::Update, json!({ "p": p }), "503", *p)
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn count_limit_evicts_lowest_priority() {
        let (store, _, clock) = open_with(StoreConfig::default().with_max_records(3));

        let ids = store_n(&store, &clock, &[1, 2, 3, 4]);

        assert_eq!(store.len(), 3);
        assert!(store.get(ids[0]).is_none());
        let priorities: Vec<i32> = store.list_replayable().iter().map(|r| r.priority).collect();
        assert_eq!(priorities, vec![4, 3, 2]);
    }

    #[test]
    fn equal_priority_evicts_oldest() {
        let (store, _, clock) = open_with(StoreConfig::default().with_max_records(2));

        let ids = store_n(&store, &clock, &[1, 1, 1]);

        assert!(store.get(ids[0]).is_none());
        assert!(store.get(ids[1]).is_some());
        assert!(store.get(ids[2]).is_some());
    }

    #[test]
    fn age_limit_is_measured_from_first_failure() {
        let config = StoreConfig::default().with_max_age(Duration::from_secs(60));
        let (store, _, clock) = open_with(config);
        let ids = store_n(&store, &clock, &[1]);

        clock.advance(Duration::from_secs(50));
        store.record_retry_failure(ids[0], "still down").unwrap();
        clock.advance(Duration::from_secs(20));

        assert_eq!(store.purge_expired().unwrap(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn expired_records_are_not_offered_for_replay() {
        let config = StoreConfig::default().with_max_age(Duration::from_secs(60));
        let (store, _, clock) = open_with(config);
        let ids = store_n(&store, &clock, &[1, 2]);

        clock.advance(Duration::from_secs(30));
        let fresh = store_n(&store, &clock, &[0]);
        clock.advance(Duration::from_secs(40));

        // Nothing has been written since the first two expired.
        assert_eq!(store.len(), 3);
        let replayable: Vec<RecordId> = store.list_replayable().iter().map(|r| r.id).collect();
        assert_eq!(replayable, fresh);
        assert!(!replayable.contains(&ids[0]) && !replayable.contains(&ids[1]));
    }

    #[test]
    fn writes_survive_reopen() {
        let (store, kv, clock) = open_with(StoreConfig::default());
        let ids = store_n(&store, &clock, &[2, 7]);
        store.record_retry_failure(ids[0], "timeout").unwrap();

        let reopened = FailureStore::open(kv, StoreConfig::default(), clock).unwrap();

        assert_eq!(reopened.all(), store.all());
        let record = reopened.get(ids[0]).unwrap();
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.last_error, "timeout");
        assert!(record.last_attempt_at.is_some());
    }

    #[test]
    fn replay_bookkeeping() {
        let config = StoreConfig::default().with_max_replay_attempts(2);
        let (store, _, clock) = open_with(config);
        let ids = store_n(&store, &clock, &[1, 1]);

        store.record_retry_failure(ids[0], "a").unwrap();
        store.record_retry_failure(ids[0], "b").unwrap();
        let replayable: Vec<RecordId> = store.list_replayable().iter().map(|r| r.id).collect();
        assert_eq!(replayable, vec![ids[1]]);
        assert_eq!(store.stats().exhausted, 1);

        assert!(store.mark_replayed(ids[1]).unwrap());
        assert!(!store.mark_replayed(ids[1]).unwrap());
        let missing = RecordId::new();
        assert!(matches!(
            store.record_retry_failure(missing, "x"),
            Err(StoreError::NotFound(id)) if id == missing
        ));
    }

    #[test]
    fn quota_error_evicts_oldest_half_and_retries_once() {
        let (store, kv, clock) = open_with(StoreConfig::default());
        store_n(&store, &clock, &[9, 9, 9, 9]);

        // Room for roughly three records.
        let per_record = kv.used_bytes() / 4;
        kv.set_quota(Some(per_record * 3 + per_record / 2));

        let id = store
            .store_failure(OperationKind::Create, json!({ "p": 0 }), "503", 0)
            .unwrap();

        assert!(store.get(id).is_some());
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn persistent_quota_error_is_storage_full() {
        let kv = Arc::new(InMemoryKv::with_quota(16));
        let clock = Arc::new(ManualClock::starting_now());
        let store = FailureStore::open(kv, StoreConfig::default(), clock).unwrap();

        let err = store
            .store_failure(OperationKind::Create, json!({}), "503", 0)
            .unwrap_err();

        assert!(matches!(err, StoreError::StorageFull { .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn legacy_array_is_migrated_on_open() {
        let kv = Arc::new(InMemoryKv::new());
        let now = Utc::now();
        let legacy = json!([{
            "id": "op_1",
            "type": "delete",
            "payload": { "id": 3 },
            "timestamp": now.timestamp_millis(),
            "retryCount": 0,
            "lastError": "offline",
            "priority": 1
        }]);
        kv.set("failed_operations", &legacy.to_string()).unwrap();

        let store = FailureStore::open(
            kv.clone(),
            StoreConfig::default(),
            Arc::new(ManualClock::new(now)),
        )
        .unwrap();

        assert_eq!(store.len(), 1);
        let stored: Value = serde_json::from_str(&kv.get("failed_operations").unwrap().unwrap()).unwrap();
        assert_eq!(stored["version"], 1);
        assert_eq!(stored["records"][0]["type"], "delete");
    }

    #[test]
    fn import_merges_by_id_and_applies_retention() {
        let (source, _, clock) = open_with(StoreConfig::default());
        store_n(&source, &clock, &[1, 2]);
        let exported = source.export_all().unwrap();

        let (target, _, _) = open_with(StoreConfig::default().with_max_records(3));
        store_n(&target, &clock, &[5, 6]);

        assert_eq!(target.import_all(&exported).unwrap(), 2);
        assert_eq!(target.import_all(&exported).unwrap(), 2);

        let priorities: Vec<i32> = target.all().iter().map(|r| r.priority).collect();
        assert_eq!(priorities, vec![6, 5, 2]);
    }

    #[test]
    fn clear_removes_the_key() {
        let (store, kv, clock) = open_with(StoreConfig::default());
        store_n(&store, &clock, &[1]);

        store.clear().unwrap();

        assert!(store.is_empty());
        assert_eq!(kv.get("failed_operations").unwrap(), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// The store never exceeds its limit and keeps exactly the
        /// highest-priority, newest-within-priority records.
        #[test]
        fn retention_keeps_the_most_valuable(
            max in 1usize..8,
            priorities in prop::collection::vec(-3i32..3, 0..24),
        ) {
            let (store, _, clock) = open_with(StoreConfig::default().with_max_records(max));
            let ids = store_n(&store, &clock, &priorities);

            prop_assert!(store.len() <= max);

            let mut expected: Vec<(i32, usize)> =
                priorities.iter().enumerate().map(|(i, p)| (*p, i)).collect();
            // Most valuable first: priority desc, then newest first.
            expected.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
            expected.truncate(max);
            let mut kept: Vec<RecordId> = expected.iter().map(|(_, i)| ids[*i]).collect();
            kept.sort();

            let mut actual: Vec<RecordId> = store.all().iter().map(|r| r.id).collect();
            actual.sort();
            prop_assert_eq!(actual, kept);
        }
    }
}
