//! Persisted failure records and the versioned document they are stored in.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use retrykit_core::{OperationKind, RecordId};

use super::failure_store::StoreError;

/// Current layout version of the stored document.
pub const STORE_SCHEMA_VERSION: u32 = 1;

/// A durable operation that exhausted its attempts, kept for later replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedFailureRecord {
    pub id: RecordId,
    #[serde(rename = "type")]
    pub kind: OperationKind,
    /// Plain data needed to rebuild the command.
    pub payload: Value,
    /// First failure.
    #[serde(deserialize_with = "lenient_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: String,
    #[serde(default)]
    pub priority: i32,
    /// Most recent failed replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl PersistedFailureRecord {
    pub fn new(
        kind: OperationKind,
        payload: Value,
        last_error: impl Into<String>,
        priority: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RecordId::new(),
            kind,
            payload,
            timestamp: now,
            retry_count: 0,
            last_error: last_error.into(),
            priority,
            last_attempt_at: None,
        }
    }

    /// Replay order: priority desc, then oldest first.
    pub fn replay_order(a: &Self, b: &Self) -> std::cmp::Ordering {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.timestamp.cmp(&b.timestamp))
            .then_with(|| a.id.cmp(&b.id))
    }

    /// Eviction order: lowest priority first, then oldest first.
    pub fn eviction_order(a: &Self, b: &Self) -> std::cmp::Ordering {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.timestamp.cmp(&b.timestamp))
            .then_with(|| a.id.cmp(&b.id))
    }
}

/// Accepts RFC 3339 strings and epoch milliseconds.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(DateTime<Utc>),
        Millis(i64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Text(at) => Ok(at),
        Raw::Millis(ms) => Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| serde::de::Error::custom(format!("timestamp {ms} out of range"))),
    }
}

/// The whole stored collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreDocument {
    pub version: u32,
    pub records: Vec<PersistedFailureRecord>,
}

impl StoreDocument {
    pub fn new(records: Vec<PersistedFailureRecord>) -> Self {
        Self {
            version: STORE_SCHEMA_VERSION,
            records,
        }
    }

    /// Parse a stored or exported document.
    ///
    /// A bare array is the unversioned legacy layout and is migrated to the
    /// current version. Legacy records whose id is not a UUID get a new id.
    pub fn decode(json: &str) -> Result<Decoded, StoreError> {
        let value: Value = serde_json::from_str(json)?;

        if let Value::Array(items) = value {
            return Ok(Decoded {
                document: Self::new(migrate_legacy(items)?),
                migrated_from: Some(0),
            });
        }

        let Some(map) = value.as_object() else {
            return Err(StoreError::Corrupt(format!(
                "expected an object or array, found {}",
                json_type(&value)
            )));
        };
        let version = map
            .get("version")
            .and_then(Value::as_u64)
            .ok_or_else(|| StoreError::Corrupt("missing `version` field".to_string()))?;
        if version != u64::from(STORE_SCHEMA_VERSION) {
            return Err(StoreError::UnsupportedVersion(version));
        }

        Ok(Decoded {
            document: serde_json::from_value(value)?,
            migrated_from: None,
        })
    }
}

/// Result of [`StoreDocument::decode`].
#[derive(Debug)]
pub struct Decoded {
    pub document: StoreDocument,
    /// Source version when the input was migrated (`0` for the bare array).
    pub migrated_from: Option<u32>,
}

fn migrate_legacy(items: Vec<Value>) -> Result<Vec<PersistedFailureRecord>, StoreError> {
    items
        .into_iter()
        .map(|mut item| {
            if let Some(obj) = item.as_object_mut() {
                let has_uuid = obj
                    .get("id")
                    .and_then(Value::as_str)
                    .is_some_and(|id| id.parse::<RecordId>().is_ok());
                if !has_uuid {
                    let old = obj.insert("id".to_string(), Value::String(RecordId::new().to_string()));
                    tracing::debug!(old_id = ?old, "assigned new id to legacy record");
                }
            }
            serde_json::from_value(item).map_err(StoreError::from)
        })
        .collect()
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
