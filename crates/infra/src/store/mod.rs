//! Persistent store for exhausted durable operations, and the key-value
//! backends it writes to.

mod failure_store;
mod kv;
mod record;

pub use failure_store::{FailureStore, StoreError, StoreStats};
pub use kv::{FileKv, InMemoryKv, KeyValueStore, KvError};
pub use record::{Decoded, PersistedFailureRecord, STORE_SCHEMA_VERSION, StoreDocument};
