//! Infrastructure layer: durable queue, persistent failure store, storage
//! backends, recovery and configuration.

pub mod config;
pub mod queue;
pub mod recovery;
pub mod runner;
pub mod store;

pub use config::{QueueConfig, ResilienceConfig, StoreConfig};
pub use queue::{
    DrainHandle, DrainReport, DrainScheduler, HandlerRegistry, OperationMetadata, OperationQueue,
    QueueError, QueuePolicy,
};
pub use recovery::{RecoveryPass, ReplayReport};
pub use runner::{DurableRunner, RunError, RunReport};
pub use store::{FailureStore, FileKv, InMemoryKv, KeyValueStore, PersistedFailureRecord, StoreError};
