//! Runtime configuration for the queue and the failure store.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::queue::DEFAULT_DRAIN_INTERVAL;

pub const DEFAULT_STORAGE_KEY: &str = "failed_operations";
pub const DEFAULT_MAX_RECORDS: usize = 100;
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_MAX_REPLAY_ATTEMPTS: u32 = 5;

/// Drain scheduling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub drain_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            drain_interval: DEFAULT_DRAIN_INTERVAL,
        }
    }
}

/// Retention and layout of the persistent failure store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Key the record collection is written under.
    pub storage_key: String,
    pub max_records: usize,
    /// Records whose first failure is older than this are dropped.
    pub max_age: Duration,
    /// Records replayed this many times without success stop being offered
    /// for replay.
    pub max_replay_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            max_records: DEFAULT_MAX_RECORDS,
            max_age: DEFAULT_MAX_AGE,
            max_replay_attempts: DEFAULT_MAX_REPLAY_ATTEMPTS,
        }
    }
}

impl StoreConfig {
    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_max_replay_attempts(mut self, attempts: u32) -> Self {
        self.max_replay_attempts = attempts;
        self
    }
}

/// Everything a process needs to wire the subsystem.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResilienceConfig {
    pub queue: QueueConfig,
    pub store: StoreConfig,
    /// Directory for the file-backed store; in-memory when unset.
    pub store_dir: Option<PathBuf>,
}

impl ResilienceConfig {
    /// Read `RETRYKIT_*` environment variables over the defaults.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ResilienceConfig::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parsed::<u64, _>(&lookup, "RETRYKIT_DRAIN_INTERVAL_MS") {
            config.queue.drain_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(key) = lookup("RETRYKIT_STORE_KEY").filter(|k| !k.trim().is_empty()) {
            config.store.storage_key = key;
        }
        if let Some(max) = parsed(&lookup, "RETRYKIT_STORE_MAX_RECORDS") {
            config.store.max_records = max;
        }
        if let Some(secs) = parsed(&lookup, "RETRYKIT_STORE_MAX_AGE_SECS") {
            config.store.max_age = Duration::from_secs(secs);
        }
        if let Some(attempts) = parsed(&lookup, "RETRYKIT_STORE_MAX_REPLAY_ATTEMPTS") {
            config.store.max_replay_attempts = attempts;
        }
        if let Some(dir) = lookup("RETRYKIT_STORE_DIR").filter(|d| !d.trim().is_empty()) {
            config.store_dir = Some(PathBuf::from(dir));
        }

        config
    }

    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.queue.drain_interval = interval;
        self
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = Some(dir.into());
        self
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable configuration value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ResilienceConfig::from_lookup(lookup(&[]));
        assert_eq!(config.queue.drain_interval, Duration::from_secs(5));
        assert_eq!(config.store.storage_key, "failed_operations");
        assert_eq!(config.store.max_records, 100);
        assert_eq!(config.store.max_age, Duration::from_secs(604_800));
        assert_eq!(config.store.max_replay_attempts, 5);
        assert_eq!(config.store_dir, None);
    }

    #[test]
    fn variables_override_defaults() {
        let config = ResilienceConfig::from_lookup(lookup(&[
            ("RETRYKIT_DRAIN_INTERVAL_MS", "250"),
            ("RETRYKIT_STORE_KEY", "pending_sync"),
            ("RETRYKIT_STORE_MAX_RECORDS", "3"),
            ("RETRYKIT_STORE_MAX_AGE_SECS", "60"),
            ("RETRYKIT_STORE_MAX_REPLAY_ATTEMPTS", "2"),
            ("RETRYKIT_STORE_DIR", "/var/lib/retrykit"),
        ]));

        assert_eq!(config.queue.drain_interval, Duration::from_millis(250));
        assert_eq!(
            config.store,
            StoreConfig::default()
                .with_storage_key("pending_sync")
                .with_max_records(3)
                .with_max_age(Duration::from_secs(60))
                .with_max_replay_attempts(2)
        );
        assert_eq!(config.store_dir, Some(PathBuf::from("/var/lib/retrykit")));
    }

    #[test]
    fn garbage_values_fall_back() {
        let config = ResilienceConfig::from_lookup(lookup(&[
            ("RETRYKIT_STORE_MAX_RECORDS", "lots"),
            ("RETRYKIT_STORE_KEY", "  "),
        ]));
        assert_eq!(config.store.max_records, DEFAULT_MAX_RECORDS);
        assert_eq!(config.store.storage_key, DEFAULT_STORAGE_KEY);
    }
}
