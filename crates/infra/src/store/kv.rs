//! Key-value backends the failure store and queue snapshots are written to.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

/// Key-value backend error.
#[derive(Debug, Error)]
pub enum KvError {
    /// The write would push the backend past its byte quota.
    #[error("storage quota exceeded: {needed} bytes needed, limit is {limit}")]
    QuotaExceeded { needed: usize, limit: usize },

    #[error("invalid key `{0}`")]
    InvalidKey(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt value: {0}")]
    Corrupt(String),
}

/// String-valued key-value storage with synchronous writes.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    fn set(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Delete `key`. Deleting a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), KvError>;
}

fn check_quota(quota: Option<usize>, needed: usize) -> Result<(), KvError> {
    match quota {
        Some(limit) if needed > limit => Err(KvError::QuotaExceeded { needed, limit }),
        _ => Ok(()),
    }
}

/// In-memory backend with an optional byte quota over keys plus values.
#[derive(Debug, Default)]
pub struct InMemoryKv {
    state: Mutex<InMemoryState>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    entries: HashMap<String, String>,
    quota: Option<usize>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        let kv = Self::default();
        kv.set_quota(Some(quota_bytes));
        kv
    }

    pub fn set_quota(&self, quota_bytes: Option<usize>) {
        self.lock().quota = quota_bytes;
    }

    /// Bytes currently used.
    pub fn used_bytes(&self) -> usize {
        self.lock()
            .entries
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum()
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KeyValueStore for InMemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.lock().entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut state = self.lock();
        let others: usize = state
            .entries
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(k, v)| k.len() + v.len())
            .sum();
        check_quota(state.quota, others + key.len() + value.len())?;
        state.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), KvError> {
        self.lock().entries.remove(key);
        Ok(())
    }
}

/// File backend: one `<key>.json` file per key under a directory.
///
/// Writes go to a temporary sibling file that is synced and then renamed over
/// the target, so a crash never leaves a half-written value behind.
#[derive(Debug)]
pub struct FileKv {
    dir: PathBuf,
    quota: Option<usize>,
    // Serializes writers within this process.
    write_lock: Mutex<()>,
}

const VALUE_EXTENSION: &str = "json";

impl FileKv {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, KvError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            quota: None,
            write_lock: Mutex::new(()),
        })
    }

    /// Cap the total size of all values under the directory.
    pub fn with_quota(mut self, quota_bytes: usize) -> Self {
        self.quota = Some(quota_bytes);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, KvError> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid {
            return Err(KvError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.{VALUE_EXTENSION}")))
    }

    /// Bytes used by every value except the one at `skip`.
    fn used_bytes_except(&self, skip: &Path) -> Result<usize, KvError> {
        let mut used = 0usize;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path == skip || path.extension().and_then(|e| e.to_str()) != Some(VALUE_EXTENSION) {
                continue;
            }
            used += fs::metadata(&path)?.len() as usize;
        }
        Ok(used)
    }
}

impl KeyValueStore for FileKv {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| KvError::Corrupt(format!("{}: {e}", path.display()))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let path = self.path_for(key)?;
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if self.quota.is_some() {
            let needed = self.used_bytes_except(&path)? + value.len();
            check_quota(self.quota, needed)?;
        }

        let temp_path = path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(value.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), KvError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}
