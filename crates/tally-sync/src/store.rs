//! Durable key/value storage for the device.
//!
//! Values are JSON documents. Every backend accounts for its size as the sum of
//! `key.len() + serialized_value.len()` over all keys and refuses a write that would push
//! that sum over the configured ceiling. Backends never evict on their own: callers get
//! [`StorageError::QuotaExceeded`] with the overflow and decide what to drop.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace};

const FILE_EXTENSION: &str = "json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage quota exceeded: write needs {needed} more bytes under the {capacity} byte ceiling")]
    QuotaExceeded { needed: u64, capacity: u64 },

    #[error("invalid storage key {0:?}")]
    InvalidKey(String),

    #[error("failed to (de)serialize stored value: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage backend unavailable: {0}")]
    Backend(#[from] io::Error),
}

pub trait LocalStore: Send + Sync {
    fn put(&self, key: &str, value: &Value) -> Result<(), StorageError>;

    fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

    /// Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    fn estimate_used_bytes(&self) -> u64;

    fn capacity(&self) -> u64;
}

/// Typed read on top of [`LocalStore::get`].
pub fn load<T: DeserializeOwned>(
    store: &dyn LocalStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match store.get(key)? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Typed write on top of [`LocalStore::put`].
pub fn save<T: Serialize>(store: &dyn LocalStore, key: &str, value: &T) -> Result<(), StorageError> {
    let value = serde_json::to_value(value)?;
    store.put(key, &value)
}

fn entry_size(key: &str, serialized: &str) -> u64 {
    (key.len() + serialized.len()) as u64
}

fn check_quota(used: u64, replaced: u64, added: u64, capacity: u64) -> Result<(), StorageError> {
    let projected = used.saturating_sub(replaced) + added;
    if projected > capacity {
        return Err(StorageError::QuotaExceeded {
            needed: projected - capacity,
            capacity,
        });
    }
    Ok(())
}

/// Process-lifetime store; values are kept serialized so accounting matches disk.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    capacity: u64,
}

impl MemoryStore {
    pub fn new(capacity: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
        }
    }
}

impl LocalStore for MemoryStore {
    fn put(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        let serialized = serde_json::to_string(value)?;
        let mut entries = self.entries.lock();
        let used: u64 = entries.iter().map(|(k, v)| entry_size(k, v)).sum();
        let replaced = entries.get(key).map(|v| entry_size(key, v)).unwrap_or(0);
        check_quota(used, replaced, entry_size(key, &serialized), self.capacity)?;
        entries.insert(key.to_string(), serialized);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let entries = self.entries.lock();
        match entries.get(key) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn estimate_used_bytes(&self) -> u64 {
        self.entries
            .lock()
            .iter()
            .map(|(k, v)| entry_size(k, v))
            .sum()
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}

/// One JSON document per key inside a directory.
///
/// Writes go to a temporary sibling first and are renamed into place, so a crash leaves
/// either the old or the new document, never a torn one.
pub struct FileStore {
    dir: PathBuf,
    capacity: u64,
    sizes: Mutex<HashMap<String, u64>>,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>, capacity: u64) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut sizes = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let len = fs::metadata(&path)?.len();
            sizes.insert(key.to_string(), key.len() as u64 + len);
        }

        debug!(
            dir = %dir.display(),
            keys = sizes.len(),
            used_bytes = sizes.values().sum::<u64>(),
            "opened file store"
        );

        Ok(Self {
            dir,
            capacity,
            sizes: Mutex::new(sizes),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.{FILE_EXTENSION}")))
    }
}

impl LocalStore for FileStore {
    fn put(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let serialized = serde_json::to_string(value)?;

        // Held across the write so concurrent puts cannot both pass the quota check.
        let mut sizes = self.sizes.lock();
        let used: u64 = sizes.values().sum();
        let replaced = sizes.get(key).copied().unwrap_or(0);
        let added = entry_size(key, &serialized);
        check_quota(used, replaced, added, self.capacity)?;

        let tmp = path.with_extension(format!("{FILE_EXTENSION}.tmp"));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(serialized.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        sizes.insert(key.to_string(), added);

        trace!(key, bytes = added, "stored document");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let mut sizes = self.sizes.lock();
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        sizes.remove(key);
        Ok(())
    }

    fn estimate_used_bytes(&self) -> u64 {
        self.sizes.lock().values().sum()
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_store_accounts_key_and_value_bytes() {
        let store = MemoryStore::new(1024);
        store.put("alpha", &json!("abc")).unwrap();
        // "alpha" (5) + "\"abc\"" (5)
        assert_eq!(store.estimate_used_bytes(), 10);

        store.put("alpha", &json!("abcdef")).unwrap();
        assert_eq!(store.estimate_used_bytes(), 13);

        store.remove("alpha").unwrap();
        store.remove("alpha").unwrap();
        assert_eq!(store.estimate_used_bytes(), 0);
        assert!(store.get("alpha").unwrap().is_none());
    }

    #[test]
    fn put_over_ceiling_reports_overflow_and_keeps_old_value() {
        let store = MemoryStore::new(20);
        store.put("k", &json!([1, 2, 3])).unwrap();

        let big = json!("x".repeat(30));
        let err = store.put("k", &big).unwrap_err();
        match err {
            StorageError::QuotaExceeded { needed, capacity } => {
                assert_eq!(capacity, 20);
                // "k" (1) + 32 quoted chars = 33 bytes projected
                assert_eq!(needed, 13);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(store.get("k").unwrap(), Some(json!([1, 2, 3])));
    }

    #[test]
    fn typed_helpers_round_trip() {
        let store = MemoryStore::new(1024);
        save(&store, "list", &vec!["a".to_string(), "b".to_string()]).unwrap();
        let loaded: Option<Vec<String>> = load(&store, "list").unwrap();
        assert_eq!(loaded, Some(vec!["a".to_string(), "b".to_string()]));

        let missing: Option<Vec<String>> = load(&store, "nope").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path(), 4096).unwrap();
            store.put("pendingRequests", &json!([{"id": "a"}])).unwrap();
            store.put("failedRequests", &json!([])).unwrap();
        }

        let reopened = FileStore::open(dir.path(), 4096).unwrap();
        assert_eq!(
            reopened.get("pendingRequests").unwrap(),
            Some(json!([{"id": "a"}]))
        );
        let expected = ("pendingRequests".len() + r#"[{"id":"a"}]"#.len()
            + "failedRequests".len()
            + "[]".len()) as u64;
        assert_eq!(reopened.estimate_used_bytes(), expected);
    }

    #[test]
    fn file_store_rejects_path_like_keys_and_enforces_quota() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path(), 16).unwrap();

        assert!(matches!(
            store.put("../escape", &json!(1)),
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(
            store.put("key", &json!("this string is far too long")),
            Err(StorageError::QuotaExceeded { .. })
        ));
        assert!(store.get("key").unwrap().is_none());
    }

    #[test]
    fn corrupt_document_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        let store = FileStore::open(dir.path(), 4096).unwrap();

        assert!(matches!(
            store.get("broken"),
            Err(StorageError::Serialization(_))
        ));
    }
}
