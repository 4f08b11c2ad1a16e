// Storage abstraction shared by session persistence and the chunk store

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(#[from] sled::Error),
    #[error("Corrupt record at {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key-value storage used by the persistence gateway and the chunk store
pub trait StorageBackend: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;
    fn remove(&self, key: &[u8]) -> Result<(), StorageError>;
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;
    fn flush(&self) -> Result<(), StorageError>;
}

/// In-memory storage, used in tests and when no data directory is configured
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl StorageBackend for MemoryStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn remove(&self, key: &[u8]) -> Result<(), StorageError> {
        self.data.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        Ok(self
            .data
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Durable storage on top of sled
pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }
}

impl StorageBackend for SledStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get(key)?.map(|ivec| ivec.to_vec()))
    }

    fn remove(&self, key: &[u8]) -> Result<(), StorageError> {
        self.db.remove(key)?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let mut results = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (k, v) = item?;
            results.push((k.to_vec(), v.to_vec()));
        }
        Ok(results)
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

impl<B: StorageBackend + ?Sized> StorageBackend for Arc<B> {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        (**self).put(key, value)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        (**self).get(key)
    }

    fn remove(&self, key: &[u8]) -> Result<(), StorageError> {
        (**self).remove(key)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        (**self).scan_prefix(prefix)
    }

    fn flush(&self) -> Result<(), StorageError> {
        (**self).flush()
    }
}

/// Store a serde value as a JSON document
pub fn put_json<T: serde::Serialize>(
    backend: &dyn StorageBackend,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec(value)?;
    backend.put(key.as_bytes(), &bytes)
}

/// Load a JSON document, if present
pub fn get_json<T: serde::de::DeserializeOwned>(
    backend: &dyn StorageBackend,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match backend.get(key.as_bytes())? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StorageError::Corrupt {
                key: key.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(backend: &dyn StorageBackend) {
        backend.put(b"perf:n1", b"1").unwrap();
        backend.put(b"perf:n2", b"2").unwrap();
        backend.put(b"session:s1", b"3").unwrap();

        assert_eq!(backend.get(b"perf:n1").unwrap(), Some(b"1".to_vec()));
        assert_eq!(backend.scan_prefix(b"perf:").unwrap().len(), 2);

        backend.remove(b"perf:n1").unwrap();
        assert_eq!(backend.get(b"perf:n1").unwrap(), None);
        assert_eq!(backend.scan_prefix(b"perf:").unwrap().len(), 1);
        backend.flush().unwrap();
    }

    #[test]
    fn test_memory_storage() {
        let storage = MemoryStorage::new();
        exercise(&storage);
        assert_eq!(storage.len(), 2);
    }

    #[test]
    fn test_sled_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SledStorage::open(dir.path().join("db")).unwrap();
        exercise(&storage);
    }

    #[test]
    fn test_corrupt_json_is_reported() {
        let storage = MemoryStorage::new();
        storage.put(b"perf:n1", b"{not json").unwrap();
        let result: Result<Option<u64>, _> = get_json(&storage, "perf:n1");
        assert!(matches!(result, Err(StorageError::Corrupt { .. })));
    }
}
