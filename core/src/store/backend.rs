// Storage abstraction for durable controller state

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Key/value persistence used for the nonce counter and other small records
pub trait StorageBackend: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), String>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String>;
    fn flush(&self) -> Result<(), String>;
}

/// In-memory storage useful for testing and ephemeral sessions
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), String> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String> {
        Ok(self.data.read().get(key).cloned())
    }

    fn flush(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Sled-backed storage; survives process restarts
pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    pub fn new(path: &str) -> Result<Self, String> {
        let db = sled::open(path).map_err(|e| e.to_string())?;
        Ok(Self { db })
    }
}

impl StorageBackend for SledStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), String> {
        self.db.insert(key, value).map_err(|e| e.to_string())?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String> {
        let value = self.db.get(key).map_err(|e| e.to_string())?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn flush(&self) -> Result<(), String> {
        self.db.flush().map_err(|e| e.to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_storage_put_get() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get(b"k").unwrap(), None);
        storage.put(b"k", b"v").unwrap();
        assert_eq!(storage.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_memory_storage_clones_share_data() {
        let storage = MemoryStorage::new();
        let clone = storage.clone();
        storage.put(b"shared", b"1").unwrap();
        assert_eq!(clone.get(b"shared").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_sled_storage_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let path = path.to_str().unwrap();

        {
            let storage = SledStorage::new(path).unwrap();
            storage.put(b"counter", &42u64.to_le_bytes()).unwrap();
            storage.flush().unwrap();
        }

        let storage = SledStorage::new(path).unwrap();
        assert_eq!(
            storage.get(b"counter").unwrap(),
            Some(42u64.to_le_bytes().to_vec())
        );
    }
}
