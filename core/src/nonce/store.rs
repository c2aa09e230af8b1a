// Durable homes for the nonce counter

use super::NonceError;
use crate::store::StorageBackend;
use parking_lot::Mutex;
use std::sync::Arc;

/// Storage key holding the next counter value to hand out
pub const NONCE_COUNTER_KEY: &[u8] = b"nonce_counter";

/// Load/store interface for the persisted counter.
///
/// `load` returns 0 when nothing has been persisted yet.
#[cfg_attr(test, mockall::automock)]
pub trait NonceStore {
    fn load(&self) -> Result<u64, NonceError>;
    fn store(&self, value: u64) -> Result<(), NonceError>;
}

/// Process-local store; forgets everything on restart
#[derive(Clone, Default)]
pub struct MemoryNonceStore {
    value: Arc<Mutex<u64>>,
}

impl MemoryNonceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with an already persisted value, e.g. to simulate a restart
    pub fn with_value(value: u64) -> Self {
        Self {
            value: Arc::new(Mutex::new(value)),
        }
    }
}

impl NonceStore for MemoryNonceStore {
    fn load(&self) -> Result<u64, NonceError> {
        Ok(*self.value.lock())
    }

    fn store(&self, value: u64) -> Result<(), NonceError> {
        *self.value.lock() = value;
        Ok(())
    }
}

/// Counter persisted through a `StorageBackend` as 8 little-endian bytes
pub struct BackendNonceStore {
    backend: Arc<dyn StorageBackend>,
}

impl BackendNonceStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }
}

impl NonceStore for BackendNonceStore {
    fn load(&self) -> Result<u64, NonceError> {
        let Some(bytes) = self
            .backend
            .get(NONCE_COUNTER_KEY)
            .map_err(NonceError::Storage)?
        else {
            return Ok(0);
        };

        let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
            NonceError::Storage(format!("Corrupt nonce counter ({} bytes)", bytes.len()))
        })?;
        Ok(u64::from_le_bytes(raw))
    }

    fn store(&self, value: u64) -> Result<(), NonceError> {
        self.backend
            .put(NONCE_COUNTER_KEY, &value.to_le_bytes())
            .map_err(NonceError::Storage)?;
        self.backend.flush().map_err(NonceError::Storage)
    }
}
