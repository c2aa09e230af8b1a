// Nonce module: replay protection for sealed packets

pub mod manager;
pub mod store;

use thiserror::Error;

pub use manager::{NonceManager, INITIAL_COUNTER};
pub use store::{BackendNonceStore, MemoryNonceStore, NonceStore, NONCE_COUNTER_KEY};

/// Errors from issuing or persisting nonce counters
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NonceError {
    #[error("Nonce counter persistence failed: {0}")]
    Storage(String),
    #[error("Nonce counter exhausted; the key must be re-paired")]
    Exhausted,
}

#[cfg(test)]
pub use store::MockNonceStore;
