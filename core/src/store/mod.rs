// Store module: durable key/value persistence

pub mod backend;

pub use backend::{MemoryStorage, SledStorage, StorageBackend};
