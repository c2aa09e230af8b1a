// fobkey core: host side of the key-fob handshake
//
// Seals a replay-protected authenticate command, splits it for a small-MTU
// GATT UART link, and decides when to send it. The radio itself lives behind
// the `Transport` trait.

pub mod crypto;
pub mod nonce;
pub mod session;
pub mod store;
pub mod transport;

use std::sync::Arc;

pub use crypto::{AeadNonce, AuthPacket, Command, PacketCodec, PacketError, SharedKey};
pub use nonce::{BackendNonceStore, MemoryNonceStore, NonceError, NonceManager, NonceStore};
pub use session::{
    ConnectionOrchestrator, ConnectionState, ConnectionStatus, HandshakeMode, OrchestratorConfig,
    OrchestratorDelegate, OrchestratorError,
};
pub use store::{MemoryStorage, SledStorage, StorageBackend};
pub use transport::{event_channel, EventReceiver, EventSender, PeripheralId, Transport, TransportEvent};

/// Nonce manager persisted in a sled database at `path`
pub fn open_nonce_manager(path: &str) -> Result<NonceManager<BackendNonceStore>, NonceError> {
    let backend = SledStorage::new(path).map_err(NonceError::Storage)?;
    Ok(NonceManager::new(BackendNonceStore::new(Arc::new(backend))))
}
