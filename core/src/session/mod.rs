// Session module: connection lifecycle and handshake orchestration

pub mod config;
pub mod driver;
pub mod orchestrator;
pub mod state;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::PacketError;
use crate::nonce::NonceError;
use crate::transport::ble::GattError;
use crate::transport::{AdapterState, PeripheralId, TransportError};

pub use config::{ConfigError, HandshakeMode, OrchestratorConfig, DEFAULT_CHALLENGE};
pub use driver::{run, DEFAULT_TICK_INTERVAL};
pub use orchestrator::ConnectionOrchestrator;
pub use state::{ConnectionState, StateError, Trigger};

/// Errors surfaced from `ConnectionOrchestrator`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("Nonce error: {0}")]
    Nonce(#[from] NonceError),

    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("GATT error: {0}")]
    Gatt(#[from] GattError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The crypto layer rejected inputs it must always accept
    #[error("Fault: {0}")]
    Fault(String),
}

/// Observer for connection progress. Callbacks run on the event loop and
/// must not block.
pub trait OrchestratorDelegate: Send + Sync {
    fn on_state_changed(&self, _from: ConnectionState, _to: ConnectionState) {}

    /// A handshake packet was fully written under `counter`
    fn on_authenticated(&self, _counter: u64) {}

    fn on_battery_level(&self, _percent: u8) {}

    fn on_fault(&self, _error: &OrchestratorError) {}
}

/// Point-in-time view of a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub adapter: AdapterState,
    pub peripheral: Option<PeripheralId>,
    pub handshake_mode: HandshakeMode,
    pub authenticated_count: u64,
    pub battery_level: Option<u8>,
    pub last_nonce: Option<u64>,
    pub next_nonce: u64,
}
