//! Transport abstraction for the fob link
//!
//! Defines the radio-facing trait the orchestrator drives and the single
//! event type every platform reports back through.

use std::fmt;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::ble::{Characteristic, WriteMode};

/// Platform identifier of a peripheral (address on Linux/Windows, UUID on Apple)
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Power/authorization state of the local radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AdapterState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterState::Unknown => write!(f, "unknown"),
            AdapterState::Resetting => write!(f, "resetting"),
            AdapterState::Unsupported => write!(f, "unsupported"),
            AdapterState::Unauthorized => write!(f, "unauthorized"),
            AdapterState::PoweredOff => write!(f, "powered off"),
            AdapterState::PoweredOn => write!(f, "powered on"),
        }
    }
}

/// One advertisement seen while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub peripheral: PeripheralId,
    pub local_name: Option<String>,
    pub services: Vec<Uuid>,
    pub rssi: Option<i16>,
}

/// Everything a transport reports back. Delivered one at a time, in order,
/// to `ConnectionOrchestrator::handle_event`.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The local radio changed power state
    AdapterStateChanged(AdapterState),
    /// The platform restored a previously connected peripheral
    Restored { peripheral: PeripheralId },
    /// An advertisement was received while scanning
    Discovered(Advertisement),
    /// A connect request completed
    Connected { peripheral: PeripheralId },
    /// A connect request failed
    ConnectFailed {
        peripheral: PeripheralId,
        error: String,
    },
    /// The link dropped (or a disconnect request completed)
    Disconnected {
        peripheral: PeripheralId,
        error: Option<String>,
    },
    /// Service discovery completed
    ServicesFound {
        peripheral: PeripheralId,
        services: Vec<Uuid>,
    },
    /// Characteristic discovery for one service completed
    CharacteristicsFound {
        peripheral: PeripheralId,
        service: Uuid,
        characteristics: Vec<Characteristic>,
    },
    /// A subscribe request completed
    NotificationStateChanged {
        peripheral: PeripheralId,
        characteristic: Uuid,
        result: Result<(), String>,
    },
    /// The peripheral notified a value
    Notified {
        peripheral: PeripheralId,
        characteristic: Uuid,
        payload: Vec<u8>,
    },
    /// An acknowledged write completed
    WriteCompleted {
        peripheral: PeripheralId,
        characteristic: Uuid,
        result: Result<(), String>,
    },
    /// A read request completed
    ValueRead {
        peripheral: PeripheralId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// Periodic clock tick from the event loop
    Tick { now: Instant },
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::AdapterStateChanged(state) => write!(f, "AdapterStateChanged({})", state),
            TransportEvent::Restored { peripheral } => write!(f, "Restored({})", peripheral),
            TransportEvent::Discovered(ad) => write!(f, "Discovered({})", ad.peripheral),
            TransportEvent::Connected { peripheral } => write!(f, "Connected({})", peripheral),
            TransportEvent::ConnectFailed { peripheral, .. } => {
                write!(f, "ConnectFailed({})", peripheral)
            }
            TransportEvent::Disconnected { peripheral, .. } => {
                write!(f, "Disconnected({})", peripheral)
            }
            TransportEvent::ServicesFound { services, .. } => {
                write!(f, "ServicesFound({} services)", services.len())
            }
            TransportEvent::CharacteristicsFound { service, .. } => {
                write!(f, "CharacteristicsFound({})", service)
            }
            TransportEvent::NotificationStateChanged { characteristic, .. } => {
                write!(f, "NotificationStateChanged({})", characteristic)
            }
            TransportEvent::Notified { payload, .. } => write!(f, "Notified({} bytes)", payload.len()),
            TransportEvent::WriteCompleted { characteristic, .. } => {
                write!(f, "WriteCompleted({})", characteristic)
            }
            TransportEvent::ValueRead { characteristic, .. } => {
                write!(f, "ValueRead({})", characteristic)
            }
            TransportEvent::Tick { .. } => write!(f, "Tick"),
        }
    }
}

/// Errors a transport may return when a request cannot even be issued
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,
    #[error("Transport unavailable: {0}")]
    Unavailable(String),
    #[error("Transport operation failed: {0}")]
    Operation(String),
}

/// Radio operations the orchestrator issues.
///
/// Every method only starts the operation and must return without blocking;
/// its completion (or failure) arrives later as a `TransportEvent`. The one
/// exception is `write` in `WriteMode::WithoutResponse`, which is complete
/// once it returns `Ok`.
pub trait Transport {
    fn scan(&mut self, service_filter: &[Uuid]) -> Result<(), TransportError>;

    fn stop_scan(&mut self) -> Result<(), TransportError>;

    fn connect(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError>;

    fn disconnect(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError>;

    fn discover_services(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError>;

    fn discover_characteristics(
        &mut self,
        peripheral: &PeripheralId,
        service: Uuid,
        filter: &[Uuid],
    ) -> Result<(), TransportError>;

    fn write(
        &mut self,
        peripheral: &PeripheralId,
        characteristic: &Characteristic,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError>;

    fn subscribe(
        &mut self,
        peripheral: &PeripheralId,
        characteristic: &Characteristic,
    ) -> Result<(), TransportError>;

    fn read(
        &mut self,
        peripheral: &PeripheralId,
        characteristic: &Characteristic,
    ) -> Result<(), TransportError>;

    /// Largest single write for `mode` on the current link
    fn max_write_len(&self, peripheral: &PeripheralId, mode: WriteMode) -> usize;
}

/// Sending half handed to transport implementations; replaces per-event callbacks
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiving half consumed by the event loop
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create the serialized event stream for one orchestrator
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peripheral_id_display() {
        let id = PeripheralId::from("AA:BB:CC:DD:EE:FF");
        assert_eq!(id.to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(id.as_str(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_adapter_state_display() {
        assert_eq!(AdapterState::PoweredOn.to_string(), "powered on");
        assert_eq!(AdapterState::Unauthorized.to_string(), "unauthorized");
    }

    #[test]
    fn test_transport_event_display() {
        let event = TransportEvent::Notified {
            peripheral: PeripheralId::from("fob"),
            characteristic: Uuid::nil(),
            payload: b"authChallenge".to_vec(),
        };
        assert_eq!(event.to_string(), "Notified(13 bytes)");
    }

    #[test]
    fn test_event_channel_preserves_order() {
        let (tx, mut rx) = event_channel();
        tx.send(TransportEvent::Connected {
            peripheral: PeripheralId::from("a"),
        })
        .unwrap();
        tx.send(TransportEvent::Disconnected {
            peripheral: PeripheralId::from("a"),
            error: None,
        })
        .unwrap();

        assert!(matches!(rx.try_recv(), Ok(TransportEvent::Connected { .. })));
        assert!(matches!(rx.try_recv(), Ok(TransportEvent::Disconnected { .. })));
    }
}
