//! Transport module: radio-facing types for the fob link
//!
//! - **abstraction**: the `Transport` trait and the `TransportEvent` stream
//! - **ble**: GATT UART identifiers, fragmentation and the outbound chunk queue

pub mod abstraction;
pub mod ble;

pub use abstraction::{
    event_channel, AdapterState, Advertisement, EventReceiver, EventSender, PeripheralId,
    Transport, TransportError, TransportEvent,
};
