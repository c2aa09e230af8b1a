/// BLE (Bluetooth Low Energy) Transport Module
///
/// Protocol-level pieces of the fob's GATT "UART" link. Radio work (scanning,
/// connecting, enumeration) is done by a platform `Transport`; everything here
/// is testable without BLE hardware.

pub mod gatt;

pub use gatt::{
    CharProperties, Characteristic, ChunkQueue, Fragmenter, GattError, WriteMode,
    ADVERTISED_SERVICE_UUID, BATTERY_LEVEL_CHAR_UUID, BATTERY_SERVICE_UUID, DEFAULT_MTU,
    UART_RX_CHAR_UUID, UART_SERVICE_UUID, UART_TX_CHAR_UUID,
};
