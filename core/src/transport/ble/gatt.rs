/// GATT "UART" service definitions for the fob
///
/// This module provides the well-known service/characteristic identifiers,
/// characteristic descriptors with write-type selection, MTU fragmentation of
/// outbound packets, and the ordered chunk queue used while a packet is in
/// flight.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::MAX_PACKET_SIZE;

/// Service the fob advertises; used as the scan filter (0x963E)
pub const ADVERTISED_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000963E_0000_1000_8000_00805F9B34FB);

/// Nordic UART service
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);

/// UART RX: host writes packets here
pub const UART_RX_CHAR_UUID: Uuid = Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);

/// UART TX: fob notifies challenges here
pub const UART_TX_CHAR_UUID: Uuid = Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

/// Standard battery service (0x180F)
pub const BATTERY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180F_0000_1000_8000_00805F9B34FB);

/// Standard battery level characteristic (0x2A19)
pub const BATTERY_LEVEL_CHAR_UUID: Uuid = Uuid::from_u128(0x00002A19_0000_1000_8000_00805F9B34FB);

/// Default ATT payload per write when the transport cannot report one
pub const DEFAULT_MTU: usize = 20;

/// Enough chunks for the largest packet at a one-byte MTU
pub const DEFAULT_MAX_QUEUED_CHUNKS: usize = MAX_PACKET_SIZE;

/// Errors for GATT operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Write queue full (backpressure)")]
    WriteQueueFull,
    #[error("Fragmentation error: {0}")]
    FragmentationError(String),
    #[error("Service not found: {0}")]
    ServiceNotFound(Uuid),
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),
}

/// Write type for a characteristic write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteMode {
    /// Acknowledged write request; completion is reported per write
    WithResponse,
    /// Write command; considered done once dispatched
    WithoutResponse,
}

/// Characteristic capabilities as reported during discovery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
}

/// A resolved characteristic handle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Characteristic {
    pub service: Uuid,
    pub uuid: Uuid,
    pub properties: CharProperties,
}

impl Characteristic {
    pub fn new(service: Uuid, uuid: Uuid, properties: CharProperties) -> Self {
        Self {
            service,
            uuid,
            properties,
        }
    }

    /// Write requests when the characteristic supports them, otherwise
    /// write commands
    pub fn write_mode(&self) -> WriteMode {
        if self.properties.write {
            WriteMode::WithResponse
        } else {
            WriteMode::WithoutResponse
        }
    }
}

/// Splits outbound packets into MTU-sized writes. No per-chunk header is
/// added: the UART service carries a raw byte stream.
pub struct Fragmenter;

impl Fragmenter {
    /// Full `max_chunk_size` chunks followed by the remainder.
    /// An empty payload yields no chunks.
    pub fn fragment(payload: &[u8], max_chunk_size: usize) -> Result<Vec<Vec<u8>>, GattError> {
        if max_chunk_size == 0 {
            return Err(GattError::FragmentationError(
                "Chunk size must be > 0".to_string(),
            ));
        }

        Ok(payload
            .chunks(max_chunk_size)
            .map(|chunk| chunk.to_vec())
            .collect())
    }

    /// Number of writes `fragment` would produce
    pub fn chunk_count(payload_len: usize, max_chunk_size: usize) -> usize {
        if max_chunk_size == 0 {
            return 0;
        }
        payload_len.div_ceil(max_chunk_size)
    }
}

/// Ordered chunk queue for the packet currently being written
pub struct ChunkQueue {
    queue: VecDeque<Vec<u8>>,
    max_outstanding: usize,
}

impl ChunkQueue {
    pub fn new(max_outstanding: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            max_outstanding,
        }
    }

    pub fn new_default() -> Self {
        Self::new(DEFAULT_MAX_QUEUED_CHUNKS)
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.max_outstanding
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn enqueue(&mut self, chunk: Vec<u8>) -> Result<(), GattError> {
        if self.is_full() {
            return Err(GattError::WriteQueueFull);
        }
        self.queue.push_back(chunk);
        Ok(())
    }

    /// Queue every chunk or none of them
    pub fn enqueue_all(&mut self, chunks: Vec<Vec<u8>>) -> Result<(), GattError> {
        if self.queue.len() + chunks.len() > self.max_outstanding {
            return Err(GattError::WriteQueueFull);
        }
        self.queue.extend(chunks);
        Ok(())
    }

    pub fn dequeue(&mut self) -> Option<Vec<u8>> {
        self.queue.pop_front()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
