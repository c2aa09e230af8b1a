// Pre-shared key material

use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of the pre-shared ChaCha20-Poly1305 key in bytes
pub const KEY_LEN: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Key is not valid hex")]
    InvalidHex,
    #[error("Key must be {KEY_LEN} bytes, got {0}")]
    InvalidLength(usize),
}

/// 256-bit secret shared between the controller and the fob.
///
/// The bytes are wiped when the value is dropped and never appear in `Debug`
/// output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedKey([u8; KEY_LEN]);

impl SharedKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a 64-character hex string
    pub fn from_hex(hex_key: &str) -> Result<Self, KeyError> {
        let mut decoded = hex::decode(hex_key.trim()).map_err(|_| KeyError::InvalidHex)?;
        if decoded.len() != KEY_LEN {
            let len = decoded.len();
            decoded.zeroize();
            return Err(KeyError::InvalidLength(len));
        }

        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self(bytes))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_hex_roundtrip() {
        let hex_key = "00".repeat(31) + "ff";
        let key = SharedKey::from_hex(&hex_key).unwrap();
        assert_eq!(key.as_bytes()[31], 0xff);
        assert_eq!(key.as_bytes()[0], 0x00);
    }

    #[test]
    fn test_from_hex_rejects_wrong_length() {
        assert_eq!(
            SharedKey::from_hex("abcd").unwrap_err(),
            KeyError::InvalidLength(2)
        );
    }

    #[test]
    fn test_from_hex_rejects_garbage() {
        assert_eq!(
            SharedKey::from_hex(&"zz".repeat(32)).unwrap_err(),
            KeyError::InvalidHex
        );
    }

    #[test]
    fn test_debug_hides_key() {
        let key = SharedKey::from_bytes([0x41; KEY_LEN]);
        let rendered = format!("{:?}", key);
        assert_eq!(rendered, "SharedKey(..)");
    }
}
