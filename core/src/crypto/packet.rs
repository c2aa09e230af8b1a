/// Authenticated command packets: ChaCha20-Poly1305 sealing with a CRC32 integrity field
///
/// Wire format (total overhead: 44 bytes, all integers LE):
/// [4 bytes]  integrity check, CRC32 over the whole packet with this field zeroed
/// [12 bytes] AEAD nonce: 4 zero bytes || u64 counter
/// [8 bytes]  encrypted command_id (u32) || encrypted data_len (u32)
/// [4 bytes]  reserved, zero
/// [N bytes]  encrypted data
/// [16 bytes] Poly1305 tag
use super::key::SharedKey;
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};
use crc32fast::Hasher;
use thiserror::Error;
use zeroize::Zeroize;

const INTEGRITY_LEN: usize = 4;
const NONCE_LEN: usize = 12;
const NONCE_PADDING_LEN: usize = 4;
const HEADER_LEN: usize = 8;
const RESERVED_LEN: usize = 4;
const TAG_LEN: usize = 16;

/// Fixed bytes in every packet regardless of data length
pub const PACKET_OVERHEAD: usize = INTEGRITY_LEN + NONCE_LEN + HEADER_LEN + RESERVED_LEN + TAG_LEN;

/// Largest packet the fob accepts in one reassembled write
pub const MAX_PACKET_SIZE: usize = 512;

/// Largest optional data payload that still fits under `MAX_PACKET_SIZE`
pub const MAX_DATA_LEN: usize = MAX_PACKET_SIZE - PACKET_OVERHEAD;

/// Errors for packet construction and validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("AEAD seal failed")]
    SealFailed,
    #[error("AEAD open failed: wrong key, nonce or tampered packet")]
    OpenFailed,
    #[error("Packet truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("Integrity check mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    IntegrityMismatch { stored: u32, computed: u32 },
    #[error("Declared data length {declared} does not match packet ({actual})")]
    LengthMismatch { declared: usize, actual: usize },
}

/// Command identifiers understood by the fob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    /// Prove possession of the shared key (7)
    Authenticate = 7,
}

impl Command {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            7 => Some(Command::Authenticate),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> u32 {
        *self as u32
    }
}

/// 96-bit ChaCha20-Poly1305 nonce derived from the monotonic counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AeadNonce([u8; NONCE_LEN]);

impl AeadNonce {
    pub fn from_counter(counter: u64) -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        bytes[NONCE_PADDING_LEN..].copy_from_slice(&counter.to_le_bytes());
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; NONCE_LEN]) -> Self {
        Self(bytes)
    }

    /// Counter carried in the low 8 bytes
    pub fn counter(&self) -> u64 {
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&self.0[NONCE_PADDING_LEN..]);
        u64::from_le_bytes(counter)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }
}

/// Decrypted contents of an `AuthPacket`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub command_id: u32,
    pub data: Vec<u8>,
}

/// A sealed, integrity-checked packet. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPacket {
    bytes: Vec<u8>,
}

impl AuthPacket {
    /// Validate raw bytes as a packet: length and integrity check only.
    /// Authenticity is checked by `PacketCodec::open`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < PACKET_OVERHEAD {
            return Err(PacketError::Truncated {
                need: PACKET_OVERHEAD,
                got: bytes.len(),
            });
        }

        let packet = Self {
            bytes: bytes.to_vec(),
        };
        let stored = packet.integrity_check();
        let computed = integrity_checksum(&packet.bytes);
        if stored != computed {
            return Err(PacketError::IntegrityMismatch { stored, computed });
        }

        Ok(packet)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Length of the optional data section
    pub fn data_len(&self) -> usize {
        self.bytes.len() - PACKET_OVERHEAD
    }

    pub fn integrity_check(&self) -> u32 {
        PacketReader::new(&self.bytes).read_u32()
    }

    pub fn nonce(&self) -> AeadNonce {
        let mut reader = PacketReader::new(&self.bytes);
        reader.skip(INTEGRITY_LEN);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(reader.take(NONCE_LEN));
        AeadNonce(nonce)
    }
}

/// CRC32 (IEEE) over a packet buffer with the integrity field treated as zero
pub fn integrity_checksum(packet: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&[0u8; INTEGRITY_LEN]);
    if packet.len() > INTEGRITY_LEN {
        hasher.update(&packet[INTEGRITY_LEN..]);
    }
    hasher.finalize()
}

/// Writes packet fields in wire order into a preallocated buffer.
///
/// The cursor only moves forward; `finish` refuses a buffer that was not
/// filled exactly.
struct PacketBuilder {
    buf: Vec<u8>,
    cursor: usize,
}

impl PacketBuilder {
    fn new(data_len: usize) -> Self {
        Self {
            buf: vec![0u8; PACKET_OVERHEAD + data_len],
            cursor: 0,
        }
    }

    fn write(&mut self, field: &[u8]) -> &mut Self {
        let end = self.cursor + field.len();
        self.buf[self.cursor..end].copy_from_slice(field);
        self.cursor = end;
        self
    }

    fn integrity_placeholder(&mut self) -> &mut Self {
        self.write(&[0u8; INTEGRITY_LEN])
    }

    fn nonce(&mut self, nonce: &AeadNonce) -> &mut Self {
        self.write(nonce.as_bytes())
    }

    fn reserved(&mut self) -> &mut Self {
        self.write(&[0u8; RESERVED_LEN])
    }

    fn finish(self) -> Result<AuthPacket, PacketError> {
        if self.cursor != self.buf.len() {
            return Err(PacketError::LengthMismatch {
                declared: self.buf.len(),
                actual: self.cursor,
            });
        }

        let mut bytes = self.buf;
        let checksum = integrity_checksum(&bytes);
        bytes[..INTEGRITY_LEN].copy_from_slice(&checksum.to_le_bytes());
        Ok(AuthPacket { bytes })
    }
}

/// Forward-only reader over a validated packet buffer
struct PacketReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> PacketReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    fn take(&mut self, len: usize) -> &'a [u8] {
        let field = &self.buf[self.cursor..self.cursor + len];
        self.cursor += len;
        field
    }

    fn skip(&mut self, len: usize) {
        self.cursor += len;
    }

    fn read_u32(&mut self) -> u32 {
        let field = self.take(4);
        u32::from_le_bytes([field[0], field[1], field[2], field[3]])
    }
}

/// Builds and validates `AuthPacket`s
pub struct PacketCodec;

impl PacketCodec {
    /// Seal `command_id` and optional `data` under `key` and `nonce`.
    ///
    /// The caller owns nonce uniqueness; a seal failure means that contract
    /// was already broken and must not be retried with the same inputs.
    pub fn seal(
        command_id: u32,
        data: &[u8],
        key: &SharedKey,
        nonce: &AeadNonce,
    ) -> Result<AuthPacket, PacketError> {
        if data.len() > MAX_DATA_LEN {
            return Err(PacketError::PayloadTooLarge {
                len: data.len(),
                max: MAX_DATA_LEN,
            });
        }

        let mut buf = Vec::with_capacity(HEADER_LEN + data.len());
        buf.extend_from_slice(&command_id.to_le_bytes());
        buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        buf.extend_from_slice(data);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        let sealed =
            cipher.encrypt_in_place_detached(Nonce::from_slice(nonce.as_bytes()), &[], &mut buf);
        let tag = match sealed {
            Ok(tag) => tag,
            Err(_) => {
                buf.zeroize();
                return Err(PacketError::SealFailed);
            }
        };

        let (header, body) = buf.split_at(HEADER_LEN);
        let mut builder = PacketBuilder::new(data.len());
        builder
            .integrity_placeholder()
            .nonce(nonce)
            .write(header)
            .reserved()
            .write(body)
            .write(tag.as_slice());
        builder.finish()
    }

    /// Verify and decrypt a packet (the fob's side of the exchange)
    pub fn open(packet: &AuthPacket, key: &SharedKey) -> Result<CommandFrame, PacketError> {
        let data_len = packet.data_len();
        let mut reader = PacketReader::new(packet.as_bytes());
        reader.skip(INTEGRITY_LEN + NONCE_LEN);

        let mut buf = Vec::with_capacity(HEADER_LEN + data_len);
        buf.extend_from_slice(reader.take(HEADER_LEN));
        reader.skip(RESERVED_LEN);
        buf.extend_from_slice(reader.take(data_len));
        let tag = Tag::from_slice(reader.take(TAG_LEN));

        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        let nonce = packet.nonce();
        cipher
            .decrypt_in_place_detached(Nonce::from_slice(nonce.as_bytes()), &[], &mut buf, tag)
            .map_err(|_| PacketError::OpenFailed)?;

        let mut plain = PacketReader::new(&buf);
        let command_id = plain.read_u32();
        let declared = plain.read_u32() as usize;
        if declared != data_len {
            return Err(PacketError::LengthMismatch {
                declared,
                actual: data_len,
            });
        }

        Ok(CommandFrame {
            command_id,
            data: plain.take(data_len).to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_key() -> SharedKey {
        let mut bytes = [0u8; 32];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        SharedKey::from_bytes(bytes)
    }

    #[test]
    fn test_command_conversion() {
        assert_eq!(Command::Authenticate.as_u32(), 7);
        assert_eq!(Command::from_u32(7), Some(Command::Authenticate));
        assert_eq!(Command::from_u32(8), None);
    }

    #[test]
    fn test_nonce_layout() {
        let nonce = AeadNonce::from_counter(0x0102_0304_0506_0708);
        assert_eq!(
            nonce.as_bytes(),
            &[0, 0, 0, 0, 0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
        assert_eq!(nonce.counter(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_crc_is_ieee_variant() {
        let mut hasher = Hasher::new();
        hasher.update(b"123456789");
        assert_eq!(hasher.finalize(), 0xCBF4_3926);
    }

    #[test]
    fn test_authenticate_packet_vector() {
        let key = test_key();
        let nonce = AeadNonce::from_counter(13);

        let packet = PacketCodec::seal(Command::Authenticate.as_u32(), &[], &key, &nonce).unwrap();
        assert_eq!(packet.len(), 44);
        assert_eq!(packet.nonce().counter(), 13);
        assert_eq!(&packet.as_bytes()[4..8], &[0, 0, 0, 0]);
        assert_eq!(&packet.as_bytes()[24..28], &[0, 0, 0, 0]);

        let again = PacketCodec::seal(7, &[], &key, &nonce).unwrap();
        assert_eq!(packet, again);

        let frame = PacketCodec::open(&packet, &key).unwrap();
        assert_eq!(frame.command_id, 7);
        assert!(frame.data.is_empty());
    }

    #[test]
    fn test_plaintext_header_is_encrypted() {
        let key = test_key();
        let packet = PacketCodec::seal(7, &[], &key, &AeadNonce::from_counter(13)).unwrap();
        assert_ne!(&packet.as_bytes()[16..24], &[7, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_packet_with_data() {
        let key = test_key();
        let data = b"unlock-driver-door";
        let packet = PacketCodec::seal(7, data, &key, &AeadNonce::from_counter(2)).unwrap();

        assert_eq!(packet.len(), PACKET_OVERHEAD + data.len());
        assert_eq!(packet.data_len(), data.len());

        let frame = PacketCodec::open(&packet, &key).unwrap();
        assert_eq!(frame.data, data.to_vec());
    }

    #[test]
    fn test_different_nonce_different_ciphertext() {
        let key = test_key();
        let a = PacketCodec::seal(7, &[], &key, &AeadNonce::from_counter(1)).unwrap();
        let b = PacketCodec::seal(7, &[], &key, &AeadNonce::from_counter(2)).unwrap();
        assert_ne!(&a.as_bytes()[16..], &b.as_bytes()[16..]);
    }

    #[test]
    fn test_payload_too_large() {
        let key = test_key();
        let data = vec![0u8; MAX_DATA_LEN + 1];
        let result = PacketCodec::seal(7, &data, &key, &AeadNonce::from_counter(1));
        assert!(matches!(result, Err(PacketError::PayloadTooLarge { .. })));

        let data = vec![0u8; MAX_DATA_LEN];
        let packet = PacketCodec::seal(7, &data, &key, &AeadNonce::from_counter(1)).unwrap();
        assert_eq!(packet.len(), MAX_PACKET_SIZE);
    }

    #[test]
    fn test_from_bytes_rejects_truncated() {
        let result = AuthPacket::from_bytes(&[0u8; 43]);
        assert!(matches!(result, Err(PacketError::Truncated { need: 44, got: 43 })));
    }

    #[test]
    fn test_from_bytes_detects_corruption() {
        let key = test_key();
        let packet = PacketCodec::seal(7, b"abc", &key, &AeadNonce::from_counter(5)).unwrap();
        let mut bytes = packet.into_bytes();
        bytes[30] ^= 0x01;

        let result = AuthPacket::from_bytes(&bytes);
        assert!(matches!(result, Err(PacketError::IntegrityMismatch { .. })));
    }

    #[test]
    fn test_open_wrong_key_fails() {
        let packet = PacketCodec::seal(7, &[], &test_key(), &AeadNonce::from_counter(9)).unwrap();
        let other = SharedKey::from_bytes([0xEE; 32]);
        assert_eq!(PacketCodec::open(&packet, &other), Err(PacketError::OpenFailed));
    }

    #[test]
    fn test_open_detects_tampering_with_fixed_crc() {
        let key = test_key();
        let packet = PacketCodec::seal(7, b"xy", &key, &AeadNonce::from_counter(3)).unwrap();
        let mut bytes = packet.into_bytes();
        bytes[16] ^= 0x80;
        let checksum = integrity_checksum(&bytes);
        bytes[..4].copy_from_slice(&checksum.to_le_bytes());

        let forged = AuthPacket::from_bytes(&bytes).unwrap();
        assert_eq!(PacketCodec::open(&forged, &key), Err(PacketError::OpenFailed));
    }

    proptest! {
        #[test]
        fn prop_packet_size_and_integrity(
            command_id in any::<u32>(),
            data in proptest::collection::vec(any::<u8>(), 0..=MAX_DATA_LEN),
            counter in 1u64..u64::MAX,
        ) {
            let key = test_key();
            let nonce = AeadNonce::from_counter(counter);
            let packet = PacketCodec::seal(command_id, &data, &key, &nonce).unwrap();

            prop_assert_eq!(packet.len(), 44 + data.len());

            let mut zeroed = packet.as_bytes().to_vec();
            zeroed[..4].copy_from_slice(&[0, 0, 0, 0]);
            prop_assert_eq!(crc32fast::hash(&zeroed), packet.integrity_check());
            prop_assert!(AuthPacket::from_bytes(packet.as_bytes()).is_ok());
        }
    }
}
