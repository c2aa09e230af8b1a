// Cryptography module: pre-shared key and authenticated command packets

pub mod key;
pub mod packet;

pub use key::{KeyError, SharedKey, KEY_LEN};
pub use packet::{
    integrity_checksum, AeadNonce, AuthPacket, Command, CommandFrame, PacketCodec, PacketError,
    MAX_DATA_LEN, MAX_PACKET_SIZE, PACKET_OVERHEAD,
};
