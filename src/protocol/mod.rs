//! Wire protocol for Bifrost.
//!
//! Defines the packet header and body formats, sequence-number arithmetic,
//! handshake messages and fragmentation.
//!
//! ## Datagram Format
//!
//! ```text
//! ┌────────────────────┬──────────────────────┬────────────────────────┐
//! │ Header (20)        │ Body (length)        │ GCM tag (16) or CRC(4) │
//! └────────────────────┴──────────────────────┴────────────────────────┘
//! ```

pub mod fragment;
mod handshake;
mod header;
mod packet;
mod seq;

pub use fragment::FragmentAssembler;
pub use handshake::{
    ChallengeResponse, ClientHello, ServerHello, CLIENT_HELLO_LEN, SERVER_HELLO_LEN,
    SERVER_HELLO_WIRE_LEN, TOKEN_LEN,
};
pub use header::{
    Direction, PacketHeader, PacketType, HEADER_SIZE, MAGIC, NONCE_SIZE,
};
pub use packet::{
    decode_datagram, message_overhead, MessageSlot, Packet, PacketLimits, CRC_SIZE,
    FRAGMENT_OVERHEAD, MESSAGE_OVERHEAD_1, MESSAGE_OVERHEAD_N, UDP_OVERHEAD,
};
pub use seq::{BitField, InsertOutcome, SeqNum};

/// Calculate CRC-32 checksum.
pub fn checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Verify protocol version compatibility.
pub fn is_compatible_version(version: u32) -> bool {
    version == crate::PROTOCOL_VERSION
}
