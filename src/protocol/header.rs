//! The fixed 20-byte packet header.
//!
//! ## Layout (big-endian)
//!
//! ```text
//! ┌───────────┬─────────┬───────────┬──────────┬──────────┐
//! │ magic (3) │ dir (1) │ ctime (4) │ seq (2)  │ ack (2)  │
//! ├───────────┼─────────┴───────────┼──────────┼──────────┤
//! │ type (1)  │ length (2)          │ count(1) │ bits (4) │
//! └───────────┴─────────────────────┴──────────┴──────────┘
//! ```
//!
//! The first 12 bytes double as the AES-GCM nonce; the direction byte keeps
//! client and server nonces disjoint under the shared session key, and ctime
//! plus the incrementing seq keep them unique per direction. The full 20
//! bytes are the AAD.

use byteorder::{BigEndian, ByteOrder};

use crate::error::ProtocolError;

use super::seq::SeqNum;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 20;

/// AES-GCM nonce prefix of the header.
pub const NONCE_SIZE: usize = 12;

/// Leading magic bytes; the direction byte completes the 4-byte identifier.
pub const MAGIC: &[u8; 3] = b"FSO";

/// Which endpoint a packet is addressed to.
///
/// The byte doubles as the trailing magic character: `FSOC` for packets the
/// client will decrypt, `FSOS` for packets the server will decrypt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToClient,
    ToServer,
}

impl Direction {
    pub fn byte(self) -> u8 {
        match self {
            Self::ToClient => b'C',
            Self::ToServer => b'S',
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'C' => Some(Self::ToClient),
            b'S' => Some(Self::ToServer),
            _ => None,
        }
    }
}

/// Packet type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Handshake step 1: client ephemeral key (CRC-protected).
    ClientHello = 1,
    /// Handshake step 2: server ephemeral key, salt, token; root-signed.
    ServerHello = 2,
    /// Handshake step 3: token echo under the session key.
    ChallengeResp = 3,
    /// Ack/liveness carrier when nothing else is pending.
    KeepAlive = 4,
    /// Graceful teardown.
    Disconnect = 5,
    /// Application message(s).
    App = 6,
    /// One fragment of a large application message.
    AppFragment = 7,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::ClientHello),
            2 => Some(Self::ServerHello),
            3 => Some(Self::ChallengeResp),
            4 => Some(Self::KeepAlive),
            5 => Some(Self::Disconnect),
            6 => Some(Self::App),
            7 => Some(Self::AppFragment),
            _ => None,
        }
    }

    /// Types exchanged while the connection is being established.
    pub fn is_handshake(self) -> bool {
        matches!(self, Self::ClientHello | Self::ServerHello | Self::ChallengeResp)
    }

    /// Types that are only valid once the session key is established.
    pub fn requires_session(self) -> bool {
        !self.is_handshake()
    }
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Which endpoint should decrypt this packet.
    pub direction: Direction,
    /// Sender-local milliseconds since endpoint start.
    pub ctime: u32,
    /// Packet sequence number.
    pub seq: SeqNum,
    /// Most recent packet sequence number received from the remote.
    pub ack: SeqNum,
    /// Payload content descriptor.
    pub pkt_type: PacketType,
    /// Payload bytes following the header, excluding any CRC or GCM tag.
    pub length: u16,
    /// Number of messages packed into the payload.
    pub count: u8,
    /// Received-history bits relative to `ack`.
    pub ack_bits: u32,
}

impl PacketHeader {
    pub fn new(
        direction: Direction,
        ctime: u32,
        pkt_type: PacketType,
        seq: SeqNum,
        ack: SeqNum,
        ack_bits: u32,
    ) -> Self {
        Self {
            direction,
            ctime,
            seq,
            ack,
            pkt_type,
            length: 0,
            count: 0,
            ack_bits,
        }
    }

    /// Serialize to exactly [`HEADER_SIZE`] bytes.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..3].copy_from_slice(MAGIC);
        buf[3] = self.direction.byte();
        BigEndian::write_u32(&mut buf[4..8], self.ctime);
        BigEndian::write_u16(&mut buf[8..10], self.seq.0);
        BigEndian::write_u16(&mut buf[10..12], self.ack.0);
        buf[12] = self.pkt_type as u8;
        BigEndian::write_u16(&mut buf[13..15], self.length);
        buf[15] = self.count;
        BigEndian::write_u32(&mut buf[16..20], self.ack_bits);
        buf
    }

    /// Deserialize a header addressed to `expect`.
    ///
    /// A wrong magic or direction means the datagram is not ours to answer:
    /// callers drop it without replying.
    pub fn decode(buf: &[u8], expect: Direction) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::MalformedPacket("short header".into()));
        }
        if &buf[..3] != MAGIC {
            return Err(ProtocolError::BadMagic);
        }
        let direction = Direction::from_byte(buf[3]).ok_or(ProtocolError::BadMagic)?;
        if direction != expect {
            return Err(ProtocolError::DirectionMismatch);
        }

        let pkt_type =
            PacketType::from_u8(buf[12]).ok_or(ProtocolError::InvalidPacketType(buf[12]))?;

        Ok(Self {
            direction,
            ctime: BigEndian::read_u32(&buf[4..8]),
            seq: SeqNum(BigEndian::read_u16(&buf[8..10])),
            ack: SeqNum(BigEndian::read_u16(&buf[10..12])),
            pkt_type,
            length: BigEndian::read_u16(&buf[13..15]),
            count: buf[15],
            ack_bits: BigEndian::read_u32(&buf[16..20]),
        })
    }
}
