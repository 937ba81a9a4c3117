//! Packet assembly and parsing.
//!
//! A datagram is `header(20) || body || trailer`, where the trailer is a
//! 16-byte GCM tag for sealed packets or a CRC-32 for the unencrypted
//! handshake hellos. The body packs one or more message slots:
//!
//! - exactly one message: `msg_seq(2) || bytes` (2 bytes overhead)
//! - two or more: repeated `len(2) || msg_seq(2) || type(1) || bytes`
//!   (5 bytes per message); `count` in the header distinguishes the forms.

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;

use crate::crypto::{open, seal, SessionKey, TAG_SIZE};
use crate::error::{Error, ProtocolError, Result};

use super::header::{Direction, PacketHeader, PacketType, HEADER_SIZE, NONCE_SIZE};
use super::seq::SeqNum;

/// Trailing checksum size on unencrypted handshake packets.
pub const CRC_SIZE: usize = 4;

/// Assumed UDP + IP header overhead per datagram.
pub const UDP_OVERHEAD: usize = 28;

/// Overhead for a single message in a packet (message sequence number).
pub const MESSAGE_OVERHEAD_1: usize = 2;

/// Per-message overhead when two or more share a packet.
pub const MESSAGE_OVERHEAD_N: usize = 5;

/// Fragment header: group id, index and total, 2 bytes each.
pub const FRAGMENT_OVERHEAD: usize = 6;

/// Body overhead for `n` messages in one packet.
pub fn message_overhead(n: usize) -> usize {
    match n {
        0 => 0,
        1 => MESSAGE_OVERHEAD_1,
        _ => MESSAGE_OVERHEAD_N * n,
    }
}

/// Size arithmetic derived from a configured MTU.
///
/// MTU is endpoint configuration, not process-global state; every size
/// decision flows through one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketLimits {
    mtu: usize,
}

impl PacketLimits {
    pub fn new(mtu: usize) -> Self {
        Self { mtu }
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Largest datagram that fits the MTU.
    pub fn max_datagram(&self) -> usize {
        self.mtu - UDP_OVERHEAD
    }

    /// Largest sealed packet body (excluding header and tag).
    pub fn max_body(&self) -> usize {
        self.max_datagram() - HEADER_SIZE - TAG_SIZE
    }

    /// Largest single user message payload.
    pub fn max_message(&self) -> usize {
        self.max_body() - MESSAGE_OVERHEAD_1
    }

    /// Interior fragment payload size. Kept well under the message maximum
    /// so fragments leave room for other messages in the same packet.
    pub fn max_fragment(&self) -> usize {
        let budget = self.max_message() - FRAGMENT_OVERHEAD;
        budget.min(1024)
    }

    /// Receive buffer size with slack for oversized datagrams.
    pub fn recv_buffer(&self) -> usize {
        self.mtu + 512
    }
}

impl Default for PacketLimits {
    fn default() -> Self {
        Self::new(crate::DEFAULT_MTU)
    }
}

/// One user message carried inside a packet.
#[derive(Debug, Clone)]
pub struct MessageSlot {
    pub msg_seq: SeqNum,
    pub pkt_type: PacketType,
    pub payload: Bytes,
}

/// A packet: header plus message slots.
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: PacketHeader,
    pub body: Bytes,
    pub messages: Vec<MessageSlot>,
}

impl Packet {
    /// Build a packet from a header and message slots, filling in the
    /// header's `length` and `count`.
    pub fn assemble(mut header: PacketHeader, messages: Vec<MessageSlot>) -> Result<Self> {
        if messages.len() > usize::from(u8::MAX) {
            return Err(ProtocolError::MalformedPacket("too many message slots".into()).into());
        }
        let body = match messages.len() {
            0 => Bytes::new(),
            1 => {
                let msg = &messages[0];
                let mut buf = Vec::with_capacity(MESSAGE_OVERHEAD_1 + msg.payload.len());
                buf.extend_from_slice(&msg.msg_seq.0.to_be_bytes());
                buf.extend_from_slice(&msg.payload);
                Bytes::from(buf)
            }
            _ => {
                let total: usize = messages
                    .iter()
                    .map(|m| MESSAGE_OVERHEAD_N + m.payload.len())
                    .sum();
                let mut buf = Vec::with_capacity(total);
                for msg in &messages {
                    buf.extend_from_slice(&(msg.payload.len() as u16).to_be_bytes());
                    buf.extend_from_slice(&msg.msg_seq.0.to_be_bytes());
                    buf.push(msg.pkt_type as u8);
                    buf.extend_from_slice(&msg.payload);
                }
                Bytes::from(buf)
            }
        };

        if body.len() > usize::from(u16::MAX) {
            return Err(ProtocolError::PayloadTooLarge {
                size: body.len(),
                max: usize::from(u16::MAX),
            }
            .into());
        }

        header.length = body.len() as u16;
        header.count = messages.len() as u8;

        Ok(Self {
            header,
            body,
            messages,
        })
    }

    /// Whether this packet travels sealed under the given key.
    ///
    /// The hellos are exchanged before both sides hold the key, so they go
    /// out CRC-protected even when the local side has already derived it.
    fn sealed(&self, key: Option<&SessionKey>) -> bool {
        key.is_some()
            && !matches!(
                self.header.pkt_type,
                PacketType::ClientHello | PacketType::ServerHello
            )
    }

    /// Total encoded size of this packet.
    pub fn encoded_len(&self, key: Option<&SessionKey>) -> usize {
        let trailer = if self.sealed(key) { TAG_SIZE } else { CRC_SIZE };
        HEADER_SIZE + self.body.len() + trailer
    }

    /// Serialize to a datagram, sealing or CRC-protecting the body.
    pub fn encode(&self, key: Option<&SessionKey>) -> Result<Vec<u8>> {
        let hdr = self.header.encode();

        if self.sealed(key) {
            let key = key.expect("sealed implies key");
            let mut nonce = [0u8; NONCE_SIZE];
            nonce.copy_from_slice(&hdr[..NONCE_SIZE]);

            let ct = seal(key, &nonce, &hdr, &self.body)?;
            let mut out = Vec::with_capacity(HEADER_SIZE + ct.len());
            out.extend_from_slice(&hdr);
            out.extend_from_slice(&ct);
            Ok(out)
        } else {
            let mut out = Vec::with_capacity(HEADER_SIZE + self.body.len() + CRC_SIZE);
            out.extend_from_slice(&hdr);
            out.extend_from_slice(&self.body);
            let crc = super::checksum(&out);
            out.extend_from_slice(&crc.to_be_bytes());
            Ok(out)
        }
    }

    /// Parse a datagram whose header has already been decoded.
    pub fn decode(
        header: PacketHeader,
        datagram: &[u8],
        key: Option<&SessionKey>,
    ) -> Result<Self> {
        let body_end = HEADER_SIZE + usize::from(header.length);
        if body_end > datagram.len() {
            return Err(ProtocolError::MalformedPacket("length exceeds datagram".into()).into());
        }

        let encrypted = key.is_some()
            && !matches!(
                header.pkt_type,
                PacketType::ClientHello | PacketType::ServerHello
            );

        let body: Bytes = if encrypted {
            let key = key.expect("encrypted implies key");
            if datagram.len() < body_end + TAG_SIZE {
                return Err(
                    ProtocolError::MalformedPacket("missing authentication tag".into()).into(),
                );
            }
            let mut nonce = [0u8; NONCE_SIZE];
            nonce.copy_from_slice(&datagram[..NONCE_SIZE]);
            let aad = &datagram[..HEADER_SIZE];
            let ct = &datagram[HEADER_SIZE..body_end + TAG_SIZE];
            Bytes::from(open(key, &nonce, aad, ct)?)
        } else {
            if datagram.len() < body_end + CRC_SIZE {
                return Err(ProtocolError::MalformedPacket("missing checksum".into()).into());
            }
            let expected = BigEndian::read_u32(&datagram[body_end..body_end + CRC_SIZE]);
            if super::checksum(&datagram[..body_end]) != expected {
                return Err(ProtocolError::ChecksumMismatch.into());
            }
            Bytes::copy_from_slice(&datagram[HEADER_SIZE..body_end])
        };

        let messages = Self::parse_slots(&header, &body)?;

        Ok(Self {
            header,
            body,
            messages,
        })
    }

    fn parse_slots(header: &PacketHeader, body: &Bytes) -> Result<Vec<MessageSlot>> {
        let mut messages = Vec::with_capacity(usize::from(header.count));

        match header.count {
            0 => {}
            1 => {
                if body.len() < MESSAGE_OVERHEAD_1 {
                    return Err(
                        ProtocolError::MalformedPacket("truncated message slot".into()).into()
                    );
                }
                let msg_seq = SeqNum(BigEndian::read_u16(&body[..2]));
                messages.push(MessageSlot {
                    msg_seq,
                    pkt_type: header.pkt_type,
                    payload: body.slice(2..),
                });
            }
            _ => {
                let mut offset = 0usize;
                for _ in 0..header.count {
                    if body.len() < offset + MESSAGE_OVERHEAD_N {
                        return Err(
                            ProtocolError::MalformedPacket("truncated message slot".into()).into(),
                        );
                    }
                    let len = usize::from(BigEndian::read_u16(&body[offset..offset + 2]));
                    let msg_seq = SeqNum(BigEndian::read_u16(&body[offset + 2..offset + 4]));
                    let pkt_type = PacketType::from_u8(body[offset + 4])
                        .ok_or(ProtocolError::InvalidPacketType(body[offset + 4]))?;

                    let start = offset + MESSAGE_OVERHEAD_N;
                    if body.len() < start + len {
                        return Err(ProtocolError::MalformedPacket(
                            "message extends past body".into(),
                        )
                        .into());
                    }
                    messages.push(MessageSlot {
                        msg_seq,
                        pkt_type,
                        payload: body.slice(start..start + len),
                    });
                    offset = start + len;
                }
            }
        }

        Ok(messages)
    }
}

/// Convenience: decode header and packet together, as a receiver does.
pub fn decode_datagram(
    datagram: &[u8],
    expect: Direction,
    key: Option<&SessionKey>,
) -> Result<Packet> {
    if datagram.len() < HEADER_SIZE {
        return Err(ProtocolError::MalformedPacket("short datagram".into()).into());
    }
    let header = PacketHeader::decode(&datagram[..HEADER_SIZE], expect).map_err(Error::from)?;
    Packet::decode(header, datagram, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_bytes;

    fn header(pkt_type: PacketType) -> PacketHeader {
        PacketHeader::new(
            Direction::ToServer,
            1000,
            pkt_type,
            SeqNum(7),
            SeqNum(6),
            0x8000_0000,
        )
    }

    fn slot(seq: u16, pkt_type: PacketType, payload: &[u8]) -> MessageSlot {
        MessageSlot {
            msg_seq: SeqNum(seq),
            pkt_type,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    fn session_key() -> SessionKey {
        SessionKey::new(random_bytes())
    }

    #[test]
    fn test_limits_default_mtu() {
        let limits = PacketLimits::default();
        assert_eq!(limits.max_datagram(), 1472);
        assert_eq!(limits.max_body(), 1436);
        assert_eq!(limits.max_message(), 1434);
        assert_eq!(limits.max_fragment(), 1024);
    }

    #[test]
    fn test_limits_small_mtu() {
        let limits = PacketLimits::new(576);
        assert_eq!(limits.max_body(), 576 - 28 - 20 - 16);
        assert!(limits.max_fragment() < 1024);
    }

    #[test]
    fn test_single_message_crc_roundtrip() {
        let pkt = Packet::assemble(
            header(PacketType::ClientHello),
            vec![slot(1, PacketType::ClientHello, b"hello")],
        )
        .unwrap();
        assert_eq!(pkt.header.count, 1);
        assert_eq!(usize::from(pkt.header.length), 2 + 5);

        let datagram = pkt.encode(None).unwrap();
        assert_eq!(datagram.len(), HEADER_SIZE + 7 + CRC_SIZE);

        let decoded = decode_datagram(&datagram, Direction::ToServer, None).unwrap();
        assert_eq!(decoded.messages.len(), 1);
        assert_eq!(decoded.messages[0].msg_seq, SeqNum(1));
        assert_eq!(&decoded.messages[0].payload[..], b"hello");
    }

    #[test]
    fn test_crc_corruption_detected() {
        let pkt = Packet::assemble(
            header(PacketType::ClientHello),
            vec![slot(1, PacketType::ClientHello, b"hello")],
        )
        .unwrap();
        let mut datagram = pkt.encode(None).unwrap();
        let last = datagram.len() - 1;
        datagram[last] ^= 0xff;

        assert!(matches!(
            decode_datagram(&datagram, Direction::ToServer, None),
            Err(Error::Protocol(ProtocolError::ChecksumMismatch))
        ));
    }

    #[test]
    fn test_sealed_roundtrip() {
        let key = session_key();
        let pkt = Packet::assemble(
            header(PacketType::App),
            vec![slot(9, PacketType::App, b"payload")],
        )
        .unwrap();

        let datagram = pkt.encode(Some(&key)).unwrap();
        assert_eq!(
            datagram.len(),
            HEADER_SIZE + 2 + 7 + crate::crypto::TAG_SIZE
        );

        let decoded = decode_datagram(&datagram, Direction::ToServer, Some(&key)).unwrap();
        assert_eq!(decoded.messages.len(), 1);
        assert_eq!(&decoded.messages[0].payload[..], b"payload");
    }

    #[test]
    fn test_sealed_tamper_detected() {
        let key = session_key();
        let pkt = Packet::assemble(
            header(PacketType::App),
            vec![slot(9, PacketType::App, b"payload")],
        )
        .unwrap();
        let good = pkt.encode(Some(&key)).unwrap();

        // flip one bit anywhere: body, tag, or header AAD
        for idx in [0usize, 5, HEADER_SIZE + 1, good.len() - 1] {
            let mut bad = good.clone();
            bad[idx] ^= 0x01;
            assert!(
                decode_datagram(&bad, Direction::ToServer, Some(&key)).is_err(),
                "tamper at {idx} not detected"
            );
        }
    }

    #[test]
    fn test_multi_message_roundtrip() {
        let key = session_key();
        let msgs = vec![
            slot(11, PacketType::App, b"first"),
            slot(12, PacketType::App, b""),
            slot(13, PacketType::AppFragment, b"third message body"),
        ];
        let pkt = Packet::assemble(header(PacketType::App), msgs).unwrap();
        assert_eq!(pkt.header.count, 3);
        assert_eq!(
            usize::from(pkt.header.length),
            3 * MESSAGE_OVERHEAD_N + 5 + 18
        );

        let datagram = pkt.encode(Some(&key)).unwrap();
        let decoded = decode_datagram(&datagram, Direction::ToServer, Some(&key)).unwrap();

        assert_eq!(decoded.messages.len(), 3);
        assert_eq!(decoded.messages[0].msg_seq, SeqNum(11));
        assert_eq!(&decoded.messages[0].payload[..], b"first");
        assert_eq!(decoded.messages[1].msg_seq, SeqNum(12));
        assert!(decoded.messages[1].payload.is_empty());
        assert_eq!(decoded.messages[2].pkt_type, PacketType::AppFragment);
        assert_eq!(&decoded.messages[2].payload[..], b"third message body");
    }

    #[test]
    fn test_empty_keep_alive() {
        let key = session_key();
        let pkt = Packet::assemble(header(PacketType::KeepAlive), vec![]).unwrap();
        assert_eq!(pkt.header.count, 0);
        assert_eq!(pkt.header.length, 0);

        let datagram = pkt.encode(Some(&key)).unwrap();
        let decoded = decode_datagram(&datagram, Direction::ToServer, Some(&key)).unwrap();
        assert!(decoded.messages.is_empty());
    }

    #[test]
    fn test_truncated_slot_rejected() {
        let key = session_key();
        let mut hdr = header(PacketType::App);
        hdr.length = 1;
        hdr.count = 1;
        let pkt = Packet {
            header: hdr,
            body: Bytes::from_static(b"x"),
            messages: vec![],
        };
        let datagram = pkt.encode(Some(&key)).unwrap();
        assert!(decode_datagram(&datagram, Direction::ToServer, Some(&key)).is_err());
    }

    #[test]
    fn test_message_overhead_table() {
        assert_eq!(message_overhead(0), 0);
        assert_eq!(message_overhead(1), 2);
        assert_eq!(message_overhead(2), 10);
        assert_eq!(message_overhead(5), 25);
    }
}
