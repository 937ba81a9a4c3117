//! Fragmentation and reassembly of oversized messages.
//!
//! A message larger than the single-message maximum is split into ordered
//! fragments sharing a 16-bit group id. Each fragment travels as its own
//! APP_FRAGMENT message with a 6-byte prefix: `group(2) || index(2) ||
//! total(2)`, indices 0..total. Interior fragments are capped at 1 KiB so a
//! fragment burst still leaves packet room for other traffic; the final
//! fragment may use the full message budget.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use tracing::debug;

use crate::error::{ProtocolError, Result};

use super::packet::{PacketLimits, FRAGMENT_OVERHEAD};
use super::seq::SeqNum;

/// Maximum reassembly groups tracked at once; the oldest is evicted beyond
/// this.
pub const MAX_GROUPS: usize = 64;

/// Default time allowed for a group to complete before it is discarded.
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Split a payload into fragment messages, each carrying its 6-byte prefix.
pub fn split(payload: &[u8], group_id: u16, limits: PacketLimits) -> Result<Vec<Bytes>> {
    let interior = limits.max_fragment();
    let last_budget = limits.max_message() - FRAGMENT_OVERHEAD;

    // Count fragments first: the prefix needs the total up front.
    let mut chunks: Vec<&[u8]> = Vec::new();
    let mut rest = payload;
    while !rest.is_empty() {
        if rest.len() <= last_budget {
            // the final fragment may use all remaining message space
            chunks.push(rest);
            rest = &[];
        } else {
            let (chunk, tail) = rest.split_at(interior);
            chunks.push(chunk);
            rest = tail;
        }
    }

    if chunks.len() > usize::from(u16::MAX) {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload.len(),
            max: usize::from(u16::MAX) * interior,
        }
        .into());
    }

    let total = chunks.len() as u16;
    let fragments = chunks
        .iter()
        .enumerate()
        .map(|(index, chunk)| {
            let mut buf = Vec::with_capacity(FRAGMENT_OVERHEAD + chunk.len());
            buf.extend_from_slice(&group_id.to_be_bytes());
            buf.extend_from_slice(&(index as u16).to_be_bytes());
            buf.extend_from_slice(&total.to_be_bytes());
            buf.extend_from_slice(chunk);
            Bytes::from(buf)
        })
        .collect();

    Ok(fragments)
}

/// Parse the fragment prefix off an APP_FRAGMENT payload.
pub fn parse(payload: &Bytes) -> Result<(u16, u16, u16, Bytes)> {
    if payload.len() < FRAGMENT_OVERHEAD {
        return Err(ProtocolError::MalformedPacket("short fragment".into()).into());
    }
    let group_id = BigEndian::read_u16(&payload[0..2]);
    let index = BigEndian::read_u16(&payload[2..4]);
    let total = BigEndian::read_u16(&payload[4..6]);
    Ok((group_id, index, total, payload.slice(FRAGMENT_OVERHEAD..)))
}

struct Group {
    slots: Vec<Option<Bytes>>,
    received: usize,
    first_msg_seq: Option<SeqNum>,
    created: Instant,
}

impl Group {
    fn new(total: usize, now: Instant) -> Self {
        Self {
            slots: vec![None; total],
            received: 0,
            first_msg_seq: None,
            created: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.slots.len()
    }

    fn payload(&self) -> Bytes {
        let len: usize = self.slots.iter().flatten().map(Bytes::len).sum();
        let mut out = Vec::with_capacity(len);
        for slot in self.slots.iter().flatten() {
            out.extend_from_slice(slot);
        }
        Bytes::from(out)
    }
}

/// Reassembles inbound fragments, keyed by group id.
pub struct FragmentAssembler {
    groups: HashMap<u16, Group>,
    max_groups: usize,
    timeout: Duration,
}

impl FragmentAssembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            groups: HashMap::new(),
            max_groups: MAX_GROUPS,
            timeout,
        }
    }

    /// Number of groups currently in flight.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Accept one fragment. Returns the reassembled message once the last
    /// fragment of its group arrives, tagged with the msg_seq of fragment 0.
    pub fn insert(
        &mut self,
        msg_seq: SeqNum,
        payload: &Bytes,
        now: Instant,
    ) -> Result<Option<(SeqNum, Bytes)>> {
        let (group_id, index, total, fragment) = parse(payload)?;

        if total == 0 || index >= total {
            return Err(
                ProtocolError::MalformedPacket(format!("fragment {index}/{total}")).into(),
            );
        }

        if !self.groups.contains_key(&group_id) {
            if self.groups.len() >= self.max_groups {
                self.evict_oldest();
            }
            self.groups
                .insert(group_id, Group::new(usize::from(total), now));
        }

        let group = self
            .groups
            .get_mut(&group_id)
            .expect("group inserted above");

        if group.slots.len() != usize::from(total) {
            // stray fragment from a recycled group id
            return Err(
                ProtocolError::MalformedPacket("fragment total mismatch".into()).into(),
            );
        }

        let slot = &mut group.slots[usize::from(index)];
        if slot.is_none() {
            *slot = Some(fragment);
            group.received += 1;
        }
        if index == 0 {
            group.first_msg_seq = Some(msg_seq);
        }

        if group.is_complete() {
            let group = self.groups.remove(&group_id).expect("complete group");
            let seq = group.first_msg_seq.expect("fragment 0 received");
            return Ok(Some((seq, group.payload())));
        }

        Ok(None)
    }

    /// Discard groups that have exceeded the reassembly timeout. These are
    /// usually tails of duplicated packets arriving after completion.
    pub fn expire(&mut self, now: Instant) {
        let timeout = self.timeout;
        self.groups.retain(|group_id, group| {
            let keep = now.duration_since(group.created) < timeout;
            if !keep {
                debug!(group = group_id, received = group.received, "fragment group expired");
            }
            keep
        });
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self
            .groups
            .iter()
            .min_by_key(|(_, g)| g.created)
            .map(|(id, _)| *id)
        {
            debug!(group = oldest, "fragment table full, evicting oldest group");
            self.groups.remove(&oldest);
        }
    }
}
