//! The connection state machine.
//!
//! A [`Connection`] drives one endpoint pair: handshake, packet assembly
//! and parsing, sequence windowing, acknowledgement processing, retry
//! scheduling, keep-alive, and teardown. It is transport-agnostic: the
//! owning endpoint feeds it inbound datagrams and sends whatever
//! [`Connection::update`] returns. All state is mutated from the owning
//! endpoint's single protocol task.

mod pending;

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::config::ProtocolConfig;
use crate::crypto::{
    random_bytes, secure_compare, KeyPair, KeySchedule, PublicKey, RootKeyPair, RootPublicKey,
    SecretKey, SessionKey, SALT_LEN,
};
use crate::error::{Error, Result};
use crate::metrics::{ewma, ConnectionStats, RTT_EWMA_ALPHA};
use crate::protocol::{
    fragment, is_compatible_version, message_overhead, BitField, ChallengeResponse, ClientHello,
    Direction, FragmentAssembler, InsertOutcome, MessageSlot, Packet, PacketHeader, PacketLimits,
    PacketType, SeqNum, ServerHello,
};
use crate::types::{
    ConnectFailure, ConnectionStatus, ConnectionToken, DisconnectReason, RetryMode,
};

pub use pending::{Completion, FragmentTracker, PendingMessage};
use pending::Outstanding;

/// Maximum unacked packets in flight; assembly stalls beyond this.
pub const IN_FLIGHT_WINDOW: usize = 32;

/// Entries kept in the received-message dedup window.
const RECEIVED_MESSAGE_WINDOW: usize = 1024;

/// First client-hello retransmit delay; doubles per attempt.
const HELLO_BACKOFF_INITIAL: Duration = Duration::from_millis(500);

/// Which side of the connection this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn is_server(self) -> bool {
        matches!(self, Self::Server)
    }

    /// Direction stamped on packets this role emits.
    pub fn outbound_direction(self) -> Direction {
        match self {
            Self::Client => Direction::ToServer,
            Self::Server => Direction::ToClient,
        }
    }

    /// Direction expected on packets this role receives.
    pub fn inbound_direction(self) -> Direction {
        match self {
            Self::Client => Direction::ToClient,
            Self::Server => Direction::ToServer,
        }
    }
}

/// Surfaced to the owning endpoint as the connection changes state.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Handshake completed.
    Connected,
    /// Handshake failed; the connection is terminal.
    ConnectFailed(ConnectFailure),
    /// A user message arrived (reassembled if it was fragmented).
    Message { msg_seq: SeqNum, payload: Bytes },
    /// The connection ended.
    Disconnected(DisconnectReason),
}

/// Root key material: what this side uses to authenticate SERVER_HELLO.
enum RootMaterial {
    /// Client side: pinned server root public key.
    ClientPinned(RootPublicKey),
    /// Server side: the signing key.
    ServerSigner(Arc<RootKeyPair>),
}

struct InFlight {
    sent_at: Instant,
    msg_seqs: Vec<SeqNum>,
}

/// Fixed-capacity LRU of received message sequence numbers.
struct MessageWindow {
    cap: usize,
    seen: HashSet<u16>,
    order: VecDeque<u16>,
}

impl MessageWindow {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            seen: HashSet::with_capacity(cap),
            order: VecDeque::with_capacity(cap),
        }
    }

    /// Record a message seq; false if it was already present.
    fn insert(&mut self, seq: u16) -> bool {
        if !self.seen.insert(seq) {
            return false;
        }
        self.order.push_back(seq);
        while self.order.len() > self.cap {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

/// Protocol engine for a single remote peer.
pub struct Connection {
    role: Role,
    addr: SocketAddr,
    status: ConnectionStatus,
    cfg: ProtocolConfig,
    limits: PacketLimits,
    root: RootMaterial,

    local_secret: Option<SecretKey>,
    local_public: Option<PublicKey>,
    session_key: Option<SessionKey>,
    token: Option<ConnectionToken>,

    created: Instant,
    seq_sending: SeqNum,
    seq_message: SeqNum,
    next_fragment_group: u16,

    bitfield: BitField,
    received_msgs: MessageWindow,
    send_queue: VecDeque<PendingMessage>,
    outstanding: HashMap<u16, Outstanding>,
    in_flight: HashMap<u16, InFlight>,
    assembler: FragmentAssembler,

    latency: f64,
    last_inbound: Option<Instant>,
    last_outbound: Option<Instant>,

    connect_started: Option<Instant>,
    hello_sent_at: Option<Instant>,
    hello_backoff: Duration,

    disconnect_started: Option<Instant>,
    disconnect_msg_seq: Option<SeqNum>,
    final_ack: bool,

    events: VecDeque<ConnectionEvent>,
    stats: ConnectionStats,
    last_stats_second: u64,
}

impl Connection {
    /// Create the client side. Call [`Connection::connect`] to begin the
    /// handshake.
    pub fn client(
        addr: SocketAddr,
        server_public_key: RootPublicKey,
        cfg: ProtocolConfig,
        now: Instant,
    ) -> Self {
        Self::new(
            Role::Client,
            addr,
            RootMaterial::ClientPinned(server_public_key),
            ConnectionStatus::Disconnected,
            cfg,
            now,
        )
    }

    /// Create the server side for a peer whose CLIENT_HELLO just arrived.
    pub fn server(
        addr: SocketAddr,
        root: Arc<RootKeyPair>,
        cfg: ProtocolConfig,
        now: Instant,
    ) -> Self {
        Self::new(
            Role::Server,
            addr,
            RootMaterial::ServerSigner(root),
            ConnectionStatus::Connecting,
            cfg,
            now,
        )
    }

    fn new(
        role: Role,
        addr: SocketAddr,
        root: RootMaterial,
        status: ConnectionStatus,
        cfg: ProtocolConfig,
        now: Instant,
    ) -> Self {
        let limits = cfg.limits();
        let fragment_timeout = cfg.fragment_timeout;
        Self {
            role,
            addr,
            status,
            cfg,
            limits,
            root,
            local_secret: None,
            local_public: None,
            session_key: None,
            token: None,
            created: now,
            seq_sending: SeqNum::INVALID,
            seq_message: SeqNum::INVALID,
            next_fragment_group: 0,
            bitfield: BitField::new(),
            received_msgs: MessageWindow::new(RECEIVED_MESSAGE_WINDOW),
            send_queue: VecDeque::new(),
            outstanding: HashMap::new(),
            in_flight: HashMap::new(),
            assembler: FragmentAssembler::new(fragment_timeout),
            latency: 0.0,
            last_inbound: None,
            last_outbound: None,
            connect_started: None,
            hello_sent_at: None,
            hello_backoff: HELLO_BACKOFF_INITIAL,
            disconnect_started: None,
            disconnect_msg_seq: None,
            final_ack: false,
            events: VecDeque::new(),
            stats: ConnectionStats::new(),
            last_stats_second: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Session token, available once the handshake has reached step 2.
    pub fn token(&self) -> Option<ConnectionToken> {
        self.token
    }

    /// Smoothed one-way latency estimate in seconds (half the RTT EWMA).
    pub fn latency(&self) -> f64 {
        self.latency
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// True when no datagram has been accepted for `timeout`.
    pub fn timed_out(&self, timeout: Duration, now: Instant) -> bool {
        let last = self.last_inbound.unwrap_or(self.created);
        now.duration_since(last) >= timeout
    }

    /// Next state-change or message event, if any.
    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    /// Client side: generate the ephemeral key and queue CLIENT_HELLO.
    pub fn connect(&mut self, now: Instant) {
        debug_assert_eq!(self.role, Role::Client);
        let eph = KeyPair::generate();
        self.local_public = Some(eph.public.clone());
        self.local_secret = Some(eph.secret);
        self.status = ConnectionStatus::Connecting;
        self.connect_started = Some(now);
        self.hello_backoff = HELLO_BACKOFF_INITIAL;
        self.queue_client_hello(now);
    }

    fn queue_client_hello(&mut self, now: Instant) {
        let Some(public) = self.local_public.clone() else {
            return;
        };
        let hello = ClientHello {
            version: crate::PROTOCOL_VERSION,
            client_pubkey: public,
        };
        self.enqueue(
            PacketType::ClientHello,
            Bytes::from(hello.encode()),
            RetryMode::None,
            None,
            false,
        );
        self.hello_sent_at = Some(now);
        debug!(addr = %self.addr, "client hello queued");
    }

    /// Queue a user message, fragmenting if it exceeds the message maximum.
    pub fn send(
        &mut self,
        payload: Bytes,
        retry: RetryMode,
        completion: Option<Completion>,
        _now: Instant,
    ) -> Result<()> {
        if self.status != ConnectionStatus::Connected {
            return Err(Error::ConnectionClosed);
        }

        if payload.len() > self.limits.max_message() {
            let group = self.next_fragment_group;
            self.next_fragment_group = self.next_fragment_group.wrapping_add(1);
            let fragments = fragment::split(&payload, group, self.limits)?;
            let tracker = FragmentTracker::new(fragments.len(), completion);
            for frag in fragments {
                self.enqueue(
                    PacketType::AppFragment,
                    frag,
                    retry,
                    Some(Completion::Fragment(tracker.clone())),
                    false,
                );
            }
        } else {
            self.enqueue(PacketType::App, payload, retry, completion, false);
        }
        Ok(())
    }

    /// Begin graceful teardown. Queued user messages are dropped; a
    /// DISCONNECT is sent with retry until acked or the teardown deadline.
    pub fn disconnect(&mut self, now: Instant) {
        match self.status {
            ConnectionStatus::Connected => {
                self.send_queue.clear();
                self.outstanding.clear();
                let seq = self.enqueue(
                    PacketType::Disconnect,
                    Bytes::new(),
                    RetryMode::RetryOnTimeout,
                    None,
                    false,
                );
                self.disconnect_msg_seq = Some(seq);
                self.disconnect_started = Some(now);
                self.status = ConnectionStatus::Disconnecting;
                info!(addr = %self.addr, "disconnecting");
            }
            ConnectionStatus::Connecting => {
                self.send_queue.clear();
                self.outstanding.clear();
                self.status = ConnectionStatus::Disconnected;
            }
            _ => {}
        }
    }

    fn enqueue(
        &mut self,
        pkt_type: PacketType,
        payload: Bytes,
        retry: RetryMode,
        completion: Option<Completion>,
        front: bool,
    ) -> SeqNum {
        self.seq_message = self.seq_message.next();
        let msg_seq = self.seq_message;

        if retry != RetryMode::None || completion.is_some() {
            self.outstanding.insert(
                msg_seq.0,
                Outstanding {
                    pkt_type,
                    retry,
                    payload: if retry == RetryMode::None {
                        None
                    } else {
                        Some(payload.clone())
                    },
                    completion,
                    first_sent: None,
                    last_sent: None,
                },
            );
        }

        let msg = PendingMessage {
            msg_seq,
            pkt_type,
            payload,
            retry,
        };
        if front {
            self.send_queue.push_front(msg);
        } else {
            self.send_queue.push_back(msg);
        }
        self.stats.sent += 1;
        msg_seq
    }

    /// One protocol tick: expire unacked packets, enforce timeouts, and
    /// assemble at most one outgoing datagram.
    pub fn update(&mut self, now: Instant) -> Option<Vec<u8>> {
        self.roll_stats(now);

        if self.status.is_terminal() {
            if self.final_ack {
                return self.build_packet(now);
            }
            return None;
        }

        // client hello retry with backoff, bounded by the connection timeout
        if self.role == Role::Client && self.status == ConnectionStatus::Connecting {
            if let Some(started) = self.connect_started {
                if now.duration_since(started) >= self.cfg.connection_timeout {
                    info!(addr = %self.addr, "connection attempt timed out");
                    self.status = ConnectionStatus::Dropped;
                    self.connect_started = None;
                    self.send_queue.clear();
                    self.outstanding.clear();
                    self.events
                        .push_back(ConnectionEvent::ConnectFailed(ConnectFailure::Timeout));
                    return None;
                }
                if let Some(sent) = self.hello_sent_at {
                    if now.duration_since(sent) >= self.hello_backoff {
                        debug!(addr = %self.addr, backoff = ?self.hello_backoff, "resending client hello");
                        self.queue_client_hello(now);
                        self.hello_backoff *= 2;
                    }
                }
            }
        }

        // expire unacked packets
        let timeout = self.cfg.message_timeout;
        let mut expired: Vec<u16> = self
            .in_flight
            .iter()
            .filter(|(_, f)| now.duration_since(f.sent_at) >= timeout)
            .map(|(&s, _)| s)
            .collect();
        expired.sort_unstable();
        for seq in expired {
            self.handle_timeout(seq, now);
        }

        // drop the connection on inbound silence
        if matches!(
            self.status,
            ConnectionStatus::Connected | ConnectionStatus::Disconnecting
        ) && self.timed_out(self.cfg.connection_timeout, now)
        {
            warn!(addr = %self.addr, "connection timed out");
            self.set_terminal(ConnectionStatus::Dropped, DisconnectReason::Timeout);
            return None;
        }

        // give up waiting for the DISCONNECT ack
        if self.status == ConnectionStatus::Disconnecting {
            if let Some(started) = self.disconnect_started {
                if now.duration_since(started) >= self.cfg.disconnect_timeout {
                    self.set_terminal(ConnectionStatus::Disconnected, DisconnectReason::Local);
                    return None;
                }
            }
        }

        self.assembler.expire(now);

        self.build_packet(now)
    }

    /// Process one inbound datagram whose header was already decoded.
    pub fn receive(&mut self, header: PacketHeader, datagram: &[u8], now: Instant) {
        // cheap duplicate/stale rejection before any crypto work
        match self.bitfield.probe(header.seq) {
            InsertOutcome::Duplicate => {
                debug!(addr = %self.addr, seq = %header.seq, "dropping duplicate packet");
                self.stats.dropped += 1;
                return;
            }
            InsertOutcome::Stale => {
                debug!(addr = %self.addr, seq = %header.seq, "dropping stale packet");
                self.stats.dropped += 1;
                return;
            }
            InsertOutcome::Accepted => {}
        }

        let packet = match Packet::decode(header, datagram, self.session_key.as_ref()) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(addr = %self.addr, seq = %header.seq, error = %e, "dropping undecodable packet");
                self.stats.dropped += 1;
                return;
            }
        };

        self.bitfield.insert(header.seq);
        self.stats.on_receive(datagram.len());
        self.last_inbound = Some(now);

        self.process_acks(&header, now);

        for slot in packet.messages {
            self.recv_message(slot, now);
        }
    }

    fn process_acks(&mut self, header: &PacketHeader, now: Instant) {
        if !header.ack.is_valid() {
            return;
        }
        let seqs: Vec<u16> = self.in_flight.keys().copied().collect();
        for seq in seqs {
            let d = header.ack.diff(SeqNum(seq));
            let acked = d == 0
                || (1..=BitField::WIDTH).contains(&d)
                    && header.ack_bits & (0x8000_0000u32 >> (d - 1)) != 0;
            if acked {
                self.handle_ack(seq, now);
            }
        }
    }

    fn handle_ack(&mut self, seq: u16, now: Instant) {
        let Some(flight) = self.in_flight.remove(&seq) else {
            return;
        };
        self.stats.acked += 1;

        // latency is half the smoothed round trip, send to ack
        let rtt = now.duration_since(flight.sent_at).as_secs_f64();
        self.latency = ewma(self.latency, rtt / 2.0, RTT_EWMA_ALPHA);

        for ms in flight.msg_seqs {
            if let Some(out) = self.outstanding.remove(&ms.0) {
                if let Some(completion) = out.completion {
                    completion.resolve(true);
                }
            }
            if self.disconnect_msg_seq == Some(ms) {
                self.disconnect_msg_seq = None;
                if self.status == ConnectionStatus::Disconnecting {
                    self.set_terminal(ConnectionStatus::Disconnected, DisconnectReason::Local);
                }
            }
        }
    }

    fn handle_timeout(&mut self, seq: u16, _now: Instant) {
        let Some(flight) = self.in_flight.remove(&seq) else {
            return;
        };
        self.stats.timeouts += 1;
        debug!(addr = %self.addr, seq, "outgoing packet timed out");

        for ms in flight.msg_seqs {
            let Some(out) = self.outstanding.remove(&ms.0) else {
                continue;
            };
            match out.retry {
                RetryMode::RetryOnTimeout => {
                    // re-enqueue at the head with a fresh message seq
                    let payload = out.payload.unwrap_or_default();
                    let new_seq = self.enqueue(
                        out.pkt_type,
                        payload,
                        RetryMode::RetryOnTimeout,
                        out.completion,
                        true,
                    );
                    if self.disconnect_msg_seq == Some(ms) {
                        self.disconnect_msg_seq = Some(new_seq);
                    }
                }
                RetryMode::None | RetryMode::BestEffort => {
                    if let Some(completion) = out.completion {
                        completion.resolve(false);
                    }
                }
            }
        }
    }

    fn recv_message(&mut self, slot: MessageSlot, now: Instant) {
        if !self.received_msgs.insert(slot.msg_seq.0) {
            debug!(addr = %self.addr, msg_seq = %slot.msg_seq, "dropping duplicate message");
            self.stats.duplicates += 1;
            return;
        }

        match slot.pkt_type {
            PacketType::ClientHello => self.recv_client_hello(&slot.payload, now),
            PacketType::ServerHello => self.recv_server_hello(&slot.payload, now),
            PacketType::ChallengeResp => self.recv_challenge_resp(&slot.payload),
            PacketType::KeepAlive => {}
            PacketType::Disconnect => self.recv_disconnect(),
            PacketType::App => self.recv_app(slot.msg_seq, slot.payload),
            PacketType::AppFragment => self.recv_app_fragment(slot.msg_seq, &slot.payload, now),
        }
    }

    fn recv_client_hello(&mut self, body: &Bytes, _now: Instant) {
        if self.role != Role::Server
            || self.status != ConnectionStatus::Connecting
            || self.session_key.is_some()
        {
            debug!(addr = %self.addr, status = %self.status, "ignoring unexpected client hello");
            return;
        }
        let RootMaterial::ServerSigner(root) = &self.root else {
            return;
        };
        let root = Arc::clone(root);

        let hello = match ClientHello::decode(body) {
            Ok(hello) => hello,
            Err(e) => {
                debug!(addr = %self.addr, error = %e, "malformed client hello");
                self.stats.dropped += 1;
                return;
            }
        };
        if !is_compatible_version(hello.version) {
            debug!(addr = %self.addr, version = hello.version, "unsupported protocol version");
            return;
        }

        let eph = KeyPair::generate();
        let shared = eph.secret.diffie_hellman(&hello.client_pubkey);
        let salt: [u8; SALT_LEN] = random_bytes();
        let token = ConnectionToken::generate();

        let reply = ServerHello {
            server_pubkey: eph.public,
            salt,
            token,
        };
        let body = reply.encode_signed(&hello.client_pubkey, &root);

        self.session_key = Some(KeySchedule::session_key(shared.as_slice(), &salt));
        self.token = Some(token);
        self.enqueue(
            PacketType::ServerHello,
            Bytes::from(body),
            RetryMode::None,
            None,
            false,
        );
        info!(addr = %self.addr, token = %token, "client hello accepted");
    }

    fn recv_server_hello(&mut self, body: &Bytes, _now: Instant) {
        if self.role != Role::Client || self.status != ConnectionStatus::Connecting {
            debug!(addr = %self.addr, status = %self.status, "ignoring unexpected server hello");
            return;
        }
        let RootMaterial::ClientPinned(pinned) = &self.root else {
            return;
        };
        let Some(local_public) = self.local_public.clone() else {
            return;
        };

        match ServerHello::decode_verified(body, &local_public, pinned) {
            Err(e) => {
                warn!(addr = %self.addr, error = %e, "server hello rejected");
                self.status = ConnectionStatus::Dropped;
                self.send_queue.clear();
                self.outstanding.clear();
                self.in_flight.clear();
                self.events.push_back(ConnectionEvent::ConnectFailed(
                    ConnectFailure::ServerNotAuthenticated,
                ));
            }
            Ok(hello) => {
                let Some(secret) = self.local_secret.take() else {
                    return;
                };
                let shared = secret.diffie_hellman(&hello.server_pubkey);
                self.session_key = Some(KeySchedule::session_key(shared.as_slice(), &hello.salt));
                self.token = Some(hello.token);
                self.connect_started = None;
                self.hello_sent_at = None;

                let resp = ChallengeResponse { token: hello.token };
                self.enqueue(
                    PacketType::ChallengeResp,
                    Bytes::from(resp.encode()),
                    RetryMode::None,
                    None,
                    false,
                );
                self.status = ConnectionStatus::Connected;
                self.events.push_back(ConnectionEvent::Connected);
                info!(addr = %self.addr, token = %hello.token, "connected");
            }
        }
    }

    fn recv_challenge_resp(&mut self, body: &Bytes) {
        if self.role != Role::Server || self.status != ConnectionStatus::Connecting {
            debug!(addr = %self.addr, status = %self.status, "ignoring unexpected challenge response");
            return;
        }
        let resp = match ChallengeResponse::decode(body) {
            Ok(resp) => resp,
            Err(e) => {
                debug!(addr = %self.addr, error = %e, "malformed challenge response");
                self.stats.dropped += 1;
                return;
            }
        };
        let Some(expected) = self.token else {
            return;
        };

        if secure_compare(resp.token.as_bytes(), expected.as_bytes()) {
            self.status = ConnectionStatus::Connected;
            self.events.push_back(ConnectionEvent::Connected);
            info!(addr = %self.addr, token = %expected, "challenge verified, connection established");
        } else {
            warn!(addr = %self.addr, "challenge token mismatch");
            self.status = ConnectionStatus::Dropped;
        }
    }

    fn recv_disconnect(&mut self) {
        if !matches!(
            self.status,
            ConnectionStatus::Connected | ConnectionStatus::Disconnecting
        ) {
            return;
        }
        info!(addr = %self.addr, "received disconnect");
        self.set_terminal(ConnectionStatus::Disconnected, DisconnectReason::Remote);
        // one last keep-alive goes out so the remote sees its DISCONNECT acked
        self.final_ack = true;
    }

    fn recv_app(&mut self, msg_seq: SeqNum, payload: Bytes) {
        if self.status != ConnectionStatus::Connected {
            debug!(addr = %self.addr, status = %self.status, "dropping app message outside session");
            return;
        }
        self.events
            .push_back(ConnectionEvent::Message { msg_seq, payload });
    }

    fn recv_app_fragment(&mut self, msg_seq: SeqNum, payload: &Bytes, now: Instant) {
        if self.status != ConnectionStatus::Connected {
            debug!(addr = %self.addr, status = %self.status, "dropping fragment outside session");
            return;
        }
        match self.assembler.insert(msg_seq, payload, now) {
            Ok(Some((first_seq, payload))) => {
                self.events.push_back(ConnectionEvent::Message {
                    msg_seq: first_seq,
                    payload,
                });
            }
            Ok(None) => {}
            Err(e) => {
                debug!(addr = %self.addr, error = %e, "malformed fragment");
                self.stats.dropped += 1;
            }
        }
    }

    /// Assemble at most one outgoing packet from the queue.
    fn build_packet(&mut self, now: Instant) -> Option<Vec<u8>> {
        // in-flight window: never advance past the oldest unacked + 32
        if self.in_flight.len() >= IN_FLIGHT_WINDOW {
            self.stats.window_stalls += 1;
            return None;
        }
        if let Some(min) = self.min_unacked() {
            if self.seq_sending.next().diff(min) > BitField::WIDTH {
                self.stats.window_stalls += 1;
                return None;
            }
        }

        let max_body = self.limits.max_body();
        let keep_alive = self.cfg.keep_alive_interval();
        let mut slots: Vec<MessageSlot> = Vec::new();
        let mut tracked: Vec<SeqNum> = Vec::new();
        let mut body_len = 0usize;

        // best-effort messages ride again on the keep-alive cadence
        let mut resend: Vec<u16> = self
            .outstanding
            .iter()
            .filter(|(_, o)| o.retry == RetryMode::BestEffort)
            .filter(|(_, o)| {
                o.last_sent
                    .is_some_and(|t| now.duration_since(t) >= keep_alive)
            })
            .map(|(&ms, _)| ms)
            .collect();
        resend.sort_unstable();

        for ms in resend {
            if slots.len() >= usize::from(u8::MAX) {
                break;
            }
            let Some(out) = self.outstanding.get_mut(&ms) else {
                continue;
            };
            let Some(payload) = out.payload.clone() else {
                continue;
            };
            if body_len + payload.len() + message_overhead(slots.len() + 1) <= max_body {
                body_len += payload.len();
                slots.push(MessageSlot {
                    msg_seq: SeqNum(ms),
                    pkt_type: out.pkt_type,
                    payload,
                });
                tracked.push(SeqNum(ms));
                out.last_sent = Some(now);
            }
        }

        // drain the queue head-first, skipping messages that don't fit
        let mut idx = 0;
        while idx < self.send_queue.len() && slots.len() < usize::from(u8::MAX) {
            let fits = {
                let msg = &self.send_queue[idx];
                body_len + msg.payload.len() + message_overhead(slots.len() + 1) <= max_body
            };
            if fits {
                let msg = self.send_queue.remove(idx).expect("index in bounds");
                if let Some(out) = self.outstanding.get_mut(&msg.msg_seq.0) {
                    out.first_sent.get_or_insert(now);
                    out.last_sent = Some(now);
                    tracked.push(msg.msg_seq);
                }
                body_len += msg.payload.len();
                slots.push(MessageSlot {
                    msg_seq: msg.msg_seq,
                    pkt_type: msg.pkt_type,
                    payload: msg.payload,
                });
            } else {
                idx += 1;
            }
        }

        let pkt_type = if let Some(first) = slots.first() {
            first.pkt_type
        } else {
            let keep_alive_due = self
                .last_outbound
                .map_or(true, |t| now.duration_since(t) >= keep_alive);
            if self.final_ack
                || (keep_alive_due && self.status == ConnectionStatus::Connected)
            {
                self.final_ack = false;
                PacketType::KeepAlive
            } else {
                return None;
            }
        };

        self.seq_sending = self.seq_sending.next();
        let seq = self.seq_sending;
        self.in_flight.insert(
            seq.0,
            InFlight {
                sent_at: now,
                msg_seqs: tracked,
            },
        );

        let header = PacketHeader::new(
            self.role.outbound_direction(),
            self.ctime(now),
            pkt_type,
            seq,
            self.bitfield.head(),
            self.bitfield.bits(),
        );

        let packet = match Packet::assemble(header, slots) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(addr = %self.addr, error = %e, "packet assembly failed");
                self.in_flight.remove(&seq.0);
                return None;
            }
        };
        let datagram = match packet.encode(self.session_key.as_ref()) {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!(addr = %self.addr, error = %e, "packet encode failed");
                self.in_flight.remove(&seq.0);
                return None;
            }
        };

        debug_assert!(datagram.len() <= self.limits.max_datagram());

        self.stats.assembled += 1;
        self.stats.on_send(datagram.len());
        self.last_outbound = Some(now);
        Some(datagram)
    }

    fn min_unacked(&self) -> Option<SeqNum> {
        self.in_flight
            .keys()
            .copied()
            .map(SeqNum)
            .reduce(|a, b| if b.diff(a) < 0 { b } else { a })
    }

    fn set_terminal(&mut self, status: ConnectionStatus, reason: DisconnectReason) {
        debug!(addr = %self.addr, from = %self.status, to = %status, %reason, "connection closed");
        self.status = status;
        self.send_queue.clear();
        self.outstanding.clear();
        self.in_flight.clear();
        self.disconnect_msg_seq = None;
        self.events.push_back(ConnectionEvent::Disconnected(reason));
    }

    fn ctime(&self, now: Instant) -> u32 {
        now.duration_since(self.created).as_millis() as u32
    }

    fn roll_stats(&mut self, now: Instant) {
        let secs = now.duration_since(self.created).as_secs();
        while self.last_stats_second < secs {
            self.last_stats_second += 1;
            let latency = self.latency;
            self.stats.roll_second(latency);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("addr", &self.addr)
            .field("status", &self.status)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}
