//! UDP endpoints: the server-side multiplexer and the poll-driven client.
//!
//! Both endpoints own their socket and all connection state, and mutate it
//! from a single task; application callbacks run on that same task, so
//! `connect`, `disconnect`, `handle_message` and `update` are never
//! concurrent for one connection.

mod client;
mod server;

pub use client::UdpClient;
pub use server::{ShutdownHandle, UdpServer};

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::connection::{Completion, Connection};
use crate::error::Result;
use crate::metrics::ConnectionStats;
use crate::protocol::SeqNum;
use crate::types::{ConnectionStatus, ConnectionToken, RetryMode, SendCallback};

/// Application surface for server-side game logic.
///
/// Implement the events you care about; the defaults do nothing. All events
/// for one server run on one task, in order: `connect` precedes any
/// `handle_message` for that client, which precede its `disconnect`.
pub trait EventHandler {
    /// The server is about to enter its main loop.
    fn starting(&mut self) {}

    /// The server is shutting down gracefully. Not guaranteed to run on
    /// crash or kill.
    fn shutdown(&mut self) {}

    /// A client completed the handshake.
    fn connect(&mut self, _client: &mut RemoteClient<'_>) {}

    /// A client disconnected or timed out.
    fn disconnect(&mut self, _client: &mut RemoteClient<'_>) {}

    /// One server tick; `dt` is the time since the previous tick.
    fn update(&mut self, _dt: Duration) {}

    /// A message arrived from a connected client. Raised once per message
    /// even when several shared a datagram.
    fn handle_message(
        &mut self,
        _client: &mut RemoteClient<'_>,
        _msg_seq: SeqNum,
        _payload: &[u8],
    ) {
    }
}

/// Handle to one connected client, passed to [`EventHandler`] events.
///
/// The remote address is unique per client but may be PII; prefer sharing
/// the session token with other clients.
pub struct RemoteClient<'a> {
    conn: &'a mut Connection,
    now: Instant,
}

impl<'a> RemoteClient<'a> {
    pub(crate) fn new(conn: &'a mut Connection, now: Instant) -> Self {
        Self { conn, now }
    }

    pub fn addr(&self) -> SocketAddr {
        self.conn.addr()
    }

    /// Unique session token assigned during the handshake.
    pub fn token(&self) -> Option<ConnectionToken> {
        self.conn.token()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.conn.status()
    }

    /// Smoothed one-way latency estimate in seconds.
    pub fn latency(&self) -> f64 {
        self.conn.latency()
    }

    pub fn stats(&self) -> &ConnectionStats {
        self.conn.stats()
    }

    /// Queue a message to this client. Sent on the next tick; fragmented
    /// automatically when larger than a single packet allows.
    pub fn send(&mut self, payload: impl Into<Bytes>, retry: RetryMode) -> Result<()> {
        self.conn.send(payload.into(), retry, None, self.now)
    }

    /// Queue a message and invoke `callback` with `true` once it is acked
    /// or `false` on timeout.
    pub fn send_with_callback(
        &mut self,
        payload: impl Into<Bytes>,
        retry: RetryMode,
        callback: SendCallback,
    ) -> Result<()> {
        self.conn
            .send(payload.into(), retry, Some(Completion::Callback(callback)), self.now)
    }

    /// Queue a message and return a completion handle resolved with the
    /// ack outcome.
    pub fn send_tracked(
        &mut self,
        payload: impl Into<Bytes>,
        retry: RetryMode,
    ) -> Result<oneshot::Receiver<bool>> {
        let (tx, rx) = oneshot::channel();
        self.conn
            .send(payload.into(), retry, Some(Completion::Channel(tx)), self.now)?;
        Ok(rx)
    }

    /// Send with retry-until-acked delivery.
    pub fn send_guaranteed(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        self.send(payload, RetryMode::RetryOnTimeout)
    }

    /// Begin dropping this client.
    pub fn disconnect(&mut self) {
        self.conn.disconnect(self.now);
    }
}
