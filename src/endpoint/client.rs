//! The client-side endpoint.
//!
//! Designed to be non-blocking so it can live inside a game's main loop:
//! call [`UdpClient::update`] once per frame to pump socket I/O and the
//! protocol tick, and queue messages at any time with [`UdpClient::send`].

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::ProtocolConfig;
use crate::connection::{Completion, Connection, ConnectionEvent};
use crate::crypto::RootPublicKey;
use crate::error::{Error, Result, TransportError};
use crate::metrics::ConnectionStats;
use crate::protocol::{Direction, PacketHeader, SeqNum, HEADER_SIZE};
use crate::types::{
    ConnectionStatus, ConnectionToken, DisconnectReason, RetryMode, SendCallback,
};

/// UDP game client endpoint.
///
/// The pinned server public key authenticates the server during the
/// handshake; a client will not complete a connection to a host that
/// cannot prove possession of the matching root private key.
pub struct UdpClient {
    config: ProtocolConfig,
    server_public_key: RootPublicKey,
    socket: Option<UdpSocket>,
    conn: Option<Connection>,
    messages: VecDeque<(SeqNum, Bytes)>,
    connect_callback: Option<SendCallback>,
    disconnect_reason: Option<DisconnectReason>,
    recv_buf: Vec<u8>,
}

impl UdpClient {
    pub fn new(server_public_key: RootPublicKey, config: ProtocolConfig) -> Self {
        let recv_buf = vec![0u8; config.limits().recv_buffer()];
        Self {
            config,
            server_public_key,
            socket: None,
            conn: None,
            messages: VecDeque::new(),
            connect_callback: None,
            disconnect_reason: None,
            recv_buf,
        }
    }

    /// Begin connecting. The outcome arrives through `callback` (and
    /// [`UdpClient::connected`]) as [`UdpClient::update`] is pumped.
    pub async fn connect(
        &mut self,
        addr: SocketAddr,
        callback: Option<SendCallback>,
    ) -> Result<()> {
        let bind_addr: SocketAddr = if addr.is_ipv6() {
            "[::]:0".parse().expect("valid wildcard address")
        } else {
            "0.0.0.0:0".parse().expect("valid wildcard address")
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| TransportError::BindFailed {
                addr: bind_addr,
                reason: e.to_string(),
            })?;
        socket
            .connect(addr)
            .await
            .map_err(|e| Error::ConnectionFailed {
                addr,
                reason: e.to_string(),
            })?;

        let now = Instant::now();
        let mut conn = Connection::client(
            addr,
            self.server_public_key.clone(),
            self.config.clone(),
            now,
        );
        conn.connect(now);

        // first CLIENT_HELLO goes out immediately
        if let Some(datagram) = conn.update(now) {
            socket
                .send(&datagram)
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        }

        self.socket = Some(socket);
        self.conn = Some(conn);
        self.connect_callback = callback;
        self.disconnect_reason = None;
        self.messages.clear();
        Ok(())
    }

    /// Pump socket I/O and the protocol tick. Call once per frame, from
    /// the same task that calls `send`.
    pub async fn update(&mut self) -> Result<()> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(());
        };
        let Some(socket) = self.socket.as_ref() else {
            return Ok(());
        };
        let now = Instant::now();

        // drain everything the socket has for us
        loop {
            match socket.try_recv(&mut self.recv_buf) {
                Ok(len) => {
                    if len < HEADER_SIZE {
                        debug!(len, "dropping short datagram");
                        continue;
                    }
                    match PacketHeader::decode(&self.recv_buf[..HEADER_SIZE], Direction::ToClient)
                    {
                        Ok(header) => conn.receive(header, &self.recv_buf[..len], now),
                        Err(e) => debug!(error = %e, "dropping malformed datagram"),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset
                    ) =>
                {
                    // remote gone; the silence timeout will drop the connection
                    debug!(error = %e, "remote unreachable");
                    break;
                }
                Err(e) => return Err(TransportError::ReceiveFailed(e.to_string()).into()),
            }
        }

        if let Some(datagram) = conn.update(now) {
            if let Err(e) = socket.send(&datagram).await {
                debug!(error = %e, "send failed");
            }
        }

        while let Some(event) = conn.poll_event() {
            match event {
                ConnectionEvent::Connected => {
                    if let Some(callback) = self.connect_callback.take() {
                        callback(true);
                    }
                }
                ConnectionEvent::ConnectFailed(failure) => {
                    warn!(%failure, "connection failed");
                    if let Some(callback) = self.connect_callback.take() {
                        callback(false);
                    }
                }
                ConnectionEvent::Message { msg_seq, payload } => {
                    self.messages.push_back((msg_seq, payload));
                }
                ConnectionEvent::Disconnected(reason) => {
                    self.disconnect_reason = Some(reason);
                }
            }
        }

        Ok(())
    }

    /// Queue a message to the server; it rides the next update's datagram.
    pub fn send(&mut self, payload: impl Into<Bytes>, retry: RetryMode) -> Result<()> {
        self.send_inner(payload.into(), retry, None)
    }

    /// Queue a message, invoking `callback` with the ack outcome.
    pub fn send_with_callback(
        &mut self,
        payload: impl Into<Bytes>,
        retry: RetryMode,
        callback: SendCallback,
    ) -> Result<()> {
        self.send_inner(payload.into(), retry, Some(Completion::Callback(callback)))
    }

    /// Queue a message and return a completion handle for the ack outcome.
    pub fn send_tracked(
        &mut self,
        payload: impl Into<Bytes>,
        retry: RetryMode,
    ) -> Result<oneshot::Receiver<bool>> {
        let (tx, rx) = oneshot::channel();
        self.send_inner(payload.into(), retry, Some(Completion::Channel(tx)))?;
        Ok(rx)
    }

    /// Send with retry-until-acked delivery.
    pub fn send_guaranteed(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        self.send(payload, RetryMode::RetryOnTimeout)
    }

    fn send_inner(
        &mut self,
        payload: Bytes,
        retry: RetryMode,
        completion: Option<Completion>,
    ) -> Result<()> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(Error::ConnectionClosed);
        };
        conn.send(payload, retry, completion, Instant::now())
    }

    pub fn connected(&self) -> bool {
        self.status().is_established()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.conn
            .as_ref()
            .map_or(ConnectionStatus::Disconnected, Connection::status)
    }

    /// Session token assigned by the server during the handshake.
    pub fn token(&self) -> Option<ConnectionToken> {
        self.conn.as_ref().and_then(Connection::token)
    }

    /// Smoothed one-way latency estimate in seconds.
    pub fn latency(&self) -> f64 {
        self.conn.as_ref().map_or(0.0, Connection::latency)
    }

    pub fn stats(&self) -> Option<&ConnectionStats> {
        self.conn.as_ref().map(Connection::stats)
    }

    /// Why the connection went away, once it has.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.disconnect_reason
    }

    pub fn has_messages(&self) -> bool {
        !self.messages.is_empty()
    }

    /// Pop one received message.
    pub fn next_message(&mut self) -> Option<(SeqNum, Bytes)> {
        self.messages.pop_front()
    }

    /// Drain all received messages.
    pub fn messages(&mut self) -> Vec<(SeqNum, Bytes)> {
        self.messages.drain(..).collect()
    }

    /// Request a graceful disconnect; pair with
    /// [`UdpClient::wait_for_disconnect`] to see it acked.
    pub fn disconnect(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            self.disconnect_reason = None;
            conn.disconnect(Instant::now());
        }
    }

    /// Pump until the server acks the disconnect, bounded by the teardown
    /// deadline, then release the socket.
    pub async fn wait_for_disconnect(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.config.disconnect_timeout;
        while self.disconnect_reason.is_none() && Instant::now() < deadline {
            self.update().await?;
            tokio::time::sleep(self.config.tick_interval).await;
        }
        self.conn = None;
        self.socket = None;
        Ok(())
    }
}
