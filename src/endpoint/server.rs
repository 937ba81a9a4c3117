//! The server-side endpoint multiplexer.
//!
//! One task owns the socket and every connection. Datagrams route by source
//! address through two pools: `pending` holds handshakes that have not
//! produced a valid CHALLENGE_RESP, so a peer cannot deliver application
//! traffic without completing the handshake; `connections` holds
//! established sessions that raise [`EventHandler`] events.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::{Connection, ConnectionEvent};
use crate::crypto::{RootKeyPair, RootPublicKey};
use crate::error::{Error, Result, TransportError};
use crate::protocol::{
    Direction, PacketHeader, PacketType, HEADER_SIZE, SERVER_HELLO_WIRE_LEN,
};
use crate::types::ConnectionStatus;

use super::{EventHandler, RemoteClient};

/// Cloneable handle that stops a running [`UdpServer`].
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(());
    }
}

/// UDP game server endpoint.
pub struct UdpServer<H> {
    socket: UdpSocket,
    handler: H,
    config: Config,
    root: Arc<RootKeyPair>,
    connections: HashMap<SocketAddr, Connection>,
    pending: HashMap<SocketAddr, Connection>,
    block_list: HashSet<IpAddr>,
    shutdown_tx: broadcast::Sender<()>,
}

impl<H: EventHandler> UdpServer<H> {
    /// Bind the listen socket and load (or generate) the root key.
    pub async fn bind(config: Config, handler: H) -> Result<Self> {
        config.validate()?;

        let root = match &config.server.root_key {
            Some(path) => {
                let pem = std::fs::read_to_string(path)
                    .map_err(|e| Error::Config(format!("failed to read root key: {e}")))?;
                Arc::new(RootKeyPair::from_pkcs8_pem(&pem)?)
            }
            None => {
                warn!("no root key configured; generating a transient one");
                Arc::new(RootKeyPair::generate())
            }
        };

        let listen = config.server.listen_addr;
        let socket = UdpSocket::bind(listen)
            .await
            .map_err(|e| TransportError::BindFailed {
                addr: listen,
                reason: e.to_string(),
            })?;
        let local = socket
            .local_addr()
            .map_err(|e| TransportError::SocketError(e.to_string()))?;
        info!(addr = %local, "server listening");

        let (shutdown_tx, _) = broadcast::channel(1);
        let block_list = config.server.block_list.clone();

        Ok(Self {
            socket,
            handler,
            config,
            root,
            connections: HashMap::new(),
            pending: HashMap::new(),
            block_list,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| TransportError::SocketError(e.to_string()).into())
    }

    /// Public half of the root key, for distribution to clients.
    pub fn root_public_key(&self) -> RootPublicKey {
        self.root.public()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Number of established connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Run the endpoint until a [`ShutdownHandle`] fires.
    pub async fn run(mut self) -> Result<()> {
        self.handler.starting();

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.config.protocol.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut buf = vec![0u8; self.config.protocol.limits().recv_buffer()];
        let mut last_tick = Instant::now();

        enum Step {
            Datagram(usize, SocketAddr),
            Tick,
            Shutdown,
        }

        info!("server main loop starting");
        loop {
            let step = tokio::select! {
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, addr)) => Step::Datagram(len, addr),
                    Err(e) => {
                        warn!(error = %e, "socket receive failed");
                        continue;
                    }
                },
                _ = ticker.tick() => Step::Tick,
                _ = shutdown_rx.recv() => Step::Shutdown,
            };

            match step {
                Step::Datagram(len, addr) => {
                    let now = Instant::now();
                    self.route(&buf[..len], addr, now).await;
                }
                Step::Tick => {
                    let now = Instant::now();
                    let dt = now.duration_since(last_tick);
                    last_tick = now;
                    self.tick(now, dt).await;
                }
                Step::Shutdown => break,
            }
        }
        info!("server main loop exited");

        // drop remaining clients without waiting for acks
        let now = Instant::now();
        let addrs: Vec<SocketAddr> = self.connections.keys().copied().collect();
        for addr in addrs {
            if let Some(mut conn) = self.connections.remove(&addr) {
                self.handler
                    .disconnect(&mut RemoteClient::new(&mut conn, now));
            }
        }
        self.handler.shutdown();
        Ok(())
    }

    /// Route one inbound datagram by source address.
    async fn route(&mut self, datagram: &[u8], addr: SocketAddr, now: Instant) {
        if self.block_list.contains(&addr.ip()) {
            debug!(%addr, "dropping datagram from blocked address");
            return;
        }
        if datagram.len() < HEADER_SIZE {
            debug!(%addr, len = datagram.len(), "dropping short datagram");
            return;
        }
        let header = match PacketHeader::decode(&datagram[..HEADER_SIZE], Direction::ToServer) {
            Ok(header) => header,
            Err(e) => {
                debug!(%addr, error = %e, "dropping malformed datagram");
                return;
            }
        };

        if self.connections.contains_key(&addr) {
            if let Some(conn) = self.connections.get_mut(&addr) {
                conn.receive(header, datagram, now);
            }
            self.pump_events(addr, now).await;
        } else if self.pending.contains_key(&addr) {
            match header.pkt_type {
                PacketType::ChallengeResp => {
                    if let Some(conn) = self.pending.get_mut(&addr) {
                        conn.receive(header, datagram, now);
                    }
                    self.promote_if_connected(addr, now);
                }
                PacketType::ClientHello => {
                    // a retrying client replaces its half-open handshake
                    debug!(%addr, "client hello repeated, restarting handshake");
                    self.pending.remove(&addr);
                    self.accept(header, datagram, addr, now);
                }
                other => {
                    debug!(%addr, pkt_type = ?other, "dropping packet for pending connection");
                }
            }
        } else if header.pkt_type == PacketType::ClientHello {
            self.accept(header, datagram, addr, now);
        } else {
            debug!(%addr, pkt_type = ?header.pkt_type, "dropping packet from unknown peer");
        }
    }

    /// Admit a new handshake, subject to the flood guards.
    fn accept(&mut self, header: PacketHeader, datagram: &[u8], addr: SocketAddr, now: Instant) {
        // never answer a hello smaller than the reply it elicits
        if datagram.len() < SERVER_HELLO_WIRE_LEN {
            debug!(%addr, len = datagram.len(), "dropping undersized client hello");
            return;
        }
        if self.connections.len() + self.pending.len() >= self.config.server.max_connections {
            warn!(%addr, "connection limit reached, dropping client hello");
            return;
        }
        let pending_from_ip = self
            .pending
            .keys()
            .filter(|peer| peer.ip() == addr.ip())
            .count();
        if pending_from_ip >= self.config.server.max_pending_per_ip {
            warn!(%addr, "too many pending handshakes from address");
            return;
        }

        info!(%addr, "new connection attempt");
        let mut conn = Connection::server(
            addr,
            Arc::clone(&self.root),
            self.config.protocol.clone(),
            now,
        );
        conn.receive(header, datagram, now);
        self.pending.insert(addr, conn);
    }

    /// Move a pending connection into the primary pool once its challenge
    /// response verified.
    fn promote_if_connected(&mut self, addr: SocketAddr, now: Instant) {
        let status = self.pending.get(&addr).map(Connection::status);
        match status {
            Some(ConnectionStatus::Connected) => {
                if let Some(mut conn) = self.pending.remove(&addr) {
                    // consume the Connected event; the handler hears it as connect()
                    while let Some(event) = conn.poll_event() {
                        if matches!(event, ConnectionEvent::Connected) {
                            break;
                        }
                    }
                    info!(%addr, connections = self.connections.len() + 1, "client connected");
                    self.handler
                        .connect(&mut RemoteClient::new(&mut conn, now));
                    self.connections.insert(addr, conn);
                }
            }
            Some(status) if status.is_terminal() => {
                debug!(%addr, %status, "discarding failed handshake");
                self.pending.remove(&addr);
            }
            _ => {}
        }
    }

    /// Drain one established connection's events into the handler.
    async fn pump_events(&mut self, addr: SocketAddr, now: Instant) {
        let mut closed = false;
        if let Some(conn) = self.connections.get_mut(&addr) {
            while let Some(event) = conn.poll_event() {
                match event {
                    ConnectionEvent::Message { msg_seq, payload } => {
                        self.handler.handle_message(
                            &mut RemoteClient::new(conn, now),
                            msg_seq,
                            &payload,
                        );
                    }
                    ConnectionEvent::Disconnected(reason) => {
                        info!(%addr, %reason, "client disconnected");
                        self.handler
                            .disconnect(&mut RemoteClient::new(conn, now));
                        closed = true;
                    }
                    ConnectionEvent::Connected | ConnectionEvent::ConnectFailed(_) => {}
                }
            }
            if closed {
                // a remote-initiated disconnect still owes its final ack
                if let Some(final_ack) = conn.update(now) {
                    if let Err(e) = self.socket.send_to(&final_ack, addr).await {
                        debug!(%addr, error = %e, "final ack send failed");
                    }
                }
            }
        }
        if closed {
            self.connections.remove(&addr);
        }
    }

    /// One protocol tick over every connection.
    async fn tick(&mut self, now: Instant, dt: Duration) {
        self.handler.update(dt);

        let addrs: Vec<SocketAddr> = self.connections.keys().copied().collect();
        for addr in addrs {
            if let Some(conn) = self.connections.get_mut(&addr) {
                if let Some(datagram) = conn.update(now) {
                    if let Err(e) = self.socket.send_to(&datagram, addr).await {
                        warn!(%addr, error = %e, "send failed");
                    }
                }
            }
            self.pump_events(addr, now).await;
            if self
                .connections
                .get(&addr)
                .is_some_and(|c| c.status().is_terminal())
            {
                self.connections.remove(&addr);
            }
        }

        let temp_timeout = self.config.protocol.temp_connection_timeout;
        let addrs: Vec<SocketAddr> = self.pending.keys().copied().collect();
        for addr in addrs {
            let expired = self.pending.get(&addr).map_or(true, |conn| {
                conn.timed_out(temp_timeout, now) || conn.status().is_terminal()
            });
            if expired {
                debug!(%addr, "handshake expired");
                self.pending.remove(&addr);
                continue;
            }
            if let Some(datagram) = self
                .pending
                .get_mut(&addr)
                .and_then(|conn| conn.update(now))
            {
                if let Err(e) = self.socket.send_to(&datagram, addr).await {
                    warn!(%addr, error = %e, "send failed");
                }
            }
        }
    }
}
