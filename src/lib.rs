//! # Bifrost
//!
//! Secure connection-oriented datagram transport for real-time multiplayer games.
//!
//! Bifrost layers an authenticated, encrypted connection protocol on top of
//! plain UDP: a three-way ECDH handshake signed by a pre-shared server root
//! key, per-packet AES-256-GCM, sequence-number windowing with bitfield
//! acknowledgement, message fragmentation and reassembly, per-message retry
//! policies, duplicate suppression, and per-connection telemetry.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Application (EventHandler)                  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │            Endpoints (UdpServer multiplexer / UdpClient)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │        Connection state machine (handshake, acks, retry)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │     Packet / header codec, fragmentation, AES-GCM sealing       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                        UDP datagram socket                      │
//! └─────────────────────────────────────────────────────────────────┘

#![warn(clippy::all, clippy::pedantic)]
// Allow stylistic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)] // Intentional for wire-width fields
#![allow(clippy::cast_sign_loss)]           // Intentional for sequence arithmetic
#![allow(clippy::cast_precision_loss)]      // Acceptable for stats
#![allow(clippy::cast_possible_wrap)]       // Intentional for sequence arithmetic
#![allow(clippy::cognitive_complexity)]     // Complex state machines
#![allow(clippy::too_many_lines)]           // Complete implementations

pub mod config;
pub mod connection;
pub mod crypto;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version carried in CLIENT_HELLO for wire compatibility
pub const PROTOCOL_VERSION: u32 = 1;

/// Default maximum transmission unit for datagrams
pub const DEFAULT_MTU: usize = 1500;

/// Default port for Bifrost servers
pub const DEFAULT_PORT: u16 = 1474;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{Config, ProtocolConfig};
    pub use crate::connection::{Connection, ConnectionEvent, Role};
    pub use crate::crypto::{KeyPair, PublicKey, RootKeyPair, RootPublicKey};
    pub use crate::endpoint::{EventHandler, RemoteClient, UdpClient, UdpServer};
    pub use crate::error::{Error, Result};
    pub use crate::metrics::ConnectionStats;
    pub use crate::protocol::{PacketHeader, PacketType, SeqNum};
    pub use crate::types::*;
}
