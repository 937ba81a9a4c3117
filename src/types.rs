//! Core types used throughout Bifrost.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque 128-bit identifier assigned to a connection during the handshake.
///
/// The token doubles as the handshake challenge: the server mints it in
/// SERVER_HELLO and the client must echo it, encrypted, in CHALLENGE_RESP.
/// Unlike the remote address it is safe to share with other clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionToken(pub Uuid);

impl ConnectionToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for ConnectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Handshake in progress, session key not yet established
    Connecting,
    /// Session key established, traffic allowed
    Connected,
    /// Local teardown initiated, waiting for the DISCONNECT ack
    Disconnecting,
    /// Terminal: closed gracefully
    Disconnected,
    /// Terminal: timed out or failed mid-session
    Dropped,
}

impl ConnectionStatus {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Disconnecting)
    }

    pub fn is_established(self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Dropped)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnecting => write!(f, "disconnecting"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Dropped => write!(f, "dropped"),
        }
    }
}

/// Per-message delivery policy.
///
/// With either retry mode the same message may end up in several datagrams;
/// the receive path detects and drops the duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    /// Send once, no delivery guarantee.
    #[default]
    None,
    /// Resend on each keep-alive interval until acked or the message
    /// timeout elapses. The message may be received even when the timeout
    /// callback still fires.
    BestEffort,
    /// Resend whenever the carrying packet times out, until acked or the
    /// connection closes.
    RetryOnTimeout,
}

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Local `disconnect()` completed
    Local,
    /// Remote sent DISCONNECT
    Remote,
    /// No inbound traffic within the connection timeout
    Timeout,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Why a connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    /// No valid SERVER_HELLO within the connection timeout
    Timeout,
    /// SERVER_HELLO signature did not verify against the pinned root key
    ServerNotAuthenticated,
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::ServerNotAuthenticated => write!(f, "server not authenticated"),
        }
    }
}

/// Callback invoked with `true` when a message is acked, `false` on timeout.
pub type SendCallback = Box<dyn FnOnce(bool) + Send + 'static>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip() {
        let token = ConnectionToken::generate();
        let bytes = *token.as_bytes();
        assert_eq!(ConnectionToken::from_bytes(bytes), token);
    }

    #[test]
    fn test_status_predicates() {
        assert!(ConnectionStatus::Connected.is_established());
        assert!(ConnectionStatus::Connecting.is_active());
        assert!(!ConnectionStatus::Dropped.is_active());
        assert!(ConnectionStatus::Dropped.is_terminal());
        assert!(ConnectionStatus::Disconnected.is_terminal());
        assert!(!ConnectionStatus::Disconnecting.is_terminal());
    }
}
