//! Error types for Bifrost.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for Bifrost operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Bifrost.
#[derive(Error, Debug)]
pub enum Error {
    // Cryptographic errors
    #[error("cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("server not authenticated")]
    ServerNotAuthenticated,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    // Transport errors
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: SocketAddr, reason: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection timeout")]
    ConnectionTimeout,

    // Protocol errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Cryptographic operation errors.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("invalid key encoding: {0}")]
    InvalidKeyEncoding(String),

    #[error("signature verification failed")]
    SignatureVerificationFailed,

    #[error("invalid ciphertext length")]
    InvalidCiphertextLength,
}

/// Transport layer errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("bind failed on {addr}: {reason}")]
    BindFailed { addr: SocketAddr, reason: String },

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("socket error: {0}")]
    SocketError(String),
}

/// Protocol parsing and handling errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid magic number")]
    BadMagic,

    #[error("direction mismatch")]
    DirectionMismatch,

    #[error("invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u32, got: u32 },

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("duplicate packet")]
    DuplicatePacket,

    #[error("stale packet")]
    StalePacket,

    #[error("unknown message tag: {0}")]
    UnknownMessageTag(u16),
}

impl Error {
    /// Check if error is recoverable (should retry).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout
                | Error::Transport(
                    TransportError::SendFailed(_) | TransportError::ReceiveFailed(_)
                )
                | Error::Io(_)
        )
    }
}
