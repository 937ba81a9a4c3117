//! Configuration management for Bifrost.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::PacketLimits;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Protocol tuning shared by both endpoint roles.
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Client configuration.
    #[serde(default)]
    pub client: ClientConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("failed to write config: {e}")))?;

        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        self.protocol.validate()?;

        if self.server.max_connections == 0 {
            return Err(Error::InvalidConfig("max_connections must be non-zero".into()));
        }
        if self.server.max_pending_per_ip == 0 {
            return Err(Error::InvalidConfig(
                "max_pending_per_ip must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Protocol timing and sizing options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Maximum transmission unit in bytes. Values above 1500 are likely to
    /// be dropped by the network; decrease on lossy paths.
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// Drop a connection after this much inbound silence.
    #[serde(default = "default_connection_timeout", with = "humantime_serde")]
    pub connection_timeout: Duration,

    /// Discard a handshake that has not completed within this window.
    #[serde(default = "default_temp_connection_timeout", with = "humantime_serde")]
    pub temp_connection_timeout: Duration,

    /// How long an unacked packet waits before its messages time out.
    #[serde(default = "default_message_timeout", with = "humantime_serde")]
    pub message_timeout: Duration,

    /// Idle interval before a keep-alive is emitted. Defaults to half the
    /// message timeout when unset.
    #[serde(default, with = "humantime_serde::option")]
    pub keep_alive_interval: Option<Duration>,

    /// Endpoint tick interval.
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Time allowed for all fragments of a message to arrive.
    #[serde(default = "default_fragment_timeout", with = "humantime_serde")]
    pub fragment_timeout: Duration,

    /// How long a graceful disconnect waits for its ack.
    #[serde(default = "default_disconnect_timeout", with = "humantime_serde")]
    pub disconnect_timeout: Duration,
}

fn default_mtu() -> usize {
    crate::DEFAULT_MTU
}
fn default_connection_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_temp_connection_timeout() -> Duration {
    Duration::from_secs(2)
}
fn default_message_timeout() -> Duration {
    Duration::from_secs(1)
}
fn default_tick_interval() -> Duration {
    Duration::from_secs_f64(1.0 / 60.0)
}
fn default_fragment_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_disconnect_timeout() -> Duration {
    Duration::from_secs(1)
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            connection_timeout: default_connection_timeout(),
            temp_connection_timeout: default_temp_connection_timeout(),
            message_timeout: default_message_timeout(),
            keep_alive_interval: None,
            tick_interval: default_tick_interval(),
            fragment_timeout: default_fragment_timeout(),
            disconnect_timeout: default_disconnect_timeout(),
        }
    }
}

impl ProtocolConfig {
    /// Effective keep-alive interval.
    pub fn keep_alive_interval(&self) -> Duration {
        self.keep_alive_interval
            .unwrap_or(self.message_timeout / 2)
    }

    /// Size arithmetic for the configured MTU.
    pub fn limits(&self) -> PacketLimits {
        PacketLimits::new(self.mtu)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mtu < 576 {
            return Err(Error::InvalidConfig(format!(
                "mtu {} below minimum of 576",
                self.mtu
            )));
        }
        if self.mtu > 65507 {
            return Err(Error::InvalidConfig(format!(
                "mtu {} exceeds maximum datagram size",
                self.mtu
            )));
        }
        if self.message_timeout.is_zero() || self.connection_timeout.is_zero() {
            return Err(Error::InvalidConfig("timeouts must be non-zero".into()));
        }
        if self.tick_interval.is_zero() {
            return Err(Error::InvalidConfig("tick_interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Maximum concurrent connections, pending handshakes included.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Cap on in-progress handshakes per source IP (handshake flood guard).
    #[serde(default = "default_max_pending_per_ip")]
    pub max_pending_per_ip: usize,

    /// IP addresses whose datagrams are dropped before processing.
    #[serde(default)]
    pub block_list: HashSet<IpAddr>,

    /// Path to the PEM-encoded (PKCS#8) root signing key. A transient key
    /// is generated when unset, which no client will trust across restarts.
    pub root_key: Option<PathBuf>,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], crate::DEFAULT_PORT))
}
fn default_max_connections() -> usize {
    1024
}
fn default_max_pending_per_ip() -> usize {
    8
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
            max_pending_per_ip: default_max_pending_per_ip(),
            block_list: HashSet::new(),
            root_key: None,
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address to connect to.
    pub server_addr: Option<SocketAddr>,

    /// Path to the pinned server root public key (SubjectPublicKeyInfo PEM).
    pub server_public_key: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.protocol.mtu, 1500);
        assert_eq!(config.protocol.connection_timeout, Duration::from_secs(5));
        assert_eq!(
            config.protocol.keep_alive_interval(),
            Duration::from_millis(500)
        );
        assert_eq!(config.server.listen_addr.port(), crate::DEFAULT_PORT);
        config.validate().unwrap();
    }

    #[test]
    fn test_keep_alive_override() {
        let mut config = ProtocolConfig::default();
        config.keep_alive_interval = Some(Duration::from_millis(100));
        assert_eq!(config.keep_alive_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_validate_rejects_tiny_mtu() {
        let mut config = Config::default();
        config.protocol.mtu = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let toml = r#"
            [protocol]
            mtu = 1400
            connection_timeout = "3s"
            keep_alive_interval = "250ms"

            [server]
            listen_addr = "127.0.0.1:9000"
            max_connections = 64
            block_list = ["10.0.0.5"]

            [client]
            server_addr = "127.0.0.1:9000"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.protocol.mtu, 1400);
        assert_eq!(config.protocol.connection_timeout, Duration::from_secs(3));
        assert_eq!(
            config.protocol.keep_alive_interval(),
            Duration::from_millis(250)
        );
        assert_eq!(config.server.max_connections, 64);
        assert!(config
            .server
            .block_list
            .contains(&"10.0.0.5".parse::<IpAddr>().unwrap()));
        assert_eq!(
            config.client.server_addr,
            Some("127.0.0.1:9000".parse().unwrap())
        );

        let rendered = toml::to_string_pretty(&config).unwrap();
        let reparsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(reparsed.protocol.mtu, 1400);
    }
}
