use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SessionError};
use crate::timeouts::TimeoutConfig;

/// On-disk configuration shared by both binaries, loaded from TOML.
/// Durations are given in milliseconds. `listen_on` is always a local TCP
/// bind address. `tunnel_to` is a URI whose scheme varies by side: the
/// listener dials it as a WebSocket URL (`tunnel_to_ws`), the server parses
/// it as a plain TCP target address (`tunnel_to_addr`) to auto-connect to.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listen_on: SocketAddr,
    pub tunnel_to: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    #[serde(default)]
    pub log_path: Option<String>,
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_send_timeout_ms() -> u64 {
    30_000
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_linger_ms() -> u64 {
    500
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|err| SessionError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err)))
    }

    pub fn timeout_config(&self) -> TimeoutConfig {
        TimeoutConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            linger_delay: Duration::from_millis(self.linger_ms),
        }
    }

    /// `tunnel_to` as a WebSocket URL, for the listener side's outbound dial.
    pub fn tunnel_to_ws(&self) -> &str {
        &self.tunnel_to
    }

    /// `tunnel_to` as a plain TCP target, for the server side's auto-connect
    /// map. Accepts a bare `host:port` or a `tcp://host:port` URI.
    pub fn tunnel_to_addr(&self) -> Result<SocketAddr> {
        let addr = self.tunnel_to.strip_prefix("tcp://").unwrap_or(&self.tunnel_to);
        addr.parse()
            .map_err(|_| SessionError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, "tunnel_to is not a valid TCP address")))
    }
}
