//! TOML-based configuration for the signal server.
//!
//! Every field has a serde default, so the server runs without any config
//! file and an older file missing newer fields still loads.  Example:
//!
//! ```toml
//! [server]
//! bind_address = "0.0.0.0"
//! port = 19100
//!
//! [link]
//! read_timeout_ms = 2000
//! keepalive_interval_ms = 10000
//! ```
//!
//! The `[link]` table holds the timing and size bounds of the send/ack
//! discipline.  The defaults match what the signal firmware expects and
//! should rarely need changing.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::transact::AckLimits;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configured bind address is not an IP address.
    #[error("invalid bind address: '{0}'")]
    InvalidBindAddress(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ListenConfig,
    #[serde(default)]
    pub link: LinkConfig,
}

/// Where the server listens for the signal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenConfig {
    /// IP address to bind the listening socket to.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// TCP port the signal connects to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// `tracing` level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Bounds of the send/ack discipline and the recovery timers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkConfig {
    /// Maximum number of messages queued while the signal is connected.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Size of each read while waiting for an ack.
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,
    /// Most bytes accepted as a response before giving up on the read.
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
    /// Longest a single read may block while waiting for an ack.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Longest the session loop sleeps between flush cycles without a wake.
    #[serde(default = "default_idle_wake_ms")]
    pub idle_wake_ms: u64,
    /// Delay before retrying after the listening socket failed to bind.
    #[serde(default = "default_rebind_delay_ms")]
    pub rebind_delay_ms: u64,
    /// Interval between keep-alive pings while the signal is connected.
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    19100
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_queue_capacity() -> usize {
    5
}
fn default_read_chunk_bytes() -> usize {
    16
}
fn default_max_response_bytes() -> usize {
    64
}
fn default_read_timeout_ms() -> u64 {
    2000
}
fn default_idle_wake_ms() -> u64 {
    60_000
}
fn default_rebind_delay_ms() -> u64 {
    5000
}
fn default_keepalive_interval_ms() -> u64 {
    10_000
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            log_level: default_log_level(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            read_chunk_bytes: default_read_chunk_bytes(),
            max_response_bytes: default_max_response_bytes(),
            read_timeout_ms: default_read_timeout_ms(),
            idle_wake_ms: default_idle_wake_ms(),
            rebind_delay_ms: default_rebind_delay_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
        }
    }
}

impl ServerConfig {
    /// Socket address the listener binds to.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBindAddress`] if `server.bind_address`
    /// is not an IP address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .server
            .bind_address
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(self.server.bind_address.clone()))?;
        Ok(SocketAddr::new(ip, self.server.port))
    }
}

impl LinkConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn idle_wake(&self) -> Duration {
        Duration::from_millis(self.idle_wake_ms)
    }

    pub fn rebind_delay(&self) -> Duration {
        Duration::from_millis(self.rebind_delay_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}

impl From<&LinkConfig> for AckLimits {
    fn from(link: &LinkConfig) -> Self {
        Self {
            read_chunk: link.read_chunk_bytes,
            max_response: link.max_response_bytes,
            read_timeout: link.read_timeout(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Loads `ServerConfig` from `path`, returning defaults if the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_config(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Parses `ServerConfig` from TOML text.
///
/// # Errors
///
/// Returns [`ConfigError::Parse`] if the TOML is malformed.
pub fn parse_config(content: &str) -> Result<ServerConfig, ConfigError> {
    Ok(toml::from_str(content)?)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
