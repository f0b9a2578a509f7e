//! Configuration management for the transport server
//!
//! Loads configuration from config.toml at startup.
//! Every socket option, pool size and timeout is tunable here.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Transport configuration
///
/// Loaded from config.toml at startup. Missing sections and fields fall
/// back to the defaults documented on each field.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Listener, socket and pool settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How the listening address is chosen at start
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BindHost {
    /// Resolve the machine's own hostname and bind to its address
    LocalHost,
    /// Bind to the unspecified IPv4 address (all interfaces)
    Any,
    /// Bind to a fixed address
    Address(IpAddr),
    /// Resolve the given hostname and bind to its address
    Hostname(String),
}

impl Default for BindHost {
    fn default() -> Self {
        BindHost::LocalHost
    }
}

/// What happens to a connection once its idle monitor fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleAction {
    /// Close the connection (dead peer reaping)
    Close,
    /// Only log the idle event
    Log,
}

impl Default for IdleAction {
    fn default() -> Self {
        IdleAction::Close
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Bind address strategy
    #[serde(default)]
    pub host: BindHost,

    /// RPC service port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Accept backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// TCP_NODELAY on accepted sockets
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,

    /// SO_KEEPALIVE on accepted sockets
    #[serde(default = "default_true")]
    pub keepalive: bool,

    /// Seconds without an inbound read before the connection is idle (0 disables)
    #[serde(default = "default_reader_idle_secs")]
    pub reader_idle_secs: u64,

    /// Seconds without an outbound write before the connection is idle (0 disables)
    #[serde(default)]
    pub writer_idle_secs: u64,

    /// Seconds without any traffic before the connection is idle (0 disables)
    #[serde(default)]
    pub all_idle_secs: u64,

    /// Reaction to an idle event
    #[serde(default)]
    pub idle_action: IdleAction,

    /// IO pool threads, 0 = CPU count
    #[serde(default)]
    pub io_threads: usize,

    /// Service-handler pool threads, 0 = 2 x CPU count
    #[serde(default)]
    pub service_threads: usize,

    /// Upper bound on graceful pool termination
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Largest accepted frame, header included
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,

    /// Per-connection inbound/outbound queue depth
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Default filter directive (overridden by RUST_LOG)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for rolling log files; console only when unset
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Write the main log file as JSON lines
    #[serde(default)]
    pub json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: BindHost::default(),
            port: default_port(),
            backlog: default_backlog(),
            tcp_nodelay: true,
            keepalive: true,
            reader_idle_secs: default_reader_idle_secs(),
            writer_idle_secs: 0,
            all_idle_secs: 0,
            idle_action: IdleAction::default(),
            io_threads: 0,
            service_threads: 0,
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            max_frame_length: default_max_frame_length(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
            json: false,
        }
    }
}

fn default_port() -> u16 {
    9998
}

fn default_backlog() -> u32 {
    128
}

fn default_true() -> bool {
    true
}

fn default_reader_idle_secs() -> u64 {
    30
}

fn default_shutdown_timeout_secs() -> u64 {
    15
}

fn default_max_frame_length() -> usize {
    8 * 1024 * 1024
}

fn default_channel_capacity() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ServerConfig {
    /// IO pool size
    pub fn io_pool_threads(&self) -> usize {
        if self.io_threads == 0 {
            num_cpus::get()
        } else {
            self.io_threads
        }
    }

    /// Service-handler pool size
    pub fn service_pool_threads(&self) -> usize {
        if self.service_threads == 0 {
            num_cpus::get() * 2
        } else {
            self.service_threads
        }
    }

    #[inline]
    pub fn reader_idle(&self) -> Duration {
        Duration::from_secs(self.reader_idle_secs)
    }

    #[inline]
    pub fn writer_idle(&self) -> Duration {
        Duration::from_secs(self.writer_idle_secs)
    }

    #[inline]
    pub fn all_idle(&self) -> Duration {
        Duration::from_secs(self.all_idle_secs)
    }

    #[inline]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Config {
    /// Load configuration from config.toml file
    ///
    /// If the file doesn't exist, returns default configuration.
    /// # Errors
    /// Returns error if file exists but cannot be parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => Self::from_toml(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File not found - use defaults
                Ok(Config::default())
            }
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// IO error reading file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// Parse error (invalid TOML)
    #[error("Failed to parse config: {0}")]
    Parse(String),
}
