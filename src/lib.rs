//! TCP transport server for an RPC framework
//!
//! Accepts inbound connections, installs a per-connection pipeline
//! (idle monitor -> framing codec -> request dispatch), tracks live
//! connections and coordinates start/stop across three worker pools.

pub mod infrastructure;
pub mod transport;

// Re-export commonly used types
pub use infrastructure::config::{BindHost, Config, IdleAction, LoggingConfig, ServerConfig};
pub use transport::{
    Connection, ConnectionId, ConnectionRegistry, FramingCodec, MessageType, RequestDispatcher,
    RpcMessage, RpcMessageCodec, RpcServiceConfig, Server, ServerLifecycleState, TransportServer,
};

use std::net::SocketAddr;
use thiserror::Error;

/// Main error type for the transport layer
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Address resolution failed: {0}")]
    AddressResolution(String),

    #[error("Bind to {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create pool '{pool}': {source}")]
    PoolCreation {
        pool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Frame of {length} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { length: usize, max: usize },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, TransportError>;
