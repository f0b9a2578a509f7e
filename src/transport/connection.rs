//! Connection handle for one accepted peer
//!
//! The io pool owns the socket; this handle only carries identity,
//! open/closed state, a close signal and the write channel into the
//! connection's io task. Closing cancels the signal; the io task drops the
//! socket when it observes it.

use crate::infrastructure::metrics::TransportMetrics;
use crate::transport::message::RpcMessage;
use crate::{Result, TransportError};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Next connection ID (process-wide, never reused)
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Allocate a fresh identifier
    #[inline]
    pub fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closed,
}

/// Live connection handle
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    open: AtomicBool,
    close_signal: CancellationToken,
    outbound: mpsc::Sender<RpcMessage>,
    metrics: Arc<TransportMetrics>,
    opened_at: Instant,
}

impl Connection {
    /// Create a handle whose close signal is a child of `parent`:
    /// cancelling the parent (pool shutdown) closes the connection too.
    pub fn new(
        id: ConnectionId,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        outbound: mpsc::Sender<RpcMessage>,
        parent: &CancellationToken,
        metrics: Arc<TransportMetrics>,
    ) -> Self {
        Self {
            id,
            peer_addr,
            local_addr,
            open: AtomicBool::new(true),
            close_signal: parent.child_token(),
            outbound,
            metrics,
            opened_at: Instant::now(),
        }
    }

    #[inline(always)]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Time since accept
    #[inline]
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Current state; a cancelled parent counts as closed
    #[inline]
    pub fn state(&self) -> ConnectionState {
        if self.is_open() {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.close_signal.is_cancelled()
    }

    /// Close the connection.
    ///
    /// Returns `true` for the single call that performed the close; every
    /// later call (from any thread) is a no-op returning `false`. The socket
    /// itself is released asynchronously by the io task.
    pub fn close(&self) -> bool {
        if self.open.swap(false, Ordering::AcqRel) {
            self.close_signal.cancel();
            self.metrics.record_close();
            crate::log_connection!(
                tracing::Level::DEBUG,
                connection = %self.id,
                peer = %self.peer_addr,
                age_ms = self.age().as_millis() as u64,
                "Connection closed"
            );
            true
        } else {
            false
        }
    }

    /// Resolves once the connection is closed (by `close` or pool shutdown)
    pub async fn closed(&self) {
        self.close_signal.cancelled().await
    }

    /// Queue a message on the write channel, waiting for capacity
    pub async fn write(&self, message: RpcMessage) -> Result<()> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_connection(
    parent: &CancellationToken,
) -> (Arc<Connection>, mpsc::Receiver<RpcMessage>) {
    let (tx, rx) = mpsc::channel(8);
    let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
    let connection = Connection::new(
        ConnectionId::next(),
        addr,
        addr,
        tx,
        parent,
        Arc::new(TransportMetrics::new()),
    );
    (Arc::new(connection), rx)
}
