//! Per-connection pipeline
//!
//! A pipeline is an ordered list of stage descriptors, fixed when the
//! connection is accepted:
//!
//! ```text
//! idle-monitor (io) -> encoder (io) -> decoder (io) -> service-handler (service pool)
//! ```
//!
//! The io stages of a connection run in one task on the io pool, so reads,
//! idle checks and writes for that connection are never concurrent. Decoded
//! requests cross to the service-handler pool through a bounded queue and
//! replies come back through the connection's write channel, both FIFO.

use crate::infrastructure::config::{IdleAction, ServerConfig};
use crate::infrastructure::metrics::TransportMetrics;
use crate::infrastructure::pool::{PoolHandle, PoolKind};
use crate::transport::codec::FramingCodec;
use crate::transport::connection::{Connection, ConnectionId};
use crate::transport::dispatch::{RequestDispatcher, ServiceHandler};
use crate::transport::idle::{IdleConfig, IdleMonitor};
use crate::transport::message::RpcMessage;
use crate::transport::registry::ConnectionRegistry;
use crate::{Result, TransportError};
use futures_util::{SinkExt, StreamExt};
use socket2::SockRef;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Kind of pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    IdleMonitor,
    Encoder,
    Decoder,
    ServiceHandler,
}

/// One stage: what it is and which pool executes it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDescriptor {
    pub name: &'static str,
    pub kind: StageKind,
    pub executor: PoolKind,
}

/// Ordered stage list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineLayout {
    stages: Vec<StageDescriptor>,
}

impl PipelineLayout {
    /// idle monitor -> encoder -> decoder -> service handler
    pub fn standard() -> Self {
        Self {
            stages: vec![
                StageDescriptor {
                    name: "idle-monitor",
                    kind: StageKind::IdleMonitor,
                    executor: PoolKind::Io,
                },
                StageDescriptor {
                    name: "encoder",
                    kind: StageKind::Encoder,
                    executor: PoolKind::Io,
                },
                StageDescriptor {
                    name: "decoder",
                    kind: StageKind::Decoder,
                    executor: PoolKind::Io,
                },
                StageDescriptor {
                    name: "service-handler",
                    kind: StageKind::ServiceHandler,
                    executor: PoolKind::ServiceHandler,
                },
            ],
        }
    }

    /// Standard layout without the idle monitor
    pub fn without_idle_monitor() -> Self {
        let mut layout = Self::standard();
        layout.stages.retain(|stage| stage.kind != StageKind::IdleMonitor);
        layout
    }

    pub fn from_stages(stages: Vec<StageDescriptor>) -> Result<Self> {
        let layout = Self { stages };
        layout.validate()?;
        Ok(layout)
    }

    #[inline]
    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    pub fn contains(&self, kind: StageKind) -> bool {
        self.stages.iter().any(|stage| stage.kind == kind)
    }

    pub fn executor_of(&self, kind: StageKind) -> Option<PoolKind> {
        self.stages
            .iter()
            .find(|stage| stage.kind == kind)
            .map(|stage| stage.executor)
    }

    /// Codec stages and the service handler are mandatory and unique; the
    /// handler must come after the decoder and never run on io or acceptor
    /// threads; io stages must stay on the io pool.
    pub fn validate(&self) -> Result<()> {
        for kind in [StageKind::Encoder, StageKind::Decoder, StageKind::ServiceHandler] {
            let count = self.stages.iter().filter(|stage| stage.kind == kind).count();
            if count != 1 {
                return Err(TransportError::Config(format!(
                    "pipeline needs exactly one {:?} stage, found {}",
                    kind, count
                )));
            }
        }
        if self.stages.iter().filter(|s| s.kind == StageKind::IdleMonitor).count() > 1 {
            return Err(TransportError::Config(
                "pipeline has more than one idle monitor".to_string(),
            ));
        }

        let position = |kind| self.stages.iter().position(|stage| stage.kind == kind);
        if position(StageKind::ServiceHandler) < position(StageKind::Decoder) {
            return Err(TransportError::Config(
                "service handler must follow the decoder".to_string(),
            ));
        }

        for stage in &self.stages {
            let expected = match stage.kind {
                StageKind::ServiceHandler => PoolKind::ServiceHandler,
                _ => PoolKind::Io,
            };
            if stage.executor != expected {
                return Err(TransportError::Config(format!(
                    "stage '{}' must run on the {} pool",
                    stage.name,
                    expected.name()
                )));
            }
        }
        Ok(())
    }
}

impl Default for PipelineLayout {
    fn default() -> Self {
        Self::standard()
    }
}

/// Socket options applied to every accepted socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    pub tcp_nodelay: bool,
    pub keepalive: bool,
}

impl SocketOptions {
    pub fn apply(&self, stream: &std::net::TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.tcp_nodelay)?;
        SockRef::from(stream).set_keepalive(self.keepalive)?;
        Ok(())
    }
}

/// Installs the pipeline on accepted connections
#[derive(Clone)]
pub struct PipelineFactory<C: FramingCodec> {
    layout: Arc<PipelineLayout>,
    codec: C,
    idle: IdleConfig,
    idle_action: IdleAction,
    socket: SocketOptions,
    channel_capacity: usize,
    dispatcher: Arc<dyn RequestDispatcher>,
    /// Caps concurrent dispatches at the service-handler pool size
    dispatch_permits: Arc<Semaphore>,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<TransportMetrics>,
    io: PoolHandle,
    service: PoolHandle,
}

impl<C: FramingCodec> PipelineFactory<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        layout: PipelineLayout,
        config: &ServerConfig,
        codec: C,
        dispatcher: Arc<dyn RequestDispatcher>,
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<TransportMetrics>,
        io: PoolHandle,
        service: PoolHandle,
    ) -> Result<Self> {
        layout.validate()?;
        let idle = if layout.contains(StageKind::IdleMonitor) {
            IdleConfig::from_server_config(config)
        } else {
            IdleConfig::reader_only(std::time::Duration::ZERO)
        };

        Ok(Self {
            layout: Arc::new(layout),
            codec,
            idle,
            idle_action: config.idle_action,
            socket: SocketOptions {
                tcp_nodelay: config.tcp_nodelay,
                keepalive: config.keepalive,
            },
            channel_capacity: config.channel_capacity.max(1),
            dispatcher,
            dispatch_permits: Arc::new(Semaphore::new(config.service_pool_threads())),
            registry,
            metrics,
            io,
            service,
        })
    }

    #[inline]
    pub fn layout(&self) -> &PipelineLayout {
        &self.layout
    }

    /// Install on an accepted TCP socket.
    ///
    /// The socket is moved onto the io pool's reactor; the connection is
    /// registered before this returns.
    pub fn install_tcp(
        &self,
        stream: std::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<Arc<Connection>> {
        self.socket.apply(&stream)?;
        let local_addr = stream.local_addr()?;
        Ok(self.attach(peer_addr, local_addr, move || {
            tokio::net::TcpStream::from_std(stream)
        }))
    }

    /// Install on any byte stream (in-memory pipes in tests, tunnels, ...)
    pub fn install<S>(&self, stream: S, peer_addr: SocketAddr, local_addr: SocketAddr) -> Arc<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.attach(peer_addr, local_addr, move || Ok(stream))
    }

    fn attach<S, F>(&self, peer_addr: SocketAddr, local_addr: SocketAddr, open: F) -> Arc<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        F: FnOnce() -> io::Result<S> + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(self.channel_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.channel_capacity);

        let connection = Arc::new(Connection::new(
            ConnectionId::next(),
            peer_addr,
            local_addr,
            outbound_tx,
            self.io.shutdown_token(),
            Arc::clone(&self.metrics),
        ));

        // Registered before any byte is processed so a concurrent stop sees it
        self.registry.put(connection.id(), Arc::clone(&connection));
        self.metrics.record_accept();
        crate::log_connection!(
            tracing::Level::DEBUG,
            connection = %connection.id(),
            peer = %peer_addr,
            "Connection accepted"
        );

        let handler = ServiceHandler::new(
            Arc::clone(&connection),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.dispatch_permits),
            Arc::clone(&self.metrics),
        );
        self.executor(StageKind::ServiceHandler)
            .spawn(handler.run(inbound_rx));

        let driver = ConnectionDriver {
            connection: Arc::clone(&connection),
            codec: self.codec.clone(),
            idle: self.idle,
            idle_action: self.idle_action,
            registry: Arc::clone(&self.registry),
            metrics: Arc::clone(&self.metrics),
        };
        self.executor(StageKind::Decoder).spawn(async move {
            match open() {
                Ok(stream) => driver.run(stream, inbound_tx, outbound_rx).await,
                Err(e) => {
                    crate::log_connection!(
                        tracing::Level::WARN,
                        connection = %driver.connection.id(),
                        error = %e,
                        "Failed to attach socket to io pool"
                    );
                    driver.finish();
                }
            }
        });

        connection
    }

    fn executor(&self, kind: StageKind) -> &PoolHandle {
        match self.layout.executor_of(kind) {
            Some(PoolKind::ServiceHandler) => &self.service,
            _ => &self.io,
        }
    }
}

/// Io side of one connection
struct ConnectionDriver<C> {
    connection: Arc<Connection>,
    codec: C,
    idle: IdleConfig,
    idle_action: IdleAction,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<TransportMetrics>,
}

impl<C: FramingCodec> ConnectionDriver<C> {
    async fn run<S>(
        &self,
        stream: S,
        inbound: mpsc::Sender<RpcMessage>,
        mut outbound: mpsc::Receiver<RpcMessage>,
    ) where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let read_seen = Arc::new(AtomicBool::new(false));
        let mut reader = FramedRead::new(
            ReadActivity {
                inner: read_half,
                seen: Arc::clone(&read_seen),
            },
            self.codec.clone(),
        );
        let mut writer = FramedWrite::new(write_half, self.codec.clone());
        let mut monitor = IdleMonitor::new(self.idle, Instant::now());
        // Decoded frame waiting for room in the service queue
        let mut pending: Option<RpcMessage> = None;
        let id = self.connection.id();

        loop {
            let idle_deadline = monitor.next_deadline();

            tokio::select! {
                biased;

                _ = self.connection.closed() => break,

                _ = idle_timer(idle_deadline) => {
                    let now = Instant::now();
                    // Partial frame bytes count as traffic. A frame parked on a
                    // full service queue does too: reading is paused by our own
                    // backpressure, not by the peer going quiet.
                    if read_seen.swap(false, Ordering::AcqRel) || pending.is_some() {
                        monitor.record_read(now);
                        continue;
                    }
                    if let Some(event) = monitor.poll(now) {
                        self.metrics.record_idle_event();
                        crate::log_connection!(
                            tracing::Level::INFO,
                            connection = %id,
                            kind = ?event.kind,
                            first = event.first,
                            "Idle connection detected"
                        );
                        if self.idle_action == IdleAction::Close {
                            break;
                        }
                    }
                }

                Some(message) = outbound.recv() => {
                    if let Err(e) = writer.send(message).await {
                        crate::log_connection!(
                            tracing::Level::WARN,
                            connection = %id,
                            error = %e,
                            "Write failed"
                        );
                        break;
                    }
                    self.metrics.record_response_written();
                    monitor.record_write(Instant::now());
                }

                permit = inbound.reserve(), if pending.is_some() => {
                    match (permit, pending.take()) {
                        (Ok(permit), Some(message)) => permit.send(message),
                        // Service handler is gone
                        _ => break,
                    }
                }

                frame = reader.next(), if pending.is_none() => {
                    read_seen.store(false, Ordering::Release);
                    monitor.record_read(Instant::now());
                    match frame {
                        Some(Ok(message)) => {
                            self.metrics.record_frame_decoded();
                            pending = Some(message);
                        }
                        Some(Err(e)) => {
                            self.metrics.record_decode_error();
                            crate::log_connection!(
                                tracing::Level::WARN,
                                connection = %id,
                                error = %e,
                                "Decode failed, closing connection"
                            );
                            break;
                        }
                        None => {
                            crate::log_connection!(
                                tracing::Level::DEBUG,
                                connection = %id,
                                "Peer closed connection"
                            );
                            break;
                        }
                    }
                }
            }
        }

        // Service handler finishes what it already holds, then exits
        drop(inbound);
        self.finish();
    }

    fn finish(&self) {
        self.connection.close();
        self.registry.remove_entry(&self.connection);
    }
}

async fn idle_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Read half that flags every successful non-empty read
struct ReadActivity<R> {
    inner: R,
    seen: Arc<AtomicBool>,
}

impl<R: AsyncRead + Unpin> AsyncRead for ReadActivity<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            self.seen.store(true, Ordering::Release);
        }
        poll
    }
}
