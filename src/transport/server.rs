//! Transport server lifecycle
//!
//! [`TransportServer`] owns the three worker pools of a run, the listening
//! socket and the connection registry, and makes `start`/`stop` idempotent
//! under concurrent callers.
//!
//! # Start
//! 1. Create fresh acceptor / io / service-handler pools
//! 2. Resolve the bind address and bind the listener (blocking)
//! 3. Spawn the accept loop on the acceptor pool
//!
//! # Stop
//! 1. Signal every pool (the accept loop exits and drops the listener)
//! 2. Hand the pools to a terminator thread that drains and releases them
//! 3. Close every registered connection
//! 4. Mark the server stopped
//!
//! Address resolution failure is reported as success by [`TransportServer::start`]
//! while the server stays stopped with no listener. Callers that need to see
//! it should use [`TransportServer::try_start`].

use crate::infrastructure::config::{BindHost, ServerConfig};
use crate::infrastructure::metrics::TransportMetrics;
use crate::infrastructure::pool::{PoolKind, PoolSet};
use crate::transport::codec::{FramingCodec, RpcMessageCodec};
use crate::transport::dispatch::{RequestDispatcher, RpcServiceConfig};
use crate::transport::pipeline::{PipelineFactory, PipelineLayout};
use crate::transport::registry::ConnectionRegistry;
use crate::{Result, TransportError};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Externally observable lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerLifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Public server contract
pub trait Server {
    /// Start accepting connections; `true` when running (or already running)
    fn start_server(&self) -> bool;

    /// Stop and release everything; `true` when stopped (or already stopped)
    fn stop_server(&self) -> bool;

    /// Register a service at runtime (not supported)
    fn add_service(&self, service: &RpcServiceConfig) -> bool;

    /// Unregister a service at runtime (not supported)
    fn remove_service(&self, service: &RpcServiceConfig) -> bool;

    /// Process a request outside the pipeline (not supported)
    fn process_request(&self) -> bool;
}

/// Resources of one run, created by start and consumed by stop
struct Running {
    pools: PoolSet,
    local_addr: SocketAddr,
    listener: JoinHandle<io::Result<()>>,
}

struct Lifecycle {
    state: ServerLifecycleState,
    running: Option<Running>,
}

/// TCP transport server
pub struct TransportServer<C: FramingCodec = RpcMessageCodec> {
    config: ServerConfig,
    codec: C,
    layout: PipelineLayout,
    dispatcher: Arc<dyn RequestDispatcher>,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<TransportMetrics>,
    lifecycle: Mutex<Lifecycle>,
    /// Pool terminators of previous runs
    terminators: Mutex<Vec<thread::JoinHandle<bool>>>,
}

impl TransportServer<RpcMessageCodec> {
    /// Server using the default frame codec
    pub fn new<D: RequestDispatcher>(config: ServerConfig, dispatcher: D) -> Self {
        let codec = RpcMessageCodec::with_max_frame_length(config.max_frame_length);
        Self::with_codec(config, codec, dispatcher)
    }
}

impl<C: FramingCodec> TransportServer<C> {
    /// Server using a custom frame codec
    pub fn with_codec<D: RequestDispatcher>(config: ServerConfig, codec: C, dispatcher: D) -> Self {
        Self {
            config,
            codec,
            layout: PipelineLayout::standard(),
            dispatcher: Arc::new(dispatcher),
            registry: Arc::new(ConnectionRegistry::new()),
            metrics: Arc::new(TransportMetrics::new()),
            lifecycle: Mutex::new(Lifecycle {
                state: ServerLifecycleState::Stopped,
                running: None,
            }),
            terminators: Mutex::new(Vec::new()),
        }
    }

    /// Replace the per-connection pipeline layout
    pub fn with_pipeline(mut self, layout: PipelineLayout) -> Result<Self> {
        layout.validate()?;
        self.layout = layout;
        Ok(self)
    }

    /// Start the server.
    ///
    /// Returns `true` once the listener is bound and accepting, or if the
    /// server was already running. Returns `false` if pools could not be
    /// created or the bind failed.
    ///
    /// NOTE: a failed bind-address resolution is logged and still reported
    /// as `true`, with the server left stopped and not listening. Check
    /// [`state`](Self::state) or use [`try_start`](Self::try_start).
    pub fn start(&self) -> bool {
        match self.try_start() {
            Ok(()) => true,
            Err(TransportError::AddressResolution(reason)) => {
                crate::log_transport!(
                    tracing::Level::ERROR,
                    reason = %reason,
                    "Bind address resolution failed, server is not listening"
                );
                true
            }
            Err(e) => {
                crate::log_transport!(tracing::Level::ERROR, error = %e, "Server start failed");
                false
            }
        }
    }

    /// Start the server, reporting every failure
    pub fn try_start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == ServerLifecycleState::Running {
            return Ok(());
        }

        lifecycle.state = ServerLifecycleState::Starting;
        match self.launch() {
            Ok(running) => {
                crate::log_transport!(
                    tracing::Level::INFO,
                    addr = %running.local_addr,
                    io_threads = running.pools.io.threads(),
                    service_threads = running.pools.service.threads(),
                    "Transport server started"
                );
                lifecycle.running = Some(running);
                lifecycle.state = ServerLifecycleState::Running;
                Ok(())
            }
            Err(e) => {
                // Pools of the failed attempt were dropped inside launch
                lifecycle.state = ServerLifecycleState::Stopped;
                Err(e)
            }
        }
    }

    fn launch(&self) -> Result<Running> {
        let pools = PoolSet::create(&self.config)?;
        let addr = resolve_bind_address(&self.config.host, self.config.port)?;
        let listener = bind_listener(addr, self.config.backlog)?;
        let local_addr = listener.local_addr()?;

        let factory = PipelineFactory::new(
            self.layout.clone(),
            &self.config,
            self.codec.clone(),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.registry),
            Arc::clone(&self.metrics),
            pools.get(PoolKind::Io).handle().clone(),
            pools.get(PoolKind::ServiceHandler).handle().clone(),
        )?;
        let shutdown = pools.acceptor.handle().shutdown_token().clone();
        let listener = pools
            .acceptor
            .spawn(accept_loop(listener, factory, shutdown));

        Ok(Running {
            pools,
            local_addr,
            listener,
        })
    }

    /// Stop the server.
    ///
    /// Returns once no new connections are handed off and every registered
    /// connection has been told to close. Pool threads are released in the
    /// background, bounded by `shutdown_timeout_secs`.
    pub fn stop(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        let Some(running) = lifecycle.running.take() else {
            lifecycle.state = ServerLifecycleState::Stopped;
            return true;
        };
        lifecycle.state = ServerLifecycleState::Stopping;

        running.pools.signal_shutdown();
        let local_addr = running.local_addr;
        self.spawn_terminator(running);

        let closed = self.registry.close_all();

        lifecycle.state = ServerLifecycleState::Stopped;
        crate::log_transport!(
            tracing::Level::INFO,
            addr = %local_addr,
            closed_connections = closed,
            "Transport server stopped"
        );
        true
    }

    fn spawn_terminator(&self, running: Running) {
        let timeout = self.config.shutdown_timeout();
        let spawned = thread::Builder::new()
            .name("transport-terminator".to_string())
            .spawn(move || terminate(running, timeout));

        match spawned {
            Ok(handle) => self.terminators.lock().push(handle),
            Err(e) => {
                // Running was moved into the failed closure and dropped with it,
                // which abandons the pools without draining them
                crate::log_transport!(
                    tracing::Level::WARN,
                    error = %e,
                    "Could not spawn pool terminator, pools abandoned"
                );
            }
        }
    }

    /// Wait until the pools of every previous run have been released.
    ///
    /// Returns `false` if some are still draining when `timeout` elapses.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut terminators = self.terminators.lock();
                let (finished, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut *terminators)
                    .into_iter()
                    .partition(|handle| handle.is_finished());
                *terminators = pending;

                for handle in finished {
                    if handle.join().is_err() {
                        crate::log_transport!(tracing::Level::WARN, "Pool terminator panicked");
                    }
                }
                if terminators.is_empty() {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[inline]
    pub fn state(&self) -> ServerLifecycleState {
        self.lifecycle.lock().state
    }

    /// Bound listener address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle
            .lock()
            .running
            .as_ref()
            .map(|running| running.local_addr)
    }

    #[inline]
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    #[inline]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    #[inline]
    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.metrics
    }

    #[inline]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

impl<C: FramingCodec> Server for TransportServer<C> {
    fn start_server(&self) -> bool {
        self.start()
    }

    fn stop_server(&self) -> bool {
        self.stop()
    }

    fn add_service(&self, service: &RpcServiceConfig) -> bool {
        crate::log_transport!(
            tracing::Level::DEBUG,
            service = %service.rpc_service_name(),
            "add_service is not supported"
        );
        false
    }

    fn remove_service(&self, service: &RpcServiceConfig) -> bool {
        crate::log_transport!(
            tracing::Level::DEBUG,
            service = %service.rpc_service_name(),
            "remove_service is not supported"
        );
        false
    }

    fn process_request(&self) -> bool {
        crate::log_transport!(tracing::Level::DEBUG, "process_request is not supported");
        false
    }
}

impl<C: FramingCodec> Drop for TransportServer<C> {
    fn drop(&mut self) {
        if self.lifecycle.get_mut().running.is_some() {
            self.stop();
        }
    }
}

/// Drain and release the pools of one run (terminator thread)
fn terminate(running: Running, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let Running {
        pools,
        local_addr,
        listener,
    } = running;

    let outcome = pools
        .acceptor
        .block_on(async move { tokio::time::timeout(timeout, listener).await });
    match outcome {
        Some(Ok(Ok(Ok(())))) => {
            crate::log_transport!(tracing::Level::DEBUG, addr = %local_addr, "Listener closed");
        }
        Some(Ok(Ok(Err(e)))) => {
            crate::log_transport!(
                tracing::Level::WARN,
                addr = %local_addr,
                error = %e,
                "Listener failed"
            );
        }
        Some(Ok(Err(e))) => {
            crate::log_transport!(
                tracing::Level::WARN,
                addr = %local_addr,
                error = %e,
                "Listener task aborted"
            );
        }
        Some(Err(_)) | None => {
            crate::log_transport!(
                tracing::Level::WARN,
                addr = %local_addr,
                "Listener did not close before shutdown timeout"
            );
        }
    }

    pools.terminate(deadline)
}

/// Accept until the acceptor pool is signalled; the listener closes on return
async fn accept_loop<C: FramingCodec>(
    listener: std::net::TcpListener,
    factory: PipelineFactory<C>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let listener = tokio::net::TcpListener::from_std(listener)?;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let installed = stream
                        .into_std()
                        .map_err(TransportError::from)
                        .and_then(|stream| factory.install_tcp(stream, peer_addr));
                    if let Err(e) = installed {
                        crate::log_connection!(
                            tracing::Level::WARN,
                            peer = %peer_addr,
                            error = %e,
                            "Failed to set up accepted connection"
                        );
                    }
                }
                Err(e) => {
                    // Typically fd exhaustion; back off instead of spinning
                    crate::log_transport!(tracing::Level::WARN, error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }

    Ok(())
}

/// Resolve the configured bind host to a socket address
pub fn resolve_bind_address(host: &BindHost, port: u16) -> Result<SocketAddr> {
    match host {
        BindHost::Any => Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))),
        BindHost::Address(ip) => Ok(SocketAddr::new(*ip, port)),
        BindHost::LocalHost => lookup(&local_hostname()?, port),
        BindHost::Hostname(name) => lookup(name, port),
    }
}

/// First IPv4 address of `name`, else its first address
fn lookup(name: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = (name, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::AddressResolution(format!("{}: {}", name, e)))?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| TransportError::AddressResolution(format!("{}: no addresses", name)))
}

#[cfg(unix)]
fn local_hostname() -> Result<String> {
    nix::unistd::gethostname()
        .map_err(|e| TransportError::AddressResolution(format!("hostname lookup failed: {}", e)))?
        .into_string()
        .map_err(|_| TransportError::AddressResolution("hostname is not valid UTF-8".to_string()))
}

#[cfg(not(unix))]
fn local_hostname() -> Result<String> {
    std::env::var("COMPUTERNAME")
        .map_err(|_| TransportError::AddressResolution("hostname lookup failed".to_string()))
}

/// Bound, listening, non-blocking socket
fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<std::net::TcpListener> {
    let bind_error = |source| TransportError::Bind { addr, source };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_error)?;
    socket.set_reuse_address(true).map_err(bind_error)?;
    socket.bind(&addr.into()).map_err(bind_error)?;
    socket
        .listen(i32::try_from(backlog).unwrap_or(i32::MAX))
        .map_err(bind_error)?;
    socket.set_nonblocking(true).map_err(bind_error)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::connection::ConnectionId;
    use crate::transport::dispatch::EchoDispatcher;
    use crate::transport::message::{MessageType, RpcMessage};
    use bytes::{Bytes, BytesMut};
    use std::io::{Read, Write};
    use std::net::{IpAddr, TcpStream};
    use tokio_util::codec::{Decoder, Encoder};

    fn loopback_config() -> ServerConfig {
        ServerConfig {
            host: BindHost::Address(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            port: 0,
            io_threads: 2,
            service_threads: 2,
            shutdown_timeout_secs: 5,
            ..Default::default()
        }
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream
    }

    fn send(stream: &mut TcpStream, message: RpcMessage) {
        let mut buf = BytesMut::new();
        RpcMessageCodec::new().encode(message, &mut buf).unwrap();
        stream.write_all(&buf).unwrap();
    }

    fn receive(stream: &mut TcpStream, buf: &mut BytesMut) -> RpcMessage {
        let mut codec = RpcMessageCodec::new();
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(message) = codec.decode(buf).unwrap() {
                return message;
            }
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "server closed the connection");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// True if the peer closes the stream within the read timeout
    fn closed_by_server(stream: &mut TcpStream) -> bool {
        let mut chunk = [0u8; 64];
        match stream.read(&mut chunk) {
            Ok(0) => true,
            Ok(_) => false,
            Err(e) => e.kind() == io::ErrorKind::ConnectionReset,
        }
    }

    fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let server = TransportServer::new(loopback_config(), EchoDispatcher);
        assert_eq!(server.state(), ServerLifecycleState::Stopped);

        assert!(server.start());
        let first = server.local_addr().unwrap();
        assert!(server.start());
        assert_eq!(server.local_addr(), Some(first));
        assert_eq!(server.state(), ServerLifecycleState::Running);

        assert!(server.stop());
        assert!(server.stop());
        assert_eq!(server.state(), ServerLifecycleState::Stopped);
        assert!(server.local_addr().is_none());
        assert!(server.await_termination(Duration::from_secs(10)));
    }

    #[test]
    fn test_stop_before_start_is_noop() {
        let server = TransportServer::new(loopback_config(), EchoDispatcher);
        assert!(server.stop());
        assert_eq!(server.state(), ServerLifecycleState::Stopped);
        assert!(server.await_termination(Duration::from_millis(10)));
    }

    #[test]
    fn test_concurrent_start_binds_once() {
        let server = Arc::new(TransportServer::new(loopback_config(), EchoDispatcher));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let server = Arc::clone(&server);
                thread::spawn(move || (server.start(), server.local_addr()))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(results.iter().all(|(started, _)| *started));
        let addr = server.local_addr().unwrap();
        assert!(results.iter().all(|(_, seen)| *seen == Some(addr)));

        assert!(server.stop());
        assert!(server.await_termination(Duration::from_secs(10)));
    }

    #[test]
    fn test_restart_creates_fresh_pools() {
        let server = TransportServer::new(loopback_config(), EchoDispatcher);

        assert!(server.start());
        assert!(server.stop());
        assert!(server.start());

        let mut client = connect(server.local_addr().unwrap());
        let mut buf = BytesMut::new();
        send(&mut client, RpcMessage::request(1, "again"));
        assert_eq!(receive(&mut client, &mut buf).body, Bytes::from_static(b"again"));

        assert!(server.stop());
        assert!(server.await_termination(Duration::from_secs(10)));
    }

    #[test]
    fn test_resolution_failure_reports_success_without_listening() {
        let config = ServerConfig {
            host: BindHost::Hostname("nonexistent.invalid".to_string()),
            ..loopback_config()
        };
        let server = TransportServer::new(config, EchoDispatcher);

        assert!(server.start());
        assert_eq!(server.state(), ServerLifecycleState::Stopped);
        assert!(server.local_addr().is_none());

        let err = server.try_start().unwrap_err();
        assert!(matches!(err, TransportError::AddressResolution(_)));
        assert!(server.stop());
    }

    #[test]
    fn test_bind_failure_returns_false() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ServerConfig {
            port: occupied.local_addr().unwrap().port(),
            ..loopback_config()
        };
        let server = TransportServer::new(config, EchoDispatcher);

        assert!(!server.start());
        assert_eq!(server.state(), ServerLifecycleState::Stopped);
        assert!(matches!(
            server.try_start().unwrap_err(),
            TransportError::Bind { .. }
        ));
    }

    #[test]
    fn test_unsupported_operations_report_failure() {
        let server = TransportServer::new(loopback_config(), EchoDispatcher);
        let service = RpcServiceConfig::new("HelloService", "test1", "version1");

        assert!(!server.add_service(&service));
        assert!(!server.remove_service(&service));
        assert!(!server.process_request());
    }

    #[test]
    fn test_server_trait_drives_lifecycle() {
        let server = TransportServer::new(loopback_config(), EchoDispatcher);
        let contract: &dyn Server = &server;

        assert!(contract.start_server());
        assert_eq!(server.state(), ServerLifecycleState::Running);
        assert!(contract.stop_server());
        assert_eq!(server.state(), ServerLifecycleState::Stopped);
        assert!(server.await_termination(Duration::from_secs(10)));
    }

    #[test]
    fn test_resolve_bind_address() {
        let any = resolve_bind_address(&BindHost::Any, 9998).unwrap();
        assert_eq!(any, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9998)));

        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert_eq!(
            resolve_bind_address(&BindHost::Address(ip), 1).unwrap(),
            SocketAddr::new(ip, 1)
        );

        let localhost = resolve_bind_address(&BindHost::Hostname("localhost".into()), 2).unwrap();
        assert!(localhost.ip().is_loopback());
    }

    #[test]
    fn test_end_to_end_request_response() {
        let dispatch_threads = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&dispatch_threads);
        let dispatcher = move |connection: ConnectionId, request: RpcMessage| {
            let thread_name = thread::current().name().unwrap_or_default().to_string();
            seen.lock().push((connection, thread_name));
            Some(request.reply(request.body.clone()))
        };
        let server = TransportServer::new(loopback_config(), dispatcher);
        assert!(server.start());

        let mut client = connect(server.local_addr().unwrap());
        assert!(wait_until(Duration::from_secs(5), || server.connection_count() == 1));

        send(&mut client, RpcMessage::request(1, "one"));
        send(&mut client, RpcMessage::ping(2));
        send(&mut client, RpcMessage::request(3, "three"));

        let mut buf = BytesMut::new();
        let first = receive(&mut client, &mut buf);
        let second = receive(&mut client, &mut buf);
        let third = receive(&mut client, &mut buf);

        assert_eq!(first.message_type, MessageType::Response);
        assert_eq!((first.request_id, first.body), (1, Bytes::from_static(b"one")));
        assert_eq!(second, RpcMessage::pong(2));
        assert_eq!((third.request_id, third.body), (3, Bytes::from_static(b"three")));

        let registered = server.registry().snapshot();
        let calls = dispatch_threads.lock().clone();
        assert_eq!(calls.len(), 2);
        for (connection, thread_name) in calls {
            assert_eq!(connection, registered[0].id());
            assert!(
                thread_name.starts_with("service-handler-group"),
                "dispatched on {thread_name}"
            );
        }

        let snapshot = server.metrics().snapshot();
        assert_eq!(snapshot.requests_dispatched, 2);
        assert_eq!(snapshot.heartbeats_answered, 1);

        assert!(server.stop());
        assert!(closed_by_server(&mut client));
        assert!(server.await_termination(Duration::from_secs(10)));
    }

    #[test]
    fn test_slow_dispatch_does_not_delay_other_connections() {
        let dispatcher = |_: ConnectionId, request: RpcMessage| {
            if request.body.as_ref() == b"slow" {
                thread::sleep(Duration::from_secs(5));
            }
            Some(request.reply(request.body.clone()))
        };
        let server = TransportServer::new(loopback_config(), dispatcher);
        assert!(server.start());
        let addr = server.local_addr().unwrap();

        let mut slow = connect(addr);
        send(&mut slow, RpcMessage::request(1, "slow"));
        thread::sleep(Duration::from_millis(100));

        let mut fast = connect(addr);
        let mut buf = BytesMut::new();
        for id in 0..10 {
            let started = Instant::now();
            send(&mut fast, RpcMessage::request(id, "fast"));
            let reply = receive(&mut fast, &mut buf);
            assert_eq!(reply.request_id, id);
            assert!(
                started.elapsed() < Duration::from_millis(500),
                "round trip took {:?}",
                started.elapsed()
            );
        }

        let mut slow_buf = BytesMut::new();
        let reply = receive(&mut slow, &mut slow_buf);
        assert_eq!(reply.body, Bytes::from_static(b"slow"));

        assert!(server.stop());
        assert!(server.await_termination(Duration::from_secs(10)));
    }

    #[test]
    fn test_dispatch_concurrency_capped_at_service_threads() {
        let running = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let dispatcher = {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            move |_: ConnectionId, request: RpcMessage| {
                use std::sync::atomic::Ordering;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(200));
                running.fetch_sub(1, Ordering::SeqCst);
                Some(request.reply(request.body.clone()))
            }
        };
        let config = ServerConfig {
            service_threads: 1,
            ..loopback_config()
        };
        let server = TransportServer::new(config, dispatcher);
        assert!(server.start());
        let addr = server.local_addr().unwrap();

        let mut clients: Vec<_> = (0..6).map(|_| connect(addr)).collect();
        for (id, client) in clients.iter_mut().enumerate() {
            send(client, RpcMessage::request(id as u32, "work"));
        }
        for (id, client) in clients.iter_mut().enumerate() {
            let mut buf = BytesMut::new();
            assert_eq!(receive(client, &mut buf).request_id, id as u32);
        }

        assert_eq!(peak.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(server.stop());
        assert!(server.await_termination(Duration::from_secs(10)));
    }

    #[test]
    fn test_stop_closes_every_connection() {
        let server = TransportServer::new(loopback_config(), EchoDispatcher);
        assert!(server.start());
        let addr = server.local_addr().unwrap();

        let mut clients: Vec<_> = (0..5).map(|_| connect(addr)).collect();
        assert!(wait_until(Duration::from_secs(5), || server.connection_count() == 5));

        assert!(server.stop());
        for client in &mut clients {
            assert!(closed_by_server(client));
        }
        assert!(wait_until(Duration::from_secs(5), || {
            server.metrics().snapshot().connections_closed == 5
        }));
        assert!(wait_until(Duration::from_secs(5), || server.registry().is_empty()));

        // Listener goes away asynchronously
        assert!(wait_until(Duration::from_secs(5), || TcpStream::connect(addr).is_err()));
        assert!(server.await_termination(Duration::from_secs(10)));
    }

    #[test]
    fn test_drop_stops_running_server() {
        let server = TransportServer::new(loopback_config(), EchoDispatcher);
        assert!(server.start());
        let addr = server.local_addr().unwrap();
        let mut client = connect(addr);
        assert!(wait_until(Duration::from_secs(5), || server.connection_count() == 1));

        drop(server);
        assert!(closed_by_server(&mut client));
    }

    #[test]
    fn test_custom_pipeline_layout_is_validated() {
        let mut stages = PipelineLayout::standard().stages().to_vec();
        stages.reverse();
        let layout = PipelineLayout::from_stages(stages);
        assert!(layout.is_err());

        let server = TransportServer::new(loopback_config(), EchoDispatcher)
            .with_pipeline(PipelineLayout::without_idle_monitor())
            .unwrap();
        assert!(server.start());
        assert!(server.stop());
        assert!(server.await_termination(Duration::from_secs(10)));
    }
}
