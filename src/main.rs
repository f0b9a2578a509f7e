//! RPC transport server
//!
//! Loads `config.toml` (or `$CONFIG_PATH`), starts the transport server with
//! an echo dispatcher and runs until Ctrl-C.

use anyhow::{bail, Context};
use rpc_transport::infrastructure::logging::init_logging;
use rpc_transport::transport::EchoDispatcher;
use rpc_transport::{Config, ServerLifecycleState, TransportServer};
use std::time::Duration;

fn main() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    let _guards = init_logging(&config.logging).context("failed to initialize logging")?;

    let shutdown_timeout = config.server.shutdown_timeout();
    let server = TransportServer::new(config.server, EchoDispatcher);

    if !server.start() {
        bail!("transport server failed to start");
    }
    if server.state() != ServerLifecycleState::Running {
        // Address resolution failed; start() already logged why
        bail!("transport server is not listening");
    }
    if let Some(addr) = server.local_addr() {
        tracing::info!(%addr, "Accepting connections, press Ctrl-C to stop");
    }

    wait_for_shutdown_signal()?;
    tracing::info!("Shutdown signal received");

    server.stop();
    if !server.await_termination(shutdown_timeout + Duration::from_secs(1)) {
        tracing::warn!("Worker pools did not terminate in time");
    }

    let snapshot = server.metrics().snapshot();
    tracing::info!(
        accepted = snapshot.connections_accepted,
        dispatched = snapshot.requests_dispatched,
        uptime_seconds = snapshot.uptime_seconds,
        "Server exited"
    );
    Ok(())
}

/// Block until Ctrl-C on a throwaway single-thread runtime
fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for Ctrl-C")?;
    Ok(())
}
