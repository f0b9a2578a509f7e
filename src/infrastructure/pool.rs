//! Worker pools for the transport server
//!
//! Each pool is a dedicated multi-threaded tokio runtime with named threads,
//! a cancellation token that tells its tasks to stop taking new work, and a
//! task tracker used to drain in-flight work before the runtime is torn down.
//!
//! Three pools make up a [`PoolSet`]:
//! - acceptor (1 thread) - accepts sockets and hands them off
//! - io (CPU count) - socket reads/writes, idle monitoring, framing
//! - service-handler (2 x CPU count) - request dispatch

use crate::infrastructure::config::ServerConfig;
use crate::{Result, TransportError};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Logical role of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Acceptor,
    Io,
    ServiceHandler,
}

impl PoolKind {
    /// Thread name prefix used for the pool
    pub const fn name(&self) -> &'static str {
        match self {
            PoolKind::Acceptor => "acceptor",
            PoolKind::Io => "io-worker",
            PoolKind::ServiceHandler => "service-handler-group",
        }
    }
}

/// Pool creation parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSpec {
    /// Thread name prefix; threads are named `<name>-<n>`
    pub name: String,
    /// Worker thread count (at least 1)
    pub threads: usize,
    /// Daemon pools are abandoned at termination instead of joined
    pub daemon: bool,
}

impl PoolSpec {
    pub fn new(name: impl Into<String>, threads: usize) -> Self {
        Self {
            name: name.into(),
            threads: threads.max(1),
            daemon: false,
        }
    }

    pub fn daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }
}

/// Creates named worker pools
pub struct ThreadPoolFactory;

impl ThreadPoolFactory {
    /// Number of logical CPUs
    #[inline]
    pub fn cpus() -> usize {
        num_cpus::get()
    }

    /// Build a pool from its spec
    pub fn create(spec: PoolSpec) -> Result<WorkerPool> {
        let counter = Arc::new(AtomicUsize::new(0));
        let prefix = spec.name.clone();

        let runtime = Builder::new_multi_thread()
            .worker_threads(spec.threads)
            .thread_name_fn(move || {
                let n = counter.fetch_add(1, Ordering::Relaxed);
                format!("{}-{}", prefix, n)
            })
            .enable_all()
            .build()
            .map_err(|source| TransportError::PoolCreation {
                pool: spec.name.clone(),
                source,
            })?;

        tracing::debug!(
            target: "transport",
            pool = %spec.name,
            threads = spec.threads,
            daemon = spec.daemon,
            "Worker pool created"
        );

        let handle = PoolHandle {
            name: Arc::from(spec.name.as_str()),
            handle: runtime.handle().clone(),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        };

        Ok(WorkerPool {
            runtime: Some(runtime),
            handle,
            threads: spec.threads,
            daemon: spec.daemon,
        })
    }
}

/// Cloneable handle for spawning onto a pool from any thread
#[derive(Clone)]
pub struct PoolHandle {
    name: Arc<str>,
    handle: Handle,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl PoolHandle {
    /// Spawn a tracked task on this pool
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn_on(future, &self.handle)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Token cancelled when the pool is asked to shut down
    #[inline]
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    #[inline]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Number of tracked tasks still alive
    #[inline]
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Handle onto the ambient test runtime
    #[cfg(test)]
    pub(crate) fn current(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            handle: Handle::current(),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }
}

/// A named runtime plus its drain bookkeeping
pub struct WorkerPool {
    runtime: Option<Runtime>,
    handle: PoolHandle,
    threads: usize,
    daemon: bool,
}

impl WorkerPool {
    #[inline]
    pub fn handle(&self) -> &PoolHandle {
        &self.handle
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    #[inline]
    pub fn threads(&self) -> usize {
        self.threads
    }

    #[inline]
    pub fn is_daemon(&self) -> bool {
        self.daemon
    }

    /// Spawn a tracked task on this pool
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Stop taking new work: cancel the token and close the tracker.
    ///
    /// Non-blocking; in-flight tasks keep running until they observe the token.
    pub fn signal_shutdown(&self) {
        self.handle.shutdown.cancel();
        self.handle.tracker.close();
    }

    /// Drive a future to completion on this pool.
    ///
    /// Must not be called from inside an async context.
    pub fn block_on<F: Future>(&self, future: F) -> Option<F::Output> {
        self.runtime.as_ref().map(|rt| rt.block_on(future))
    }

    /// Wait for tracked tasks until `deadline`, then release the threads.
    ///
    /// Returns `true` if every tracked task finished before the deadline.
    /// Must not be called from inside an async context.
    pub fn terminate(mut self, deadline: Instant) -> bool {
        self.signal_shutdown();

        let Some(runtime) = self.runtime.take() else {
            return true;
        };

        let tracker = self.handle.tracker.clone();
        let remaining = deadline.saturating_duration_since(Instant::now());
        let drained = runtime.block_on(async move {
            tokio::time::timeout(remaining, tracker.wait()).await.is_ok()
        });

        if !drained {
            tracing::warn!(
                target: "transport",
                pool = %self.handle.name,
                remaining_tasks = self.handle.active_tasks(),
                "Pool did not drain before shutdown timeout"
            );
        }

        if self.is_daemon() {
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(deadline.saturating_duration_since(Instant::now()));
        }

        tracing::debug!(target: "transport", pool = %self.handle.name, drained, "Worker pool terminated");
        drained
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Dropping a Runtime blocks, which panics inside an async context.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// The three pools owned by one run of the server
pub struct PoolSet {
    pub acceptor: WorkerPool,
    pub io: WorkerPool,
    pub service: WorkerPool,
}

impl PoolSet {
    /// Create a fresh set of pools sized from the config
    pub fn create(config: &ServerConfig) -> Result<Self> {
        let acceptor = ThreadPoolFactory::create(PoolSpec::new(PoolKind::Acceptor.name(), 1))?;
        let io = ThreadPoolFactory::create(PoolSpec::new(
            PoolKind::Io.name(),
            config.io_pool_threads(),
        ))?;
        let service = ThreadPoolFactory::create(PoolSpec::new(
            PoolKind::ServiceHandler.name(),
            config.service_pool_threads(),
        ))?;

        Ok(Self {
            acceptor,
            io,
            service,
        })
    }

    /// Pool by role
    pub fn get(&self, kind: PoolKind) -> &WorkerPool {
        match kind {
            PoolKind::Acceptor => &self.acceptor,
            PoolKind::Io => &self.io,
            PoolKind::ServiceHandler => &self.service,
        }
    }

    /// Signal all pools, acceptor first so no new sockets are handed off
    pub fn signal_shutdown(&self) {
        self.acceptor.signal_shutdown();
        self.io.signal_shutdown();
        self.service.signal_shutdown();
    }

    /// Drain and release all pools. Returns `true` if all drained in time.
    pub fn terminate(self, deadline: Instant) -> bool {
        let PoolSet {
            acceptor,
            io,
            service,
        } = self;

        // Service work feeds io writes, io feeds nothing upstream: drain in that order.
        let service_drained = service.terminate(deadline);
        let io_drained = io.terminate(deadline);
        let acceptor_drained = acceptor.terminate(deadline);
        service_drained && io_drained && acceptor_drained
    }
}
