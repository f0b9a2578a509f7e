//! Infrastructure - cold path only
//!
//! This module contains code that never sits on the per-frame path:
//! - Configuration management
//! - Logging and metrics
//! - Worker pool creation and graceful termination

pub mod config;
pub mod logging;
pub mod metrics;
pub mod pool;

pub use metrics::{MetricsSnapshot, TransportMetrics};
pub use pool::{PoolKind, PoolSet, PoolSpec, ThreadPoolFactory, WorkerPool};
