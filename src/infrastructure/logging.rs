//! Centralized logging
//!
//! Console output always; with a configured directory also daily-rolling files:
//! - <dir>/main  - all events (plain or JSON lines)
//! - <dir>/error - WARN and ERROR only
//!
//! Thread names are printed so it is visible which pool
//! (acceptor / io-worker / service-handler-group) produced an event.

use crate::infrastructure::config::LoggingConfig;
use std::fs;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Initialize logging
///
/// Returns the WorkerGuards of the file appenders; they must be kept alive
/// for the duration of the program or buffered lines are lost.
pub fn init_logging(config: &LoggingConfig) -> io::Result<Vec<WorkerGuard>> {
    let mut guards = Vec::new();
    let mut layers: Vec<BoxedLayer> = Vec::new();

    // Console layer
    layers.push(
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_thread_names(true)
            .boxed(),
    );

    if let Some(dir) = &config.directory {
        let (main_appender, main_guard) = create_appender(dir, "main")?;
        guards.push(main_guard);
        let (error_appender, error_guard) = create_appender(dir, "error")?;
        guards.push(error_guard);

        let main_layer = tracing_subscriber::fmt::layer()
            .with_writer(main_appender)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true);
        if config.json {
            layers.push(main_layer.json().boxed());
        } else {
            layers.push(main_layer.boxed());
        }

        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(error_appender)
                .with_ansi(false)
                .with_target(true)
                .with_filter(tracing_subscriber::filter::LevelFilter::WARN)
                .boxed(),
        );
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e.to_string()))?;

    tracing::info!(
        directory = ?config.directory,
        "Logging system initialized"
    );

    Ok(guards)
}

/// Create a daily rolling file appender under `dir/name`
fn create_appender(dir: &Path, name: &str) -> io::Result<(NonBlocking, WorkerGuard)> {
    let dir = dir.join(name);
    fs::create_dir_all(&dir)?;

    let appender = RollingFileAppender::new(Rotation::DAILY, dir, name);
    Ok(tracing_appender::non_blocking(appender))
}

/// Log macro helpers for the transport targets
#[macro_export]
macro_rules! log_transport {
    ($level:expr, $($arg:tt)+) => {
        tracing::event!(target: "transport", $level, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_connection {
    ($level:expr, $($arg:tt)+) => {
        tracing::event!(target: "connection", $level, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_dispatch {
    ($level:expr, $($arg:tt)+) => {
        tracing::event!(target: "dispatch", $level, $($arg)+)
    };
}
