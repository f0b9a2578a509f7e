//! Per-connection idle detection
//!
//! Three independent axes, each disabled when its window is zero:
//! - reader: no inbound read within the window
//! - writer: no outbound write within the window
//! - all: neither within the window
//!
//! The monitor is a plain state machine driven with explicit instants; the
//! connection's io task sleeps until [`IdleMonitor::next_deadline`] and then
//! calls [`IdleMonitor::poll`]. It only raises events, the reaction is up to
//! the pipeline.

use crate::infrastructure::config::ServerConfig;
use std::time::Duration;
use tokio::time::Instant;

/// Idle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
    /// Traffic observed within every configured window
    Active,
    /// At least one window elapsed without the traffic it watches
    IdleDetected,
}

/// Which axis fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleKind {
    Reader,
    Writer,
    All,
}

/// Raised when an axis' window elapses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleEvent {
    pub kind: IdleKind,
    /// First event since the last traffic on that axis
    pub first: bool,
}

/// Idle windows; `Duration::ZERO` disables an axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleConfig {
    pub reader_idle: Duration,
    pub writer_idle: Duration,
    pub all_idle: Duration,
}

impl IdleConfig {
    /// Only the read axis enabled
    pub fn reader_only(window: Duration) -> Self {
        Self {
            reader_idle: window,
            writer_idle: Duration::ZERO,
            all_idle: Duration::ZERO,
        }
    }

    pub fn from_server_config(config: &ServerConfig) -> Self {
        Self {
            reader_idle: config.reader_idle(),
            writer_idle: config.writer_idle(),
            all_idle: config.all_idle(),
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        !self.reader_idle.is_zero() || !self.writer_idle.is_zero() || !self.all_idle.is_zero()
    }
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self::reader_only(Duration::from_secs(30))
    }
}

#[derive(Debug, Clone, Copy)]
struct Axis {
    kind: IdleKind,
    window: Duration,
    deadline: Instant,
    first: bool,
    fired: bool,
}

impl Axis {
    fn new(kind: IdleKind, window: Duration, now: Instant) -> Option<Self> {
        if window.is_zero() {
            return None;
        }
        Some(Self {
            kind,
            window,
            deadline: now + window,
            first: true,
            fired: false,
        })
    }

    #[inline]
    fn reset(&mut self, now: Instant) {
        self.deadline = now + self.window;
        self.first = true;
        self.fired = false;
    }

    fn fire(&mut self, now: Instant) -> IdleEvent {
        let event = IdleEvent {
            kind: self.kind,
            first: self.first,
        };
        // Keep raising one event per window until traffic resumes
        self.deadline = now + self.window;
        self.first = false;
        self.fired = true;
        event
    }
}

/// Idle monitor for one connection
#[derive(Debug, Clone)]
pub struct IdleMonitor {
    reader: Option<Axis>,
    writer: Option<Axis>,
    all: Option<Axis>,
}

impl IdleMonitor {
    pub fn new(config: IdleConfig, now: Instant) -> Self {
        Self {
            reader: Axis::new(IdleKind::Reader, config.reader_idle, now),
            writer: Axis::new(IdleKind::Writer, config.writer_idle, now),
            all: Axis::new(IdleKind::All, config.all_idle, now),
        }
    }

    /// Inbound read observed
    pub fn record_read(&mut self, now: Instant) {
        if let Some(axis) = self.reader.as_mut() {
            axis.reset(now);
        }
        if let Some(axis) = self.all.as_mut() {
            axis.reset(now);
        }
    }

    /// Outbound write observed
    pub fn record_write(&mut self, now: Instant) {
        if let Some(axis) = self.writer.as_mut() {
            axis.reset(now);
        }
        if let Some(axis) = self.all.as_mut() {
            axis.reset(now);
        }
    }

    /// Earliest instant at which an event may fire; `None` when disabled
    pub fn next_deadline(&self) -> Option<Instant> {
        self.axes().map(|axis| axis.deadline).min()
    }

    /// Raise the event of the earliest expired axis, if any
    pub fn poll(&mut self, now: Instant) -> Option<IdleEvent> {
        [&mut self.reader, &mut self.writer, &mut self.all]
            .into_iter()
            .flatten()
            .filter(|axis| now >= axis.deadline)
            .min_by_key(|axis| axis.deadline)
            .map(|axis| axis.fire(now))
    }

    pub fn state(&self) -> IdleState {
        if self.axes().any(|axis| axis.fired) {
            IdleState::IdleDetected
        } else {
            IdleState::Active
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.axes().next().is_some()
    }

    fn axes(&self) -> impl Iterator<Item = &Axis> {
        [&self.reader, &self.writer, &self.all].into_iter().flatten()
    }
}
