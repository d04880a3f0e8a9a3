//! Log sink trait and implementations.
//!
//! The engine only needs a sink: wiring decisions, start/stop and threshold
//! breaches are handed to a [`LogSink`] at one of five engine levels, and
//! formatting/destination are the host's concern.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error, info, trace};

/// Engine log levels, coarsest to noisiest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Errors and run-level outcomes only.
    Minimal,
    /// Start/stop and per-stage summaries.
    Basic,
    /// Wiring decisions and per-copy detail.
    Detailed,
    /// Engine internals.
    Debug,
    /// One line per row.
    RowLevel,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Minimal => write!(f, "minimal"),
            Self::Basic => write!(f, "basic"),
            Self::Detailed => write!(f, "detailed"),
            Self::Debug => write!(f, "debug"),
            Self::RowLevel => write!(f, "rowlevel"),
        }
    }
}

/// Trait for engine log sinks.
pub trait LogSink: Send + Sync {
    /// Writes one message from `source` at `level`.
    fn log(&self, level: LogLevel, source: &str, message: &str);

    /// Returns true if `level` messages will be kept.
    ///
    /// Workers use this to skip building row-level messages.
    fn is_enabled(&self, level: LogLevel) -> bool;
}

/// A no-op sink that discards all messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpLogSink;

impl LogSink for NoOpLogSink {
    fn log(&self, _level: LogLevel, _source: &str, _message: &str) {
        // Intentionally empty - discards all messages
    }

    fn is_enabled(&self, _level: LogLevel) -> bool {
        false
    }
}

/// A sink that forwards messages to the tracing framework.
#[derive(Debug, Clone)]
pub struct TracingLogSink {
    /// The maximum engine level to keep.
    max_level: LogLevel,
}

impl Default for TracingLogSink {
    fn default() -> Self {
        Self {
            max_level: LogLevel::Basic,
        }
    }
}

impl TracingLogSink {
    /// Creates a sink keeping messages up to `max_level`.
    #[must_use]
    pub fn new(max_level: LogLevel) -> Self {
        Self { max_level }
    }
}

impl LogSink for TracingLogSink {
    fn log(&self, level: LogLevel, source: &str, message: &str) {
        if !self.is_enabled(level) {
            return;
        }
        match level {
            LogLevel::Minimal => error!(source = %source, "{message}"),
            LogLevel::Basic => info!(source = %source, "{message}"),
            LogLevel::Detailed | LogLevel::Debug => debug!(source = %source, "{message}"),
            LogLevel::RowLevel => trace!(source = %source, "{message}"),
        }
    }

    fn is_enabled(&self, level: LogLevel) -> bool {
        level <= self.max_level
    }
}

/// A collecting sink for tests.
#[derive(Debug, Default)]
pub struct CollectingLogSink {
    messages: RwLock<Vec<(LogLevel, String, String)>>,
}

impl CollectingLogSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected (level, source, message) tuples.
    #[must_use]
    pub fn messages(&self) -> Vec<(LogLevel, String, String)> {
        self.messages.read().clone()
    }

    /// Returns messages at one level.
    #[must_use]
    pub fn messages_at(&self, level: LogLevel) -> Vec<String> {
        self.messages
            .read()
            .iter()
            .filter(|(l, _, _)| *l == level)
            .map(|(_, _, m)| m.clone())
            .collect()
    }
}

impl LogSink for CollectingLogSink {
    fn log(&self, level: LogLevel, source: &str, message: &str) {
        self.messages
            .write()
            .push((level, source.to_string(), message.to_string()));
    }

    fn is_enabled(&self, _level: LogLevel) -> bool {
        true
    }
}

/// Installs a global tracing subscriber for binaries and examples.
///
/// Respects `RUST_LOG`; falls back to `info`. Safe to call once.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
