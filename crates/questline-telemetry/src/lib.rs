//! # questline-telemetry
//!
//! Installs the process-wide `tracing` subscriber: an `EnvFilter` (where
//! `RUST_LOG` wins over the configured level), a stdout formatter, and an
//! optional SQLite layer that keeps warn+ events and connection system
//! events for later inspection.

#![deny(unsafe_code)]

mod sink;

pub use sink::{LogQuery, LogRecord, SYSTEM_EVENT_RETENTION, SqliteLogLayer, SqliteLogSink};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by `RUST_LOG`.
    pub log_level: Level,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
    /// Whether to persist warn+ logs to SQLite.
    pub persist_warnings: bool,
    /// Path to the log database.
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            json: false,
            persist_warnings: true,
            log_db_path: questline_dir().join("logs.db"),
        }
    }
}

impl TelemetryConfig {
    /// Build from a level name, falling back to `INFO` for unknown names.
    pub fn with_level_name(mut self, level: &str) -> Self {
        self.log_level = level.parse().unwrap_or(Level::INFO);
        self
    }
}

/// Keeps the log sink alive for the life of the process.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
}

impl TelemetryGuard {
    /// Access the log sink for querying persisted logs.
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
///
/// A second call leaves the first subscriber in place.
pub fn init_telemetry(config: &TelemetryConfig) -> TelemetryGuard {
    let default_filter = config.log_level.to_string().to_lowercase();
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_filter));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    let (sqlite_layer, sqlite_sink) = if config.persist_warnings {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(Arc::clone(&sink))), Some(sink))
            }
            Err(e) => {
                eprintln!("questline-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer)
        .try_init()
    {
        eprintln!("questline-telemetry: subscriber already installed: {e}");
    }

    TelemetryGuard {
        log_sink: sqlite_sink,
    }
}

/// `~/.questline`, or `/tmp/.questline` without a home directory.
pub fn questline_dir() -> PathBuf {
    std::env::var("HOME")
        .map_or_else(|_| PathBuf::from("/tmp"), PathBuf::from)
        .join(".questline")
}
