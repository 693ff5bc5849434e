//! Structured logging for the Cambia server.
//!
//! One registry, three optional layers: a stdout layer in the configured
//! format, and a rolling-file sink that always renders plain text without
//! ANSI so rolled logs stay grep-able. The filter floor comes from config,
//! then `RUST_LOG`, then "info". Aggregate code attaches its own structured
//! fields (`lobby_id`, `game_id`, `user_id`) at the call sites; nothing here
//! needs to know about them.

use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::config::{FileLogging, LogFormat, LogRotation, LoggingConfig};

/// Install the global subscriber. Safe to call more than once (later calls
/// lose and are ignored), which keeps test binaries from panicking.
pub fn init_with_config(cfg: &LoggingConfig) {
    let filter = match cfg.level {
        Some(level) => EnvFilter::default().add_directive(tracing::Level::from(level).into()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let stdout_text = matches!(cfg.format, LogFormat::Text).then(|| {
        tracing_subscriber::fmt::layer()
            .with_timer(UtcTime::rfc_3339())
            .with_writer(std::io::stdout)
    });
    let stdout_json = matches!(cfg.format, LogFormat::Json).then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_ansi(false)
            .with_timer(UtcTime::rfc_3339())
            .with_writer(std::io::stdout)
    });
    let file = cfg.file.as_ref().and_then(file_writer).map(|writer| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_timer(UtcTime::rfc_3339())
            .with_writer(writer)
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_text)
        .with(stdout_json)
        .with(file)
        .try_init();
}

/// Build the non-blocking rolling writer, or fall back to stdout-only when
/// the directory cannot be created.
fn file_writer(cfg: &FileLogging) -> Option<NonBlocking> {
    if let Err(err) = std::fs::create_dir_all(&cfg.dir) {
        eprintln!(
            "Cannot create log directory '{}': {err}; continuing with stdout only",
            cfg.dir
        );
        return None;
    }

    let rotation = match cfg.rotation {
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Never => Rotation::NEVER,
    };
    let appender = RollingFileAppender::new(rotation, &cfg.dir, &cfg.filename);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    // The guard flushes buffered lines on drop; pin it for the process
    // lifetime since the writer outlives this call.
    let _ = Box::leak(Box::new(guard));
    Some(writer)
}
