//! Logging configuration types.
//!
//! Kept down to what this server actually tunes: a level floor, the stdout
//! format, and an optional rolling file sink. Environment overrides
//! (`CAMBIA_LOG_LEVEL`, `CAMBIA_LOG_FORMAT`) go through the same `FromStr`
//! impls the loader uses for every other knob.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::defaults::{default_log_dir, default_log_filename};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    /// Level floor. Precedence at init: this > `RUST_LOG` > "info".
    #[serde(default)]
    pub level: Option<LogLevel>,
    /// Rendering of the stdout layer
    #[serde(default)]
    pub format: LogFormat,
    /// Rolling file sink; stdout-only when absent
    #[serde(default)]
    pub file: Option<FileLogging>,
}

/// Rolling file sink settings. The file layer renders plain text without
/// ANSI regardless of the stdout format, so rolled logs stay grep-able.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLogging {
    #[serde(default = "default_log_dir")]
    pub dir: String,
    #[serde(default = "default_log_filename")]
    pub filename: String,
    #[serde(default)]
    pub rotation: LogRotation,
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            filename: default_log_filename(),
            rotation: LogRotation::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    #[serde(alias = "warning")]
    Warn,
    #[serde(alias = "err")]
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" | "err" => Ok(Self::Error),
            other => Err(format!(
                "unknown log level '{other}', expected trace|debug|info|warn|error"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Text,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            other => Err(format!("unknown log format '{other}', expected json|text")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}
