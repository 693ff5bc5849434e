//! Configuration module for the Cambia server.
//!
//! Configuration is assembled from three sources, lowest precedence first:
//! compiled-in defaults, an optional `config.json` in the working directory,
//! and environment variables (the historian knobs and connection strings
//! are environment-first so deployments can tune them without a file).

pub mod defaults;
pub mod loader;
pub mod logging;
pub mod types;

pub use loader::load;
pub use logging::{FileLogging, LogFormat, LogLevel, LogRotation, LoggingConfig};
pub use types::{Config, HistorianSettings, SecuritySettings, ServerSettings};
