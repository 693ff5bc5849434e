//! Root configuration struct and its sections.

use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use super::defaults::{
    default_cors_origins, default_game_inactivity_sec, default_historian_batch_size,
    default_historian_flush_ms, default_lobby_countdown_sec, default_max_message_size,
    default_outbound_queue_capacity, default_port, default_pregame_reveal_sec,
    default_user_lookup_timeout_ms,
};
use super::logging::LoggingConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub historian: HistorianSettings,
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            server: ServerSettings::default(),
            historian: HistorianSettings::default(),
            security: SecuritySettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_lobby_countdown_sec")]
    pub lobby_countdown_sec: u32,
    #[serde(default = "default_pregame_reveal_sec")]
    pub pregame_reveal_sec: u32,
    #[serde(default = "default_user_lookup_timeout_ms")]
    pub user_lookup_timeout_ms: u64,
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            lobby_countdown_sec: default_lobby_countdown_sec(),
            pregame_reveal_sec: default_pregame_reveal_sec(),
            user_lookup_timeout_ms: default_user_lookup_timeout_ms(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorianSettings {
    #[serde(default = "default_historian_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_historian_flush_ms")]
    pub flush_ms: u64,
    #[serde(default = "default_game_inactivity_sec")]
    pub inactivity_sec: u64,
    /// Postgres connection string; absent means the in-memory store
    #[serde(default)]
    pub database_url: Option<String>,
}

impl Default for HistorianSettings {
    fn default() -> Self {
        Self {
            batch_size: default_historian_batch_size(),
            flush_ms: default_historian_flush_ms(),
            inactivity_sec: default_game_inactivity_sec(),
            database_url: None,
        }
    }
}

impl HistorianSettings {
    pub fn to_historian_config(&self) -> crate::historian::HistorianConfig {
        crate::historian::HistorianConfig {
            batch_size: self.batch_size.max(1),
            flush_delay: Duration::from_millis(self.flush_ms.max(1)),
            inactivity: Duration::from_secs(self.inactivity_sec),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySettings {
    /// Comma-separated allowed origins, or "*"
    #[serde(default = "default_cors_origins")]
    pub cors_origins: String,
    /// Largest accepted inbound frame, in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            cors_origins: default_cors_origins(),
            max_message_size: default_max_message_size(),
        }
    }
}
