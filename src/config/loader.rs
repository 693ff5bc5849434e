//! Configuration loading and environment parsing.

use std::path::Path;

use super::{Config, LogFormat, LogLevel};

/// Load configuration with the following precedence (highest first):
/// 1) Individual environment variables (`CAMBIA_PORT`, `HISTORIAN_BATCH_SIZE`,
///    `HISTORIAN_FLUSH_MS`, `GAME_INACTIVITY_TIMEOUT_SEC`, `DATABASE_URL`,
///    `CAMBIA_LOG_LEVEL`, `CAMBIA_LOG_FORMAT`)
/// 2) File pointed to by `CAMBIA_CONFIG_PATH`
/// 3) `config.json` in the current working directory
/// 4) Defaults compiled into the binary
///
/// Errors while reading or parsing are printed to stderr and the next source
/// is used; `load()` always returns a usable `Config`.
#[must_use]
pub fn load() -> Config {
    let mut config = std::env::var("CAMBIA_CONFIG_PATH")
        .ok()
        .and_then(|path| read_config_file(Path::new(&path)))
        .or_else(|| read_config_file(Path::new("config.json")))
        .unwrap_or_default();

    apply_env_overrides(&mut config);
    config
}

fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        return None;
    }
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(config) => Some(config),
            Err(err) => {
                eprintln!("Failed to parse {}: {err}", path.display());
                None
            }
        },
        Err(err) => {
            eprintln!("Failed to read {}: {err}", path.display());
            None
        }
    }
}

fn apply_env_overrides(config: &mut Config) {
    if let Some(port) = env_parse::<u16>("CAMBIA_PORT") {
        config.port = port;
    }
    if let Some(batch_size) = env_parse::<usize>("HISTORIAN_BATCH_SIZE") {
        config.historian.batch_size = batch_size;
    }
    if let Some(flush_ms) = env_parse::<u64>("HISTORIAN_FLUSH_MS") {
        config.historian.flush_ms = flush_ms;
    }
    if let Some(inactivity) = env_parse::<u64>("GAME_INACTIVITY_TIMEOUT_SEC") {
        config.historian.inactivity_sec = inactivity;
    }
    if let Ok(url) = std::env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            config.historian.database_url = Some(url);
        }
    }
    if let Ok(origins) = std::env::var("CAMBIA_CORS_ORIGINS") {
        if !origins.trim().is_empty() {
            config.security.cors_origins = origins;
        }
    }
    if let Some(level) = env_parse::<LogLevel>("CAMBIA_LOG_LEVEL") {
        config.logging.level = Some(level);
    }
    if let Some(format) = env_parse::<LogFormat>("CAMBIA_LOG_FORMAT") {
        config.logging.format = format;
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            eprintln!("Ignoring invalid {name}={raw}");
            None
        }
    }
}
