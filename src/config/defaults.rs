//! Default value functions for configuration fields, used by serde's
//! `#[serde(default = ...)]` attributes.

// =============================================================================
// Port & Root Config
// =============================================================================

pub const fn default_port() -> u16 {
    8080
}

// =============================================================================
// Server Defaults
// =============================================================================

/// Start countdown length once a lobby is all-ready.
pub const fn default_lobby_countdown_sec() -> u32 {
    10
}

/// Pregame private reveal window before the first turn.
pub const fn default_pregame_reveal_sec() -> u32 {
    10
}

/// Bounded wait for a user-store lookup before falling back to a synthetic
/// username.
pub const fn default_user_lookup_timeout_ms() -> u64 {
    2000
}

/// Per-connection outbound queue depth; saturated queues drop.
pub const fn default_outbound_queue_capacity() -> usize {
    64
}

// =============================================================================
// Historian Defaults
// =============================================================================

pub const fn default_historian_batch_size() -> usize {
    20
}

pub const fn default_historian_flush_ms() -> u64 {
    500
}

pub const fn default_game_inactivity_sec() -> u64 {
    600 // 10 minutes
}

// =============================================================================
// Security Defaults
// =============================================================================

pub fn default_cors_origins() -> String {
    "*".to_string()
}

pub const fn default_max_message_size() -> usize {
    64 * 1024
}

// =============================================================================
// Logging Defaults
// =============================================================================

pub fn default_log_dir() -> String {
    "logs".to_string()
}

pub fn default_log_filename() -> String {
    "server.log".to_string()
}
