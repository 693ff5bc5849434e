#![cfg_attr(not(test), deny(clippy::panic))]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_excessive_bools,
    clippy::too_many_arguments,
    clippy::too_many_lines,
    clippy::similar_names
)]

//! # Cambia Server
//!
//! Realtime multiplayer server for the card game *Cambia*.
//!
//! Clients connect over WebSocket, gather in ephemeral in-memory lobbies,
//! negotiate ready/countdown, then play a full authoritative game round.
//! Every completed action is pushed onto a durable queue and drained by the
//! historian into a relational store.

/// Opaque-token verification for WebSocket upgrades
pub mod auth;

/// Server configuration and environment variables
pub mod config;

/// Game engine: cards, rules, turn state machine, per-observer projections
pub mod game;

/// Historian: action ingest, batching, inactivity detection
pub mod historian;

/// Ephemeral lobby aggregates and the process-wide lobby registry
pub mod lobby;

/// Structured logging configuration
pub mod logging;

/// WebSocket message protocol definitions
pub mod protocol;

/// Durable FIFO action queue abstraction
pub mod queue;

/// Application state and message dispatch
pub mod server;

/// User profile lookup (bounded, fallible)
pub mod users;

/// WebSocket connection handling
pub mod websocket;
