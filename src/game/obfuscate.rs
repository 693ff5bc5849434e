//! Per-observer projection of a game snapshot.
//!
//! Each viewer receives only what they are entitled to see: public game
//! flags, pile sizes, the discard top, and their own cards. Other players'
//! hands are reduced to a count. The projection is a pure read of the locked
//! aggregate and never mutates it.

use serde::{Deserialize, Serialize};

use crate::protocol::{GameId, HouseRules, UserId};

use super::cards::Card;
use super::engine::GameInner;

/// What one observer is allowed to see of a game.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObfGameState {
    pub game_id: GameId,
    pub viewer_id: UserId,
    pub pregame_active: bool,
    pub started: bool,
    pub game_over: bool,
    pub cambia_called: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cambia_caller_id: Option<UserId>,
    pub turn_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_player_id: Option<UserId>,
    pub stockpile_size: usize,
    pub discard_size: usize,
    /// The discard top is always public, in full.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discard_top: Option<Card>,
    pub house_rules: HouseRules,
    pub players: Vec<ObfPlayer>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObfPlayer {
    pub user_id: UserId,
    pub username: String,
    pub hand_size: usize,
    pub connected: bool,
    pub has_called_cambia: bool,
    pub forfeited: bool,
    /// Full cards in hand order; present only for the viewer themselves
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hand: Option<Vec<Card>>,
    /// Held drawn card; present only for the viewer themselves
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drawn: Option<Card>,
}

/// Project `inner` as seen by `viewer`.
pub(crate) fn project(game_id: GameId, inner: &GameInner, viewer: UserId) -> ObfGameState {
    let players = inner
        .players
        .iter()
        .map(|p| {
            let is_viewer = p.user_id == viewer;
            ObfPlayer {
                user_id: p.user_id,
                username: p.username.clone(),
                hand_size: p.hand.len(),
                connected: p.connected,
                has_called_cambia: p.has_called_cambia,
                forfeited: p.forfeited,
                hand: is_viewer.then(|| p.hand.clone()),
                drawn: if is_viewer { p.drawn } else { None },
            }
        })
        .collect();

    ObfGameState {
        game_id,
        viewer_id: viewer,
        pregame_active: inner.pregame_active,
        started: inner.started,
        game_over: inner.game_over,
        cambia_called: inner.cambia_called,
        cambia_caller_id: inner.cambia_caller_id,
        turn_id: inner.turn_id,
        current_player_id: (inner.started && !inner.game_over)
            .then(|| inner.players[inner.current_idx].user_id),
        stockpile_size: inner.deck.len(),
        discard_size: inner.discard.len(),
        discard_top: inner.discard.last().copied(),
        house_rules: inner.house_rules.clone(),
        players,
    }
}
