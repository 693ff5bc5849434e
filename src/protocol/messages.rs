use serde::{Deserialize, Serialize};

use crate::game::cards::Card;
use crate::game::obfuscate::ObfGameState;
use crate::game::rules::Ability;

use super::error_codes::ErrorCode;
use super::types::{GameId, LobbyRules, LobbyType, RulesPatch, UserId};

/// Message types sent from client to server. The `type` field is the
/// discriminator; payload fields are flattened beside it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    // -- Lobby --
    /// Mark yourself ready to start
    Ready,
    /// Withdraw readiness; cancels any running countdown
    Unready,
    /// Invite another user into the lobby
    Invite { user_id: UserId },
    /// Lobby chat
    Chat { message: String },
    /// Leave the lobby
    Leave,
    /// Partial update of house rules / circuit / lobby settings (host only)
    UpdateRules { rules: RulesPatch },
    /// Host-triggered start countdown (when auto-start is off)
    StartGame,

    // -- Game --
    /// Draw the top card of the stockpile
    DrawStockpile,
    /// Draw the top card of the discard pile (house rule)
    DrawDiscard,
    /// Discard the held drawn card
    DiscardDrawn,
    /// Swap the drawn card with hand\[idx\], discarding the ejected card
    Replace { idx: usize },
    /// Claim hand\[idx\] matches the rank of the discard top
    Snap { idx: usize },
    /// Call Cambia at the start of your turn
    CallCambia,
    /// Input for an in-progress special ability
    SpecialAction {
        #[serde(flatten)]
        input: SpecialActionInput,
    },
    /// Request a fresh obfuscated state snapshot
    Sync,
}

/// Multi-step ability input. Validated against the active
/// special-action state; illegal input fails without a state change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SpecialActionInput {
    /// 7/8: peek one of your own cards
    PeekOwn { idx: usize },
    /// 9/10: peek one card of another player
    PeekOther { target_user: UserId, idx: usize },
    /// J/Q: swap two cards blind
    BlindSwap {
        first_user: UserId,
        first_idx: usize,
        second_user: UserId,
        second_idx: usize,
    },
    /// K step one: pick two cards to look at
    KingPeek {
        first_user: UserId,
        first_idx: usize,
        second_user: UserId,
        second_idx: usize,
    },
    /// K step two: confirm or decline the swap
    KingDecide { swap: bool },
    /// Decline the ability entirely
    Skip,
}

/// Where a privately revealed card currently sits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RevealLocation {
    /// A slot in some player's hand
    Hand { user_id: UserId, idx: usize },
    /// The viewer's held drawn card
    Drawn,
}

/// Full private lobby snapshot sent to a freshly bound connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LobbyStatePayload {
    pub lobby_id: crate::protocol::LobbyId,
    pub host_id: UserId,
    pub lobby_type: LobbyType,
    pub game_mode: String,
    pub users: Vec<LobbyMemberInfo>,
    pub rules: LobbyRules,
    pub in_game: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_id: Option<GameId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LobbyMemberInfo {
    pub user_id: UserId,
    pub username: String,
    pub connected: bool,
    pub ready: bool,
    pub invited_only: bool,
}

/// Lobby chat line with sender identity and unix timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatPayload {
    pub user_id: UserId,
    pub username: String,
    pub message: String,
    pub timestamp: i64,
}

/// Per-player endgame breakdown.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerScore {
    pub user_id: UserId,
    pub username: String,
    pub score: i32,
    pub hand: Vec<Card>,
    pub called_cambia: bool,
    pub forfeited: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GameOverPayload {
    pub game_id: GameId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner_id: Option<UserId>,
    pub reason: GameEndReason,
    pub scores: Vec<PlayerScore>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GameEndReason {
    /// Cambia-call rotation completed
    CambiaCall,
    /// Deck and discard could not supply another draw
    DeckExhausted,
    /// Too few active players remained to continue
    Forfeit,
    /// Fatal invariant violation; the game was abandoned mid-flight
    Aborted,
}

/// Message types sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // -- Lobby --
    /// Private full lobby snapshot (boxed to reduce enum size)
    LobbyState(Box<LobbyStatePayload>),
    /// Membership change: somebody joined or left
    LobbyUpdate {
        user_id: UserId,
        username: String,
        joined: bool,
    },
    /// A user was invited
    LobbyInvite {
        user_id: UserId,
        invited_by: UserId,
    },
    /// Ready flag changed
    ReadyUpdate {
        user_id: UserId,
        ready: bool,
    },
    LobbyCountdownStart {
        seconds: u32,
    },
    LobbyCountdownCancel,
    /// Full composite rules object after any accepted change
    LobbyRulesUpdated {
        rules: LobbyRules,
    },
    Chat(ChatPayload),

    // -- Game --
    GameStart {
        game_id: GameId,
        players: Vec<UserId>,
        rules: LobbyRules,
    },
    /// Public draw notification. The card is present only for discard-pile
    /// draws, where it was already publicly visible.
    PlayerDraw {
        user_id: UserId,
        from_discard: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        card: Option<Card>,
        stockpile_size: usize,
    },
    PlayerDiscard {
        user_id: UserId,
        card: Card,
    },
    PlayerReplace {
        user_id: UserId,
        idx: usize,
        discarded: Card,
    },
    SnapSuccess {
        user_id: UserId,
        card: Card,
    },
    SnapFail {
        user_id: UserId,
        penalty_cards: usize,
    },
    TurnChange {
        user_id: UserId,
        turn_id: u64,
    },
    TurnTimeout {
        user_id: UserId,
        consecutive: u8,
        forfeited: bool,
    },
    CambiaCalled {
        user_id: UserId,
    },
    /// Public: an ability is awaiting the actor's input
    SpecialActionPrompt {
        user_id: UserId,
        ability: Ability,
    },
    /// Public: the ability resolved (or was skipped); no card identities
    SpecialActionDone {
        user_id: UserId,
        ability: Ability,
        completed: bool,
    },
    /// Private: a card revealed only to this connection
    PrivateReveal {
        card: Card,
        location: RevealLocation,
    },
    PlayerReconnect {
        user_id: UserId,
    },
    /// Private: per-observer obfuscated snapshot (reconnect and `sync`)
    GameState(Box<ObfGameState>),
    GameOver(Box<GameOverPayload>),

    // -- Errors --
    Error {
        message: String,
        code: ErrorCode,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::cards::{Rank, Suit};

    #[test]
    fn special_action_input_flattens_into_the_envelope() {
        let json = serde_json::json!({
            "type": "special_action",
            "action": "peek_own",
            "idx": 1,
        });
        let msg: ClientMessage = serde_json::from_value(json).unwrap();
        assert_eq!(
            msg,
            ClientMessage::SpecialAction {
                input: SpecialActionInput::PeekOwn { idx: 1 }
            }
        );
    }

    #[test]
    fn private_reveal_round_trips() {
        let msg = ServerMessage::PrivateReveal {
            card: Card::new(Rank::King, Some(Suit::Hearts)),
            location: RevealLocation::Hand {
                user_id: uuid::Uuid::new_v4(),
                idx: 3,
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn player_draw_omits_card_for_stockpile_draws() {
        let msg = ServerMessage::PlayerDraw {
            user_id: uuid::Uuid::new_v4(),
            from_discard: false,
            card: None,
            stockpile_size: 40,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("card").is_none());
    }
}
