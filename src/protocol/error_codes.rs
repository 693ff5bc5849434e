use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for structured error handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Authentication
    Unauthorized,
    InvalidToken,

    // Lobby
    LobbyNotFound,
    NotInvited,
    NotInLobby,
    NotHost,
    LobbyInGame,
    CountdownRefused,
    InvalidRules,

    // Game
    GameNotStarted,
    GameAlreadyOver,
    NotYourTurn,
    InvalidAction,
    InvalidIndex,
    SnapNotAllowed,
    NoAbilityActive,
    ReconnectionRejected,

    // Transport
    MessageTooLarge,
    ProtocolViolation,

    // Server
    InternalError,
}

impl ErrorCode {
    /// Human-readable description, suitable for display to end users.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Unauthorized => "Access denied. Authentication credentials are missing.",
            Self::InvalidToken => "The authentication token is invalid or has expired.",
            Self::LobbyNotFound => "The requested lobby does not exist or has been disposed.",
            Self::NotInvited => "This lobby is private and you have not been invited.",
            Self::NotInLobby => "You are not a member of this lobby.",
            Self::NotHost => "Only the lobby host may perform this operation.",
            Self::LobbyInGame => "The lobby is already in a game.",
            Self::CountdownRefused => {
                "The start countdown cannot begin. At least two connected players must be ready."
            }
            Self::InvalidRules => "One or more rule values are out of range. Nothing was changed.",
            Self::GameNotStarted => "No game is running in this lobby yet.",
            Self::GameAlreadyOver => "The game has already finished.",
            Self::NotYourTurn => "It is not your turn.",
            Self::InvalidAction => "That action is not legal in the current game state.",
            Self::InvalidIndex => "The card index is out of range.",
            Self::SnapNotAllowed => "Snapping is not possible right now.",
            Self::NoAbilityActive => "There is no special ability awaiting your input.",
            Self::ReconnectionRejected => "Reconnection was rejected; you have been forfeited.",
            Self::MessageTooLarge => "The message size exceeds the maximum allowed limit.",
            Self::ProtocolViolation => "The message violates the protocol and the socket closed.",
            Self::InternalError => "An internal server error occurred. Please try again.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
