// Protocol module: wire message types, identifiers, rules objects, error codes

pub mod error_codes;
pub mod messages;
pub mod types;

pub use error_codes::ErrorCode;

pub use types::{
    CircuitRules, GameId, HouseRules, LobbyId, LobbyRules, LobbyType, RulesPatch, UserId,
};

pub use messages::{
    ChatPayload, ClientMessage, GameOverPayload, LobbyStatePayload, PlayerScore, RevealLocation,
    ServerMessage, SpecialActionInput,
};
