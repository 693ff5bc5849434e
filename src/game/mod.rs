// Game module: cards, pure rules, the authoritative engine, and per-observer
// state projection

pub mod cards;
pub mod engine;
pub mod obfuscate;
pub mod rules;

pub use cards::{Card, CardId, Rank, Suit};
pub use engine::{Game, GameConfig, GameSeat};
pub use obfuscate::{ObfGameState, ObfPlayer};
pub use rules::{ability_for, score_hand, standard_deck, Ability};
