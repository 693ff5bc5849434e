use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for users
pub type UserId = Uuid;
/// Unique identifier for lobbies
pub type LobbyId = Uuid;
/// Unique identifier for game instances
pub type GameId = Uuid;

/// Lobby visibility
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LobbyType {
    /// Joinable only by invited users
    #[default]
    Private,
    /// Joinable by anyone who knows the lobby id
    Public,
}

/// Per-game rule toggles, editable from the lobby before start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HouseRules {
    /// Permit `draw_discard` as a draw source
    pub allow_draw_from_discard_pile: bool,
    /// Whether abilities fire when the triggering card is ejected by a replace
    pub allow_replace_abilities: bool,
    /// Enable the snap side action
    pub snap_race: bool,
    /// Forfeit a player the moment their socket drops
    pub forfeit_on_disconnect: bool,
    /// Cards drawn as penalty for a failed snap
    pub penalty_draw_count: u8,
    /// Consecutive turn timeouts before a player is forfeited
    pub auto_kick_turn_count: u8,
    /// Seconds per turn; 0 disables the turn timer
    pub turn_timer_sec: u16,
}

impl Default for HouseRules {
    fn default() -> Self {
        Self {
            allow_draw_from_discard_pile: false,
            allow_replace_abilities: false,
            snap_race: true,
            forfeit_on_disconnect: false,
            penalty_draw_count: 1,
            auto_kick_turn_count: 3,
            turn_timer_sec: 30,
        }
    }
}

impl HouseRules {
    /// Rules constraints that cannot be expressed in the type system.
    pub fn validate(&self) -> Result<(), String> {
        if self.auto_kick_turn_count == 0 {
            return Err("auto_kick_turn_count must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Multi-round tournament settings. Out-of-round bookkeeping only; the
/// single-round rules are unaffected except for the false-cambia penalty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CircuitRules {
    pub enabled: bool,
    pub target_score: i32,
    pub win_bonus: i32,
    pub false_cambia_penalty: i32,
    pub freeze_user_on_disconnect: bool,
}

impl Default for CircuitRules {
    fn default() -> Self {
        Self {
            enabled: false,
            target_score: 100,
            win_bonus: -1,
            false_cambia_penalty: 5,
            freeze_user_on_disconnect: false,
        }
    }
}

/// Full composite rules object broadcast on every change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LobbyRules {
    pub house_rules: HouseRules,
    pub circuit: CircuitRules,
    /// Start the countdown automatically once everyone is ready
    pub auto_start: bool,
}

/// Partial update of [`LobbyRules`]. Absent fields are left untouched.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RulesPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub house_rules: Option<HouseRulesPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit: Option<CircuitPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_start: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct HouseRulesPatch {
    pub allow_draw_from_discard_pile: Option<bool>,
    pub allow_replace_abilities: Option<bool>,
    pub snap_race: Option<bool>,
    pub forfeit_on_disconnect: Option<bool>,
    pub penalty_draw_count: Option<u8>,
    pub auto_kick_turn_count: Option<u8>,
    pub turn_timer_sec: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CircuitPatch {
    pub enabled: Option<bool>,
    pub target_score: Option<i32>,
    pub win_bonus: Option<i32>,
    pub false_cambia_penalty: Option<i32>,
    pub freeze_user_on_disconnect: Option<bool>,
}

impl RulesPatch {
    pub fn is_empty(&self) -> bool {
        self.house_rules.is_none() && self.circuit.is_none() && self.auto_start.is_none()
    }

    /// Apply the patch to a copy of `rules`, returning the updated value.
    /// Fails without partial commit if any patched value is invalid.
    pub fn apply(&self, rules: &LobbyRules) -> Result<LobbyRules, String> {
        let mut next = rules.clone();
        if let Some(hr) = &self.house_rules {
            let h = &mut next.house_rules;
            if let Some(v) = hr.allow_draw_from_discard_pile {
                h.allow_draw_from_discard_pile = v;
            }
            if let Some(v) = hr.allow_replace_abilities {
                h.allow_replace_abilities = v;
            }
            if let Some(v) = hr.snap_race {
                h.snap_race = v;
            }
            if let Some(v) = hr.forfeit_on_disconnect {
                h.forfeit_on_disconnect = v;
            }
            if let Some(v) = hr.penalty_draw_count {
                h.penalty_draw_count = v;
            }
            if let Some(v) = hr.auto_kick_turn_count {
                h.auto_kick_turn_count = v;
            }
            if let Some(v) = hr.turn_timer_sec {
                h.turn_timer_sec = v;
            }
            h.validate()?;
        }
        if let Some(c) = &self.circuit {
            let cr = &mut next.circuit;
            if let Some(v) = c.enabled {
                cr.enabled = v;
            }
            if let Some(v) = c.target_score {
                cr.target_score = v;
            }
            if let Some(v) = c.win_bonus {
                cr.win_bonus = v;
            }
            if let Some(v) = c.false_cambia_penalty {
                cr.false_cambia_penalty = v;
            }
            if let Some(v) = c.freeze_user_on_disconnect {
                cr.freeze_user_on_disconnect = v;
            }
        }
        if let Some(v) = self.auto_start {
            next.auto_start = v;
        }
        Ok(next)
    }
}
