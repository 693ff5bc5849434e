//! The per-game state machine.
//!
//! One [`Game`] owns one mutex over its whole aggregate. Every inbound player
//! message and every timer callback locks it, mutates, and collects outbound
//! events plus action records into an [`Outbox`]; delivery and queue pushes
//! happen only after the lock is released so inbound handlers can never
//! deadlock against a broadcast.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use uuid::Uuid;

use crate::protocol::messages::{GameEndReason, GameOverPayload, PlayerScore, RevealLocation};
use crate::protocol::{
    CircuitRules, ErrorCode, GameId, HouseRules, LobbyRules, ServerMessage, SpecialActionInput,
    UserId,
};
use crate::queue::{ActionQueue, ActionRecord};
use crate::server::Connection;

use super::cards::Card;
use super::obfuscate;
use super::rules::{self, Ability, PREGAME_REVEAL_INDICES};

/// Action type strings persisted by the historian.
pub mod action_types {
    pub const GAME_START: &str = "action_game_start";
    pub const TURNS_BEGIN: &str = "action_turns_begin";
    pub const DRAW_STOCKPILE: &str = "action_draw_stockpile";
    pub const DRAW_DISCARD: &str = "action_draw_discard";
    pub const DISCARD_DRAWN: &str = "action_discard_drawn";
    pub const REPLACE: &str = "action_replace";
    pub const SNAP_SUCCESS: &str = "action_snap_success";
    pub const SNAP_FAIL: &str = "action_snap_fail";
    pub const CALL_CAMBIA: &str = "action_call_cambia";
    pub const SPECIAL_ACTION: &str = "action_special";
    pub const TURN_TIMEOUT: &str = "action_turn_timeout";
    pub const RECONNECT: &str = "action_reconnect";
    pub const DISCONNECT: &str = "action_disconnect";
    pub const END_GAME: &str = "action_end_game";
}

/// Engine timings that come from server configuration rather than house rules.
#[derive(Debug, Clone)]
pub struct GameConfig {
    /// Length of the pregame private reveal window
    pub pregame_reveal: Duration,
    /// Explicit shuffle seed; `None` seeds from entropy
    pub shuffle_seed: Option<u64>,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            pregame_reveal: Duration::from_secs(10),
            shuffle_seed: None,
        }
    }
}

/// One seat handed over by the lobby at game construction.
pub struct GameSeat {
    pub user_id: UserId,
    pub username: String,
    pub conn: Connection,
}

/// Where the current player is inside their turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TurnPhase {
    /// Turn start: may draw or call cambia
    AwaitingDraw,
    /// Holding a drawn card: must discard or replace
    AwaitingAction,
    /// A special ability is collecting input
    AwaitingSpecial,
}

/// Progress through a multi-step ability.
#[derive(Debug, Clone)]
pub(crate) struct SpecialActionState {
    pub actor_id: UserId,
    pub ability: Ability,
    /// Set once a king-peek selected its two targets
    pub king_selection: Option<((UserId, usize), (UserId, usize))>,
}

#[derive(Debug)]
pub(crate) struct Player {
    pub user_id: UserId,
    pub username: String,
    pub hand: Vec<Card>,
    pub drawn: Option<Card>,
    pub drawn_from_discard: bool,
    pub connected: bool,
    pub has_called_cambia: bool,
    pub forfeited: bool,
    pub consecutive_timeouts: u8,
}

pub(crate) struct GameInner {
    pub players: Vec<Player>,
    pub deck: Vec<Card>,
    pub discard: Vec<Card>,
    pub current_idx: usize,
    pub turn_id: u64,
    pub phase: TurnPhase,
    pub pregame_active: bool,
    pub started: bool,
    pub game_over: bool,
    pub cambia_called: bool,
    pub cambia_caller_id: Option<UserId>,
    /// Players still owed a turn after the cambia call
    pub final_rotation: Option<HashSet<UserId>>,
    pub house_rules: HouseRules,
    pub circuit: CircuitRules,
    pub special: Option<SpecialActionState>,
    /// Snaps asserted while an ability was collecting input
    pub pending_snaps: Vec<(UserId, usize)>,
    pub action_index: u64,
    pub initial_card_count: usize,
    pub rng: StdRng,
    turn_timer: Option<JoinHandle<()>>,
    sinks: HashMap<UserId, Connection>,
}

enum Recipient {
    All,
    One(UserId),
}

/// Events and records collected under the game lock, dispatched after it.
struct Outbox {
    events: Vec<(Recipient, Arc<ServerMessage>)>,
    records: Vec<ActionRecord>,
    finished: bool,
}

impl Outbox {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            records: Vec::new(),
            finished: false,
        }
    }

    fn broadcast(&mut self, msg: ServerMessage) {
        self.events.push((Recipient::All, Arc::new(msg)));
    }

    fn to(&mut self, user: UserId, msg: ServerMessage) {
        self.events.push((Recipient::One(user), Arc::new(msg)));
    }

    fn error(&mut self, user: UserId, code: ErrorCode) {
        self.to(
            user,
            ServerMessage::Error {
                message: code.description().to_string(),
                code,
            },
        );
    }
}

/// A single running Cambia round.
pub struct Game {
    id: GameId,
    config: GameConfig,
    queue: Arc<dyn ActionQueue>,
    inner: Mutex<GameInner>,
    /// Invoked exactly once, after the final `game_over` broadcast, with the
    /// game lock released. The lobby uses it to reset for a rematch.
    on_game_over: Box<dyn Fn(GameId) + Send + Sync>,
}

impl Game {
    /// Build a game from the lobby's members and rules, shuffle and deal.
    /// Call [`Game::start`] afterwards to open the pregame reveal window.
    pub fn new(
        rules_obj: &LobbyRules,
        seats: Vec<GameSeat>,
        queue: Arc<dyn ActionQueue>,
        config: GameConfig,
        on_game_over: Box<dyn Fn(GameId) + Send + Sync>,
    ) -> Arc<Self> {
        let seed = config
            .shuffle_seed
            .unwrap_or_else(|| rand::rng().random::<u64>());
        let mut rng = StdRng::seed_from_u64(seed);

        let mut deck = rules::standard_deck();
        rules::shuffle(&mut deck, &mut rng);
        let initial_card_count = deck.len();
        let hands = rules::deal(&mut deck, seats.len());

        let mut players = Vec::with_capacity(seats.len());
        let mut sinks = HashMap::with_capacity(seats.len());
        for (seat, hand) in seats.into_iter().zip(hands) {
            sinks.insert(seat.user_id, seat.conn);
            players.push(Player {
                user_id: seat.user_id,
                username: seat.username,
                hand,
                drawn: None,
                drawn_from_discard: false,
                connected: true,
                has_called_cambia: false,
                forfeited: false,
                consecutive_timeouts: 0,
            });
        }

        Arc::new(Self {
            id: Uuid::new_v4(),
            config,
            queue,
            inner: Mutex::new(GameInner {
                players,
                deck,
                discard: Vec::new(),
                current_idx: 0,
                turn_id: 0,
                phase: TurnPhase::AwaitingDraw,
                pregame_active: true,
                started: false,
                game_over: false,
                cambia_called: false,
                cambia_caller_id: None,
                final_rotation: None,
                house_rules: rules_obj.house_rules.clone(),
                circuit: rules_obj.circuit.clone(),
                special: None,
                pending_snaps: Vec::new(),
                action_index: 0,
                initial_card_count,
                rng,
                turn_timer: None,
                sinks,
            }),
            on_game_over,
        })
    }

    pub fn id(&self) -> GameId {
        self.id
    }

    pub async fn is_over(&self) -> bool {
        self.inner.lock().await.game_over
    }

    /// Open the pregame reveal window: each player privately sees their two
    /// bottom cards, then turns begin once the window elapses.
    pub async fn start(self: &Arc<Self>) {
        let mut outbox = Outbox::new();
        let sinks;
        {
            let mut inner = self.inner.lock().await;
            for player in &inner.players {
                for idx in PREGAME_REVEAL_INDICES {
                    if let Some(card) = player.hand.get(idx) {
                        outbox.to(
                            player.user_id,
                            ServerMessage::PrivateReveal {
                                card: *card,
                                location: RevealLocation::Hand {
                                    user_id: player.user_id,
                                    idx,
                                },
                            },
                        );
                    }
                }
            }
            let seat_order: Vec<UserId> = inner.players.iter().map(|p| p.user_id).collect();
            self.record(
                &mut inner,
                &mut outbox,
                None,
                action_types::GAME_START,
                serde_json::json!({ "players": seat_order }),
            );
            sinks = inner.sinks.clone();
        }
        self.dispatch(outbox, sinks).await;

        let game = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(game.config.pregame_reveal).await;
            game.begin_turns().await;
        });
    }

    /// Pregame window elapsed: accept moves, seat 0 plays first.
    async fn begin_turns(self: &Arc<Self>) {
        let mut outbox = Outbox::new();
        let sinks;
        {
            let mut inner = self.inner.lock().await;
            if inner.game_over || inner.started {
                return;
            }
            inner.pregame_active = false;
            inner.started = true;
            inner.current_idx = 0;
            inner.turn_id = 1;
            inner.phase = TurnPhase::AwaitingDraw;
            let current = inner.players[0].user_id;
            outbox.broadcast(ServerMessage::TurnChange {
                user_id: current,
                turn_id: inner.turn_id,
            });
            self.record(
                &mut inner,
                &mut outbox,
                None,
                action_types::TURNS_BEGIN,
                serde_json::Value::Null,
            );
            self.arm_turn_timer(&mut inner);
            sinks = inner.sinks.clone();
        }
        self.dispatch(outbox, sinks).await;
    }

    /// Route one inbound game message from `user`.
    pub async fn handle_message(
        self: &Arc<Self>,
        user: UserId,
        msg: crate::protocol::ClientMessage,
    ) {
        use crate::protocol::ClientMessage as Cm;
        let mut outbox = Outbox::new();
        let sinks;
        {
            let mut inner = self.inner.lock().await;
            if inner.game_over {
                outbox.error(user, ErrorCode::GameAlreadyOver);
            } else if inner.pregame_active && !matches!(msg, Cm::Sync) {
                outbox.error(user, ErrorCode::InvalidAction);
            } else {
                match msg {
                    Cm::DrawStockpile => self.draw_stockpile(&mut inner, &mut outbox, user),
                    Cm::DrawDiscard => self.draw_discard(&mut inner, &mut outbox, user),
                    Cm::DiscardDrawn => self.discard_drawn(&mut inner, &mut outbox, user),
                    Cm::Replace { idx } => self.replace(&mut inner, &mut outbox, user, idx),
                    Cm::Snap { idx } => self.snap(&mut inner, &mut outbox, user, idx),
                    Cm::CallCambia => self.call_cambia(&mut inner, &mut outbox, user),
                    Cm::SpecialAction { input } => {
                        self.special_action(&mut inner, &mut outbox, user, input);
                    }
                    Cm::Sync => {
                        let state = obfuscate::project(self.id, &inner, user);
                        outbox.to(user, ServerMessage::GameState(Box::new(state)));
                    }
                    _ => outbox.error(user, ErrorCode::InvalidAction),
                }
            }
            if !inner.game_over {
                self.check_invariants(&mut inner, &mut outbox);
            }
            sinks = inner.sinks.clone();
        }
        self.dispatch(outbox, sinks).await;
    }

    // -- Draw --

    fn draw_stockpile(self: &Arc<Self>, inner: &mut GameInner, outbox: &mut Outbox, user: UserId) {
        if !self.expect_turn(inner, outbox, user, TurnPhase::AwaitingDraw) {
            return;
        }
        if inner.deck.is_empty() {
            Self::reshuffle_discard_into_deck(inner);
        }
        let Some(card) = inner.deck.pop() else {
            // Neither pile can supply a draw: the round ends with current hands.
            self.end_game(inner, outbox, GameEndReason::DeckExhausted);
            return;
        };
        let stockpile_size = inner.deck.len();
        let player = &mut inner.players[inner.current_idx];
        player.drawn = Some(card);
        player.drawn_from_discard = false;
        inner.phase = TurnPhase::AwaitingAction;

        outbox.broadcast(ServerMessage::PlayerDraw {
            user_id: user,
            from_discard: false,
            card: None,
            stockpile_size,
        });
        outbox.to(
            user,
            ServerMessage::PrivateReveal {
                card,
                location: RevealLocation::Drawn,
            },
        );
        self.record(
            inner,
            outbox,
            Some(user),
            action_types::DRAW_STOCKPILE,
            serde_json::json!({ "card": card }),
        );
    }

    fn draw_discard(self: &Arc<Self>, inner: &mut GameInner, outbox: &mut Outbox, user: UserId) {
        if !self.expect_turn(inner, outbox, user, TurnPhase::AwaitingDraw) {
            return;
        }
        if !inner.house_rules.allow_draw_from_discard_pile || inner.discard.is_empty() {
            outbox.error(user, ErrorCode::InvalidAction);
            return;
        }
        let card = inner.discard.pop().unwrap_or_else(|| unreachable!());
        let stockpile_size = inner.deck.len();
        let player = &mut inner.players[inner.current_idx];
        player.drawn = Some(card);
        player.drawn_from_discard = true;
        inner.phase = TurnPhase::AwaitingAction;

        // The card was the public discard top; everyone may see it.
        outbox.broadcast(ServerMessage::PlayerDraw {
            user_id: user,
            from_discard: true,
            card: Some(card),
            stockpile_size,
        });
        self.record(
            inner,
            outbox,
            Some(user),
            action_types::DRAW_DISCARD,
            serde_json::json!({ "card": card }),
        );
    }

    // -- Discard / replace --

    fn discard_drawn(self: &Arc<Self>, inner: &mut GameInner, outbox: &mut Outbox, user: UserId) {
        if !self.expect_turn(inner, outbox, user, TurnPhase::AwaitingAction) {
            return;
        }
        let player = &mut inner.players[inner.current_idx];
        let Some(card) = player.drawn.take() else {
            outbox.error(user, ErrorCode::InvalidAction);
            return;
        };
        let from_discard = player.drawn_from_discard;
        player.drawn_from_discard = false;
        inner.discard.push(card);

        outbox.broadcast(ServerMessage::PlayerDiscard {
            user_id: user,
            card,
        });
        self.record(
            inner,
            outbox,
            Some(user),
            action_types::DISCARD_DRAWN,
            serde_json::json!({ "card": card }),
        );

        // A card fished back out of the discard pile never re-triggers.
        match rules::ability_for(card.rank) {
            Some(ability) if !from_discard => {
                self.enter_special(inner, outbox, user, ability);
            }
            _ => self.finish_turn(inner, outbox),
        }
    }

    fn replace(
        self: &Arc<Self>,
        inner: &mut GameInner,
        outbox: &mut Outbox,
        user: UserId,
        idx: usize,
    ) {
        if !self.expect_turn(inner, outbox, user, TurnPhase::AwaitingAction) {
            return;
        }
        let player = &mut inner.players[inner.current_idx];
        if player.drawn.is_none() {
            outbox.error(user, ErrorCode::InvalidAction);
            return;
        }
        if idx >= player.hand.len() {
            outbox.error(user, ErrorCode::InvalidIndex);
            return;
        }
        let drawn = player.drawn.take().unwrap_or_else(|| unreachable!());
        player.drawn_from_discard = false;
        let ejected = std::mem::replace(&mut player.hand[idx], drawn);
        inner.discard.push(ejected);

        outbox.broadcast(ServerMessage::PlayerReplace {
            user_id: user,
            idx,
            discarded: ejected,
        });
        self.record(
            inner,
            outbox,
            Some(user),
            action_types::REPLACE,
            serde_json::json!({ "idx": idx, "discarded": ejected }),
        );

        match rules::ability_for(ejected.rank) {
            Some(ability) if inner.house_rules.allow_replace_abilities => {
                self.enter_special(inner, outbox, user, ability);
            }
            _ => self.finish_turn(inner, outbox),
        }
    }

    // -- Cambia --

    fn call_cambia(self: &Arc<Self>, inner: &mut GameInner, outbox: &mut Outbox, user: UserId) {
        if !self.expect_turn(inner, outbox, user, TurnPhase::AwaitingDraw) {
            return;
        }
        if inner.cambia_called {
            outbox.error(user, ErrorCode::InvalidAction);
            return;
        }
        inner.cambia_called = true;
        inner.cambia_caller_id = Some(user);
        inner.players[inner.current_idx].has_called_cambia = true;
        // Every other still-active seat owes exactly one more turn.
        let rotation: HashSet<UserId> = inner
            .players
            .iter()
            .filter(|p| !p.forfeited && p.user_id != user)
            .map(|p| p.user_id)
            .collect();
        inner.final_rotation = Some(rotation);

        outbox.broadcast(ServerMessage::CambiaCalled { user_id: user });
        self.record(
            inner,
            outbox,
            Some(user),
            action_types::CALL_CAMBIA,
            serde_json::Value::Null,
        );
        // Calling consumes the turn.
        self.finish_turn(inner, outbox);
    }

    // -- Snap --

    fn snap(
        self: &Arc<Self>,
        inner: &mut GameInner,
        outbox: &mut Outbox,
        user: UserId,
        idx: usize,
    ) {
        if !inner.house_rules.snap_race || !inner.started {
            outbox.error(user, ErrorCode::SnapNotAllowed);
            return;
        }
        if inner.special.is_some() {
            // Never interrupt an ability in progress; re-evaluated afterwards.
            inner.pending_snaps.push((user, idx));
            return;
        }
        self.resolve_snap(inner, outbox, user, idx);
    }

    fn resolve_snap(
        self: &Arc<Self>,
        inner: &mut GameInner,
        outbox: &mut Outbox,
        user: UserId,
        idx: usize,
    ) {
        let Some(pos) = inner.players.iter().position(|p| p.user_id == user) else {
            outbox.error(user, ErrorCode::InvalidAction);
            return;
        };
        if inner.players[pos].forfeited {
            outbox.error(user, ErrorCode::SnapNotAllowed);
            return;
        }
        if idx >= inner.players[pos].hand.len() {
            outbox.error(user, ErrorCode::InvalidIndex);
            return;
        }
        let Some(top_rank) = inner.discard.last().map(|c| c.rank) else {
            outbox.error(user, ErrorCode::SnapNotAllowed);
            return;
        };

        if inner.players[pos].hand[idx].rank == top_rank {
            let card = inner.players[pos].hand.remove(idx);
            inner.discard.push(card);
            outbox.broadcast(ServerMessage::SnapSuccess {
                user_id: user,
                card,
            });
            self.record(
                inner,
                outbox,
                Some(user),
                action_types::SNAP_SUCCESS,
                serde_json::json!({ "card": card }),
            );
        } else {
            let penalty = inner.house_rules.penalty_draw_count as usize;
            let mut drawn = 0usize;
            for _ in 0..penalty {
                if inner.deck.is_empty() {
                    Self::reshuffle_discard_into_deck(inner);
                }
                let Some(card) = inner.deck.pop() else { break };
                inner.players[pos].hand.push(card);
                drawn += 1;
            }
            outbox.broadcast(ServerMessage::SnapFail {
                user_id: user,
                penalty_cards: drawn,
            });
            self.record(
                inner,
                outbox,
                Some(user),
                action_types::SNAP_FAIL,
                serde_json::json!({ "penalty_cards": drawn }),
            );
        }
    }

    // -- Special abilities --

    fn enter_special(
        self: &Arc<Self>,
        inner: &mut GameInner,
        outbox: &mut Outbox,
        actor: UserId,
        ability: Ability,
    ) {
        inner.special = Some(SpecialActionState {
            actor_id: actor,
            ability,
            king_selection: None,
        });
        inner.phase = TurnPhase::AwaitingSpecial;
        outbox.broadcast(ServerMessage::SpecialActionPrompt {
            user_id: actor,
            ability,
        });
    }

    fn special_action(
        self: &Arc<Self>,
        inner: &mut GameInner,
        outbox: &mut Outbox,
        user: UserId,
        input: SpecialActionInput,
    ) {
        let Some(special) = inner.special.clone() else {
            outbox.error(user, ErrorCode::NoAbilityActive);
            return;
        };
        if special.actor_id != user {
            outbox.error(user, ErrorCode::NoAbilityActive);
            return;
        }

        let completed = match (special.ability, input) {
            (Ability::PeekOwn, SpecialActionInput::PeekOwn { idx }) => {
                let Some(card) = Self::card_at(inner, user, idx) else {
                    outbox.error(user, ErrorCode::InvalidIndex);
                    return;
                };
                outbox.to(
                    user,
                    ServerMessage::PrivateReveal {
                        card,
                        location: RevealLocation::Hand { user_id: user, idx },
                    },
                );
                true
            }
            (Ability::PeekOther, SpecialActionInput::PeekOther { target_user, idx }) => {
                if target_user == user {
                    outbox.error(user, ErrorCode::InvalidAction);
                    return;
                }
                let Some(card) = Self::card_at(inner, target_user, idx) else {
                    outbox.error(user, ErrorCode::InvalidIndex);
                    return;
                };
                outbox.to(
                    user,
                    ServerMessage::PrivateReveal {
                        card,
                        location: RevealLocation::Hand {
                            user_id: target_user,
                            idx,
                        },
                    },
                );
                true
            }
            (
                Ability::BlindSwap,
                SpecialActionInput::BlindSwap {
                    first_user,
                    first_idx,
                    second_user,
                    second_idx,
                },
            ) => {
                if Self::swap_cards(inner, (first_user, first_idx), (second_user, second_idx))
                    .is_err()
                {
                    outbox.error(user, ErrorCode::InvalidIndex);
                    return;
                }
                true
            }
            (
                Ability::PeekThenSwap,
                SpecialActionInput::KingPeek {
                    first_user,
                    first_idx,
                    second_user,
                    second_idx,
                },
            ) => {
                if special.king_selection.is_some() {
                    outbox.error(user, ErrorCode::InvalidAction);
                    return;
                }
                let (Some(first), Some(second)) = (
                    Self::card_at(inner, first_user, first_idx),
                    Self::card_at(inner, second_user, second_idx),
                ) else {
                    outbox.error(user, ErrorCode::InvalidIndex);
                    return;
                };
                outbox.to(
                    user,
                    ServerMessage::PrivateReveal {
                        card: first,
                        location: RevealLocation::Hand {
                            user_id: first_user,
                            idx: first_idx,
                        },
                    },
                );
                outbox.to(
                    user,
                    ServerMessage::PrivateReveal {
                        card: second,
                        location: RevealLocation::Hand {
                            user_id: second_user,
                            idx: second_idx,
                        },
                    },
                );
                // Ability stays open until the actor decides.
                if let Some(s) = inner.special.as_mut() {
                    s.king_selection =
                        Some(((first_user, first_idx), (second_user, second_idx)));
                }
                return;
            }
            (Ability::PeekThenSwap, SpecialActionInput::KingDecide { swap }) => {
                let Some((first, second)) = special.king_selection else {
                    outbox.error(user, ErrorCode::InvalidAction);
                    return;
                };
                if swap && Self::swap_cards(inner, first, second).is_err() {
                    outbox.error(user, ErrorCode::InvalidIndex);
                    return;
                }
                swap
            }
            (_, SpecialActionInput::Skip) => false,
            _ => {
                outbox.error(user, ErrorCode::InvalidAction);
                return;
            }
        };

        let ability = special.ability;
        inner.special = None;
        outbox.broadcast(ServerMessage::SpecialActionDone {
            user_id: user,
            ability,
            completed,
        });
        self.record(
            inner,
            outbox,
            Some(user),
            action_types::SPECIAL_ACTION,
            serde_json::json!({ "ability": ability, "completed": completed }),
        );
        self.drain_pending_snaps(inner, outbox);
        self.finish_turn(inner, outbox);
    }

    fn drain_pending_snaps(self: &Arc<Self>, inner: &mut GameInner, outbox: &mut Outbox) {
        let pending = std::mem::take(&mut inner.pending_snaps);
        for (user, idx) in pending {
            if inner.game_over {
                break;
            }
            self.resolve_snap(inner, outbox, user, idx);
        }
    }

    // -- Turn lifecycle --

    /// The current player completed their turn by a deliberate action.
    fn finish_turn(self: &Arc<Self>, inner: &mut GameInner, outbox: &mut Outbox) {
        let actor = inner.players[inner.current_idx].user_id;
        inner.players[inner.current_idx].consecutive_timeouts = 0;
        if let Some(rotation) = inner.final_rotation.as_mut() {
            rotation.remove(&actor);
        }
        self.advance_turn(inner, outbox);
    }

    fn advance_turn(self: &Arc<Self>, inner: &mut GameInner, outbox: &mut Outbox) {
        if inner.game_over {
            return;
        }
        if matches!(inner.final_rotation.as_ref(), Some(r) if r.is_empty()) {
            self.end_game(inner, outbox, GameEndReason::CambiaCall);
            return;
        }
        let n = inner.players.len();
        let active = inner.players.iter().filter(|p| !p.forfeited).count();
        if active < 2 {
            self.end_game(inner, outbox, GameEndReason::Forfeit);
            return;
        }
        let mut next = inner.current_idx;
        loop {
            next = (next + 1) % n;
            if !inner.players[next].forfeited {
                break;
            }
        }
        inner.current_idx = next;
        inner.turn_id += 1;
        inner.phase = TurnPhase::AwaitingDraw;
        outbox.broadcast(ServerMessage::TurnChange {
            user_id: inner.players[next].user_id,
            turn_id: inner.turn_id,
        });
        self.arm_turn_timer(inner);
    }

    // -- Turn timer --

    /// (Re)arm the timer for the current turn. The callback captures this
    /// turn's id; a firing for any other turn is stale and ignored.
    fn arm_turn_timer(self: &Arc<Self>, inner: &mut GameInner) {
        if let Some(handle) = inner.turn_timer.take() {
            handle.abort();
        }
        let secs = inner.house_rules.turn_timer_sec;
        if secs == 0 {
            return;
        }
        let game = Arc::clone(self);
        let armed_turn = inner.turn_id;
        inner.turn_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(u64::from(secs))).await;
            game.turn_timer_fired(armed_turn).await;
        }));
    }

    async fn turn_timer_fired(self: &Arc<Self>, armed_turn: u64) {
        let mut outbox = Outbox::new();
        let sinks;
        {
            let mut inner = self.inner.lock().await;
            if inner.game_over || !inner.started || inner.turn_id != armed_turn {
                return;
            }
            let idx = inner.current_idx;
            let user = inner.players[idx].user_id;

            // An ability waiting on input is forfeited by the timeout.
            if let Some(special) = inner.special.take() {
                outbox.broadcast(ServerMessage::SpecialActionDone {
                    user_id: special.actor_id,
                    ability: special.ability,
                    completed: false,
                });
            }

            inner.players[idx].consecutive_timeouts += 1;
            let consecutive = inner.players[idx].consecutive_timeouts;
            let forfeited = consecutive >= inner.house_rules.auto_kick_turn_count;

            outbox.broadcast(ServerMessage::TurnTimeout {
                user_id: user,
                consecutive,
                forfeited,
            });
            self.record(
                &mut inner,
                &mut outbox,
                Some(user),
                action_types::TURN_TIMEOUT,
                serde_json::json!({ "consecutive": consecutive, "forfeited": forfeited }),
            );

            // Auto-discard a held drawn card before the seat moves on.
            if let Some(card) = inner.players[idx].drawn.take() {
                inner.players[idx].drawn_from_discard = false;
                inner.discard.push(card);
                outbox.broadcast(ServerMessage::PlayerDiscard {
                    user_id: user,
                    card,
                });
                self.record(
                    &mut inner,
                    &mut outbox,
                    Some(user),
                    action_types::DISCARD_DRAWN,
                    serde_json::json!({ "card": card, "timeout": true }),
                );
            }

            if forfeited {
                self.forfeit_player(&mut inner, idx);
            }
            if let Some(rotation) = inner.final_rotation.as_mut() {
                rotation.remove(&user);
            }
            self.drain_pending_snaps(&mut inner, &mut outbox);
            self.advance_turn(&mut inner, &mut outbox);
            if !inner.game_over {
                self.check_invariants(&mut inner, &mut outbox);
            }
            sinks = inner.sinks.clone();
        }
        self.dispatch(outbox, sinks).await;
    }

    fn forfeit_player(&self, inner: &mut GameInner, idx: usize) {
        let user = inner.players[idx].user_id;
        inner.players[idx].forfeited = true;
        inner.players[idx].connected = false;
        if let Some(rotation) = inner.final_rotation.as_mut() {
            rotation.remove(&user);
        }
    }

    // -- Connection lifecycle --

    /// Re-bind a returning player's connection and resync them privately.
    pub async fn reconnect(self: &Arc<Self>, user: UserId, conn: Connection) -> Result<(), ErrorCode> {
        let mut outbox = Outbox::new();
        let sinks;
        {
            let mut inner = self.inner.lock().await;
            let Some(pos) = inner.players.iter().position(|p| p.user_id == user) else {
                return Err(ErrorCode::NotInLobby);
            };
            if inner.house_rules.forfeit_on_disconnect && inner.players[pos].forfeited {
                return Err(ErrorCode::ReconnectionRejected);
            }
            inner.sinks.insert(user, conn);
            inner.players[pos].connected = true;
            if !inner.house_rules.forfeit_on_disconnect {
                inner.players[pos].consecutive_timeouts = 0;
            }
            let state = obfuscate::project(self.id, &inner, user);
            outbox.to(user, ServerMessage::GameState(Box::new(state)));
            outbox.broadcast(ServerMessage::PlayerReconnect { user_id: user });
            self.record(
                &mut inner,
                &mut outbox,
                Some(user),
                action_types::RECONNECT,
                serde_json::Value::Null,
            );
            sinks = inner.sinks.clone();
        }
        self.dispatch(outbox, sinks).await;
        Ok(())
    }

    /// A player's socket dropped mid-game.
    pub async fn player_disconnected(self: &Arc<Self>, user: UserId) {
        let mut outbox = Outbox::new();
        let sinks;
        {
            let mut inner = self.inner.lock().await;
            if inner.game_over {
                return;
            }
            let Some(pos) = inner.players.iter().position(|p| p.user_id == user) else {
                return;
            };
            inner.players[pos].connected = false;
            self.record(
                &mut inner,
                &mut outbox,
                Some(user),
                action_types::DISCONNECT,
                serde_json::Value::Null,
            );
            if inner.house_rules.forfeit_on_disconnect && !inner.players[pos].forfeited {
                self.forfeit_player(&mut inner, pos);
                if inner.special.as_ref().map(|s| s.actor_id) == Some(user) {
                    if let Some(special) = inner.special.take() {
                        outbox.broadcast(ServerMessage::SpecialActionDone {
                            user_id: special.actor_id,
                            ability: special.ability,
                            completed: false,
                        });
                    }
                    self.drain_pending_snaps(&mut inner, &mut outbox);
                }
                if inner.started && inner.current_idx == pos {
                    // Return any held card to the discard before skipping the seat.
                    if let Some(card) = inner.players[pos].drawn.take() {
                        inner.players[pos].drawn_from_discard = false;
                        inner.discard.push(card);
                        outbox.broadcast(ServerMessage::PlayerDiscard {
                            user_id: user,
                            card,
                        });
                    }
                    self.advance_turn(&mut inner, &mut outbox);
                }
            }
            sinks = inner.sinks.clone();
        }
        self.dispatch(outbox, sinks).await;
    }

    // -- Endgame --

    fn end_game(self: &Arc<Self>, inner: &mut GameInner, outbox: &mut Outbox, reason: GameEndReason) {
        if inner.game_over {
            return;
        }
        inner.game_over = true;
        inner.special = None;
        inner.pending_snaps.clear();
        if let Some(handle) = inner.turn_timer.take() {
            handle.abort();
        }

        let caller = inner.cambia_caller_id;
        let penalty = inner.circuit.false_cambia_penalty;
        let mut scores: Vec<PlayerScore> = inner
            .players
            .iter()
            .map(|p| PlayerScore {
                user_id: p.user_id,
                username: p.username.clone(),
                score: rules::score_hand(&p.hand),
                hand: p.hand.clone(),
                called_cambia: p.has_called_cambia,
                forfeited: p.forfeited,
            })
            .collect();

        let winner_id = Self::decide_winner(inner, &mut scores, caller, penalty, reason);

        let payload = GameOverPayload {
            game_id: self.id,
            winner_id,
            reason,
            scores,
        };
        outbox.broadcast(ServerMessage::GameOver(Box::new(payload.clone())));
        self.record(
            inner,
            outbox,
            None,
            action_types::END_GAME,
            serde_json::to_value(&payload).unwrap_or(serde_json::Value::Null),
        );
        outbox.finished = true;
    }

    /// Winner per the cambia scoring rule. A caller wins only with a strictly
    /// lowest score; otherwise they take the false-cambia penalty and the
    /// lowest remaining scorer wins, ties broken by seat order after the
    /// caller's seat.
    fn decide_winner(
        inner: &GameInner,
        scores: &mut [PlayerScore],
        caller: Option<UserId>,
        false_cambia_penalty: i32,
        reason: GameEndReason,
    ) -> Option<UserId> {
        let active = |s: &PlayerScore| !s.forfeited;

        if reason == GameEndReason::Aborted {
            return None;
        }

        if let Some(caller_id) = caller {
            let caller_score = scores
                .iter()
                .find(|s| s.user_id == caller_id)
                .map(|s| s.score)?;
            let beaten = scores
                .iter()
                .filter(|s| active(s) && s.user_id != caller_id)
                .all(|s| caller_score < s.score);
            if beaten {
                return Some(caller_id);
            }
            if let Some(s) = scores.iter_mut().find(|s| s.user_id == caller_id) {
                s.score += false_cambia_penalty;
            }
            // Seat order after the caller breaks ties.
            let caller_seat = inner
                .players
                .iter()
                .position(|p| p.user_id == caller_id)
                .unwrap_or(0);
            let n = inner.players.len();
            let mut best: Option<(i32, UserId)> = None;
            for offset in 1..=n {
                let seat = (caller_seat + offset) % n;
                let user = inner.players[seat].user_id;
                let Some(s) = scores.iter().find(|s| s.user_id == user && active(s)) else {
                    continue;
                };
                if best.is_none_or(|(b, _)| s.score < b) {
                    best = Some((s.score, user));
                }
            }
            return best.map(|(_, u)| u);
        }

        // No caller: lowest active score wins, seat order breaks ties.
        scores
            .iter()
            .filter(|s| active(s))
            .min_by_key(|s| s.score)
            .map(|s| s.user_id)
    }

    // -- Shared helpers --

    /// Move every discard card except the publicly visible top back into the
    /// deck and shuffle.
    fn reshuffle_discard_into_deck(inner: &mut GameInner) {
        if inner.discard.len() <= 1 {
            return;
        }
        let top = inner.discard.pop().unwrap_or_else(|| unreachable!());
        inner.deck.append(&mut inner.discard);
        inner.discard.push(top);
        let mut deck = std::mem::take(&mut inner.deck);
        rules::shuffle(&mut deck, &mut inner.rng);
        inner.deck = deck;
    }

    fn card_at(inner: &GameInner, user: UserId, idx: usize) -> Option<Card> {
        inner
            .players
            .iter()
            .find(|p| p.user_id == user)
            .and_then(|p| p.hand.get(idx))
            .copied()
    }

    fn swap_cards(
        inner: &mut GameInner,
        (a_user, a_idx): (UserId, usize),
        (b_user, b_idx): (UserId, usize),
    ) -> Result<(), ()> {
        let a_pos = inner.players.iter().position(|p| p.user_id == a_user).ok_or(())?;
        let b_pos = inner.players.iter().position(|p| p.user_id == b_user).ok_or(())?;
        if a_idx >= inner.players[a_pos].hand.len() || b_idx >= inner.players[b_pos].hand.len() {
            return Err(());
        }
        if a_pos == b_pos {
            if a_idx == b_idx {
                return Ok(());
            }
            inner.players[a_pos].hand.swap(a_idx, b_idx);
            return Ok(());
        }
        let (lo, hi) = if a_pos < b_pos { (a_pos, b_pos) } else { (b_pos, a_pos) };
        let (left, right) = inner.players.split_at_mut(hi);
        let (first, second) = if a_pos < b_pos {
            (&mut left[lo].hand[a_idx], &mut right[0].hand[b_idx])
        } else {
            (&mut right[0].hand[a_idx], &mut left[lo].hand[b_idx])
        };
        std::mem::swap(first, second);
        Ok(())
    }

    /// Verify the legality of a turn-scoped action for `user`.
    fn expect_turn(
        &self,
        inner: &GameInner,
        outbox: &mut Outbox,
        user: UserId,
        phase: TurnPhase,
    ) -> bool {
        if !inner.started {
            outbox.error(user, ErrorCode::InvalidAction);
            return false;
        }
        if inner.players[inner.current_idx].user_id != user {
            outbox.error(user, ErrorCode::NotYourTurn);
            return false;
        }
        if inner.phase != phase {
            outbox.error(user, ErrorCode::InvalidAction);
            return false;
        }
        true
    }

    /// Card-conservation check. The multiset of identities is fixed at deal
    /// time; a count mismatch means the aggregate is corrupt and the game is
    /// aborted rather than allowed to limp on.
    fn check_invariants(self: &Arc<Self>, inner: &mut GameInner, outbox: &mut Outbox) {
        let in_hands: usize = inner.players.iter().map(|p| p.hand.len()).sum();
        let held: usize = inner.players.iter().filter(|p| p.drawn.is_some()).count();
        let total = inner.deck.len() + inner.discard.len() + in_hands + held;
        if total != inner.initial_card_count {
            tracing::error!(
                game_id = %self.id,
                total,
                expected = inner.initial_card_count,
                "card conservation violated, aborting game"
            );
            self.end_game(inner, outbox, GameEndReason::Aborted);
        }
    }

    fn record(
        &self,
        inner: &mut GameInner,
        outbox: &mut Outbox,
        actor: Option<UserId>,
        action_type: &str,
        payload: serde_json::Value,
    ) {
        let record = ActionRecord {
            game_id: self.id,
            action_index: inner.action_index,
            actor_user_id: actor,
            action_type: action_type.to_string(),
            action_payload: payload,
            timestamp: chrono::Utc::now(),
        };
        inner.action_index += 1;
        outbox.records.push(record);
    }

    /// Deliver collected events and records with the game lock released.
    /// Sends are non-blocking; a saturated or closed client sink never stalls
    /// the game.
    async fn dispatch(self: &Arc<Self>, outbox: Outbox, sinks: HashMap<UserId, Connection>) {
        for (recipient, msg) in outbox.events {
            match recipient {
                Recipient::All => {
                    for conn in sinks.values() {
                        conn.send(msg.clone());
                    }
                }
                Recipient::One(user) => {
                    if let Some(conn) = sinks.get(&user) {
                        conn.send(msg.clone());
                    }
                }
            }
        }
        for record in outbox.records {
            if let Err(err) = self.queue.enqueue(record) {
                tracing::warn!(game_id = %self.id, error = %err, "failed to enqueue action record");
            }
        }
        if outbox.finished {
            (self.on_game_over)(self.id);
        }
    }

    /// Read-locked obfuscated projection for `viewer`.
    pub async fn obfuscated_state_for(&self, viewer: UserId) -> obfuscate::ObfGameState {
        let inner = self.inner.lock().await;
        obfuscate::project(self.id, &inner, viewer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::cards::{Rank, Suit};
    use crate::protocol::ClientMessage;
    use crate::queue::InMemoryActionQueue;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    struct Harness {
        game: Arc<Game>,
        users: Vec<UserId>,
        rxs: Vec<mpsc::Receiver<Arc<ServerMessage>>>,
        queue: Arc<InMemoryActionQueue>,
        finished: Arc<AtomicBool>,
    }

    impl Harness {
        /// Drain everything currently queued for seat `i`.
        fn drain(&mut self, i: usize) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rxs[i].try_recv() {
                out.push((*msg).clone());
            }
            out
        }

        fn drain_all(&mut self) {
            for i in 0..self.rxs.len() {
                self.drain(i);
            }
        }

        async fn send(&self, i: usize, msg: ClientMessage) {
            self.game.handle_message(self.users[i], msg).await;
        }

        async fn records(&self) -> Vec<ActionRecord> {
            let mut out = Vec::new();
            while let Ok(Some(record)) = self
                .queue
                .dequeue(Duration::from_millis(5))
                .await
            {
                out.push(record);
            }
            out
        }
    }

    fn build(seats: usize, mutate_rules: impl FnOnce(&mut LobbyRules)) -> Harness {
        let mut rules = LobbyRules::default();
        rules.house_rules.turn_timer_sec = 0; // timers covered separately
        mutate_rules(&mut rules);

        let mut users = Vec::new();
        let mut rxs = Vec::new();
        let mut game_seats = Vec::new();
        for i in 0..seats {
            let user = Uuid::new_v4();
            let (conn, rx) = Connection::new(user, 256);
            users.push(user);
            rxs.push(rx);
            game_seats.push(GameSeat {
                user_id: user,
                username: format!("player-{i}"),
                conn,
            });
        }
        // Seats sort by user id at construction; mirror that order here so
        // index N in the harness is seat N in the game.
        let mut order: Vec<usize> = (0..seats).collect();
        order.sort_by_key(|&i| users[i]);
        let users: Vec<UserId> = order.iter().map(|&i| users[i]).collect();
        let mut taken: Vec<Option<mpsc::Receiver<Arc<ServerMessage>>>> =
            rxs.into_iter().map(Some).collect();
        let rxs: Vec<mpsc::Receiver<Arc<ServerMessage>>> = order
            .iter()
            .map(|&i| taken[i].take().unwrap_or_else(|| unreachable!()))
            .collect();
        game_seats.sort_by_key(|s| s.user_id);

        let queue = Arc::new(InMemoryActionQueue::new());
        let finished = Arc::new(AtomicBool::new(false));
        let finished_clone = Arc::clone(&finished);
        let game = Game::new(
            &rules,
            game_seats,
            queue.clone(),
            GameConfig {
                pregame_reveal: Duration::from_millis(250),
                shuffle_seed: Some(7),
            },
            Box::new(move |_| finished_clone.store(true, Ordering::SeqCst)),
        );
        Harness {
            game,
            users,
            rxs,
            queue,
            finished,
        }
    }

    /// Skip the pregame window and make seat 0 current.
    async fn begin(h: &Harness) {
        h.game.begin_turns().await;
    }

    fn card(rank: Rank, suit: Suit) -> Card {
        Card::new(rank, Some(suit))
    }

    /// Overwrite hands/deck/discard with a crafted position and fix the
    /// conservation baseline to match.
    async fn craft(
        h: &Harness,
        hands: Vec<Vec<Card>>,
        deck: Vec<Card>,
        discard: Vec<Card>,
    ) {
        let mut inner = h.game.inner.lock().await;
        for (player, hand) in inner.players.iter_mut().zip(hands) {
            player.hand = hand;
        }
        inner.deck = deck;
        inner.discard = discard;
        inner.initial_card_count = inner.deck.len()
            + inner.discard.len()
            + inner.players.iter().map(|p| p.hand.len()).sum::<usize>();
    }

    fn contains_game_over(events: &[ServerMessage]) -> Option<GameOverPayload> {
        events.iter().find_map(|e| match e {
            ServerMessage::GameOver(p) => Some((**p).clone()),
            _ => None,
        })
    }

    #[tokio::test]
    async fn pregame_reveals_bottom_two_cards_privately() {
        let mut h = build(2, |_| {});
        h.game.start().await;

        for seat in 0..2 {
            let events = h.drain(seat);
            let reveals: Vec<_> = events
                .iter()
                .filter_map(|e| match e {
                    ServerMessage::PrivateReveal {
                        location: RevealLocation::Hand { user_id, idx },
                        ..
                    } => Some((*user_id, *idx)),
                    _ => None,
                })
                .collect();
            assert_eq!(
                reveals,
                vec![(h.users[seat], 2), (h.users[seat], 3)],
                "each seat sees exactly its own bottom two cards"
            );
        }

        // No moves are accepted during the reveal window.
        h.send(0, ClientMessage::DrawStockpile).await;
        let events = h.drain(0);
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerMessage::Error { code, .. } if *code == ErrorCode::InvalidAction)));
    }

    #[tokio::test]
    async fn draw_then_discard_advances_the_turn() {
        let mut h = build(2, |_| {});
        begin(&h).await;
        h.drain_all();

        h.send(0, ClientMessage::DrawStockpile).await;
        let events = h.drain(0);
        assert!(events.iter().any(|e| matches!(
            e,
            ServerMessage::PlayerDraw { from_discard: false, card: None, .. }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            ServerMessage::PrivateReveal { location: RevealLocation::Drawn, .. }
        )));
        // The other seat never saw the drawn card.
        let other = h.drain(1);
        assert!(!other
            .iter()
            .any(|e| matches!(e, ServerMessage::PrivateReveal { .. })));

        // Craft ensures no ability on the drawn card path below.
        h.send(0, ClientMessage::DiscardDrawn).await;
        let events = h.drain(1);
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerMessage::PlayerDiscard { .. })));
    }

    #[tokio::test]
    async fn replace_with_abilities_disabled_fires_no_ability() {
        // Scenario: allow_replace_abilities=false, the ejected card would
        // otherwise trigger a peek.
        let mut h = build(2, |r| {
            r.house_rules.allow_replace_abilities = false;
        });
        begin(&h).await;
        craft(
            &h,
            vec![
                vec![
                    card(Rank::Seven, Suit::Clubs), // ability rank, ejected by replace
                    card(Rank::Three, Suit::Diamonds),
                    card(Rank::Two, Suit::Spades),
                    card(Rank::Four, Suit::Hearts),
                ],
                vec![
                    card(Rank::Five, Suit::Clubs),
                    card(Rank::Six, Suit::Clubs),
                    card(Rank::Two, Suit::Hearts),
                    card(Rank::Three, Suit::Hearts),
                ],
            ],
            vec![card(Rank::Nine, Suit::Spades)],
            vec![],
        )
        .await;
        h.drain_all();

        h.send(0, ClientMessage::DrawStockpile).await;
        h.send(0, ClientMessage::Replace { idx: 0 }).await;
        let events = h.drain(1);
        let replaced = events.iter().any(|e| {
            matches!(e, ServerMessage::PlayerReplace { idx: 0, discarded, .. }
                if discarded.rank == Rank::Seven)
        });
        assert!(replaced, "the ejected seven is publicly discarded");
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, ServerMessage::SpecialActionPrompt { .. })),
            "no ability fires on the replace path"
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerMessage::TurnChange { user_id, .. } if *user_id == h.users[1])));
    }

    #[tokio::test]
    async fn discarding_an_ability_card_prompts_and_peeks() {
        let mut h = build(2, |_| {});
        begin(&h).await;
        craft(
            &h,
            vec![
                vec![
                    card(Rank::Two, Suit::Clubs),
                    card(Rank::Three, Suit::Clubs),
                    card(Rank::Four, Suit::Clubs),
                    card(Rank::Five, Suit::Clubs),
                ],
                vec![
                    card(Rank::Two, Suit::Hearts),
                    card(Rank::Three, Suit::Hearts),
                    card(Rank::Four, Suit::Hearts),
                    card(Rank::Five, Suit::Hearts),
                ],
            ],
            vec![card(Rank::Eight, Suit::Spades)], // drawn, then discarded
            vec![],
        )
        .await;
        h.drain_all();

        h.send(0, ClientMessage::DrawStockpile).await;
        h.send(0, ClientMessage::DiscardDrawn).await;
        let events = h.drain(1);
        assert!(events.iter().any(|e| matches!(
            e,
            ServerMessage::SpecialActionPrompt { ability: Ability::PeekOwn, .. }
        )));

        // Illegal index leaves the ability open.
        h.send(
            0,
            ClientMessage::SpecialAction {
                input: SpecialActionInput::PeekOwn { idx: 99 },
            },
        )
        .await;
        let errors = h.drain(0);
        assert!(errors
            .iter()
            .any(|e| matches!(e, ServerMessage::Error { code, .. } if *code == ErrorCode::InvalidIndex)));

        h.send(
            0,
            ClientMessage::SpecialAction {
                input: SpecialActionInput::PeekOwn { idx: 1 },
            },
        )
        .await;
        let mine = h.drain(0);
        assert!(mine.iter().any(|e| matches!(
            e,
            ServerMessage::PrivateReveal {
                card: c,
                location: RevealLocation::Hand { idx: 1, .. }
            } if c.rank == Rank::Three
        )));
        let theirs = h.drain(1);
        assert!(
            !theirs
                .iter()
                .any(|e| matches!(e, ServerMessage::PrivateReveal { .. })),
            "peek reveals to the actor only"
        );
        assert!(theirs
            .iter()
            .any(|e| matches!(e, ServerMessage::SpecialActionDone { completed: true, .. })));
    }

    #[tokio::test]
    async fn cambia_caller_with_lowest_score_wins() {
        // Three players with hand sums 5, 8, 7; seat 0 calls.
        let mut h = build(3, |_| {});
        begin(&h).await;
        craft(
            &h,
            vec![
                vec![card(Rank::Two, Suit::Clubs), card(Rank::Three, Suit::Clubs)], // 5
                vec![card(Rank::Five, Suit::Hearts), card(Rank::Three, Suit::Hearts)], // 8
                vec![card(Rank::Four, Suit::Spades), card(Rank::Three, Suit::Spades)], // 7
            ],
            vec![
                card(Rank::Two, Suit::Diamonds),
                card(Rank::Four, Suit::Diamonds),
                card(Rank::Five, Suit::Diamonds),
            ],
            vec![],
        )
        .await;
        h.drain_all();

        h.send(0, ClientMessage::CallCambia).await;
        // Seats 1 and 2 draw-and-discard; their sums stay put.
        h.send(1, ClientMessage::DrawStockpile).await;
        h.send(1, ClientMessage::DiscardDrawn).await;
        h.send(2, ClientMessage::DrawStockpile).await;
        h.send(2, ClientMessage::DiscardDrawn).await;

        let events = h.drain(0);
        let over = contains_game_over(&events).expect("game_over after the final rotation");
        assert_eq!(over.reason, GameEndReason::CambiaCall);
        assert_eq!(over.winner_id, Some(h.users[0]));
        let caller_score = over
            .scores
            .iter()
            .find(|s| s.user_id == h.users[0])
            .unwrap()
            .score;
        assert_eq!(caller_score, 5);
        assert!(h.finished.load(Ordering::SeqCst));

        // Exactly one game_over per observer.
        let count = events
            .iter()
            .filter(|e| matches!(e, ServerMessage::GameOver(_)))
            .count();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn false_cambia_penalizes_the_caller() {
        let mut h = build(2, |_| {});
        begin(&h).await;
        craft(
            &h,
            vec![
                vec![card(Rank::Five, Suit::Clubs), card(Rank::Three, Suit::Clubs)], // 8
                vec![card(Rank::Two, Suit::Hearts), card(Rank::Three, Suit::Hearts)], // 5
            ],
            vec![card(Rank::Four, Suit::Diamonds)],
            vec![],
        )
        .await;
        h.drain_all();

        h.send(0, ClientMessage::CallCambia).await;
        h.send(1, ClientMessage::DrawStockpile).await;
        h.send(1, ClientMessage::DiscardDrawn).await;

        let events = h.drain(1);
        let over = contains_game_over(&events).expect("game over");
        assert_eq!(over.winner_id, Some(h.users[1]));
        let caller = over
            .scores
            .iter()
            .find(|s| s.user_id == h.users[0])
            .unwrap();
        // 8 plus the default false-cambia penalty of 5.
        assert_eq!(caller.score, 13);
        assert!(caller.called_cambia);
    }

    #[tokio::test]
    async fn cambia_is_only_legal_before_drawing() {
        let mut h = build(2, |_| {});
        begin(&h).await;
        h.drain_all();

        h.send(0, ClientMessage::DrawStockpile).await;
        h.send(0, ClientMessage::CallCambia).await;
        let events = h.drain(0);
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerMessage::Error { code, .. } if *code == ErrorCode::InvalidAction)));
    }

    #[tokio::test]
    async fn snap_success_moves_the_card_and_failure_draws_penalty() {
        let mut h = build(2, |r| {
            r.house_rules.penalty_draw_count = 2;
        });
        begin(&h).await;
        craft(
            &h,
            vec![
                vec![card(Rank::Five, Suit::Hearts), card(Rank::Nine, Suit::Clubs)],
                vec![card(Rank::Six, Suit::Hearts), card(Rank::Ten, Suit::Clubs)],
            ],
            vec![
                card(Rank::Ace, Suit::Clubs),
                card(Rank::Two, Suit::Diamonds),
                card(Rank::Three, Suit::Diamonds),
            ],
            vec![card(Rank::Five, Suit::Spades)],
        )
        .await;
        h.drain_all();

        // Seat 0 snaps a true rank match (not even their turn-holder; snap is
        // asynchronous to turns).
        h.send(0, ClientMessage::Snap { idx: 0 }).await;
        let events = h.drain(1);
        assert!(events.iter().any(|e| matches!(
            e,
            ServerMessage::SnapSuccess { user_id, card: c } if *user_id == h.users[0] && c.rank == Rank::Five
        )));

        // Seat 1 snaps a mismatch and draws the penalty.
        h.send(1, ClientMessage::Snap { idx: 1 }).await;
        let events = h.drain(0);
        assert!(events.iter().any(|e| matches!(
            e,
            ServerMessage::SnapFail { user_id, penalty_cards: 2 } if *user_id == h.users[1]
        )));
        let state = h.game.obfuscated_state_for(h.users[1]).await;
        let me = state
            .players
            .iter()
            .find(|p| p.user_id == h.users[1])
            .unwrap();
        assert_eq!(me.hand_size, 4); // 2 - 0 + 2 penalty
    }

    #[tokio::test]
    async fn snap_during_an_ability_is_queued_until_it_completes() {
        let mut h = build(2, |_| {});
        begin(&h).await;
        craft(
            &h,
            vec![
                vec![card(Rank::Two, Suit::Clubs), card(Rank::Three, Suit::Clubs)],
                vec![card(Rank::Jack, Suit::Hearts), card(Rank::Four, Suit::Hearts)],
            ],
            vec![card(Rank::Jack, Suit::Spades)], // drawn then discarded: blind swap prompt
            vec![],
        )
        .await;
        h.drain_all();

        h.send(0, ClientMessage::DrawStockpile).await;
        h.send(0, ClientMessage::DiscardDrawn).await;
        // Discard top is now J♠; seat 1 holds J♥ and snaps mid-ability.
        h.send(1, ClientMessage::Snap { idx: 0 }).await;
        let quiet = h.drain(0);
        assert!(
            !quiet
                .iter()
                .any(|e| matches!(e, ServerMessage::SnapSuccess { .. } | ServerMessage::SnapFail { .. })),
            "snap must not resolve while the ability is open"
        );

        h.send(
            0,
            ClientMessage::SpecialAction {
                input: SpecialActionInput::Skip,
            },
        )
        .await;
        let events = h.drain(0);
        assert!(events.iter().any(|e| matches!(
            e,
            ServerMessage::SnapSuccess { user_id, .. } if *user_id == h.users[1]
        )));
    }

    #[tokio::test]
    async fn stockpile_draw_reshuffles_discard_keeping_the_top() {
        let mut h = build(2, |_| {});
        begin(&h).await;
        craft(
            &h,
            vec![
                vec![card(Rank::Two, Suit::Clubs)],
                vec![card(Rank::Three, Suit::Clubs)],
            ],
            vec![], // stockpile empty
            vec![
                card(Rank::Four, Suit::Hearts),
                card(Rank::Five, Suit::Hearts),
                card(Rank::Six, Suit::Hearts), // top stays
            ],
        )
        .await;
        h.drain_all();

        h.send(0, ClientMessage::DrawStockpile).await;
        let state = h.game.obfuscated_state_for(h.users[0]).await;
        assert_eq!(state.discard_size, 1);
        assert_eq!(state.discard_top.unwrap().rank, Rank::Six);
        // Two reshuffled in, one drawn out.
        assert_eq!(state.stockpile_size, 1);
        let me = state.players.iter().find(|p| p.user_id == h.users[0]).unwrap();
        assert!(me.drawn.is_some());
    }

    #[tokio::test]
    async fn exhausted_piles_end_the_game_with_current_hands() {
        let mut h = build(2, |_| {});
        begin(&h).await;
        craft(
            &h,
            vec![
                vec![card(Rank::Two, Suit::Clubs)], // 2: winner
                vec![card(Rank::Nine, Suit::Clubs)], // 9
            ],
            vec![],
            vec![card(Rank::Six, Suit::Hearts)], // only the protected top remains
        )
        .await;
        h.drain_all();

        h.send(0, ClientMessage::DrawStockpile).await;
        let events = h.drain(1);
        let over = contains_game_over(&events).expect("deterministic ending");
        assert_eq!(over.reason, GameEndReason::DeckExhausted);
        assert_eq!(over.winner_id, Some(h.users[0]));
    }

    #[tokio::test]
    async fn action_indices_are_contiguous_from_zero() {
        let mut h = build(2, |_| {});
        h.game.start().await;
        tokio::time::sleep(Duration::from_millis(400)).await; // pregame elapses
        h.drain_all();

        h.send(0, ClientMessage::DrawStockpile).await;
        h.send(0, ClientMessage::DiscardDrawn).await;
        h.send(1, ClientMessage::DrawStockpile).await;
        h.send(1, ClientMessage::DiscardDrawn).await;

        let records = h.records().await;
        assert!(records.len() >= 4);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.action_index, i as u64);
            assert_eq!(record.game_id, h.game.id());
        }
        assert_eq!(records[0].action_type, action_types::GAME_START);
    }

    #[tokio::test]
    async fn card_conservation_holds_through_play() {
        let mut h = build(3, |_| {});
        begin(&h).await;
        h.drain_all();

        for round in 0..6 {
            let seat = round % 3;
            h.send(seat, ClientMessage::DrawStockpile).await;
            if round % 2 == 0 {
                h.send(seat, ClientMessage::DiscardDrawn).await;
            } else {
                h.send(seat, ClientMessage::Replace { idx: 0 }).await;
            }
            // Any ability left open would block the next turn; close it.
            h.send(
                seat,
                ClientMessage::SpecialAction {
                    input: SpecialActionInput::Skip,
                },
            )
            .await;

            let inner = h.game.inner.lock().await;
            let hands: usize = inner.players.iter().map(|p| p.hand.len()).sum();
            let held = inner.players.iter().filter(|p| p.drawn.is_some()).count();
            assert_eq!(
                inner.deck.len() + inner.discard.len() + hands + held,
                inner.initial_card_count
            );
            assert!(!inner.game_over);
        }
    }

    #[tokio::test]
    async fn obfuscated_projection_hides_other_hands() {
        let h = build(2, |_| {});
        begin(&h).await;

        let state = h.game.obfuscated_state_for(h.users[0]).await;
        assert_eq!(state.viewer_id, h.users[0]);
        let me = state.players.iter().find(|p| p.user_id == h.users[0]).unwrap();
        let other = state.players.iter().find(|p| p.user_id == h.users[1]).unwrap();
        assert_eq!(me.hand.as_ref().map(Vec::len), Some(rules::HAND_SIZE));
        assert!(other.hand.is_none(), "opponent cards are opaque");
        assert_eq!(other.hand_size, rules::HAND_SIZE);
        assert_eq!(state.stockpile_size, 54 - 2 * rules::HAND_SIZE);
    }

    #[tokio::test]
    async fn reconnect_rebinds_and_resyncs() {
        let mut h = build(2, |_| {});
        begin(&h).await;
        h.drain_all();

        h.game.player_disconnected(h.users[1]).await;
        let (conn, mut rx) = Connection::new(h.users[1], 256);
        h.game.reconnect(h.users[1], conn).await.unwrap();

        let mut got_state = false;
        while let Ok(msg) = rx.try_recv() {
            match &*msg {
                ServerMessage::GameState(state) => {
                    got_state = true;
                    assert_eq!(state.viewer_id, h.users[1]);
                }
                _ => {}
            }
        }
        assert!(got_state, "reconnect sends a private obfuscated state");
        let events = h.drain(0);
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerMessage::PlayerReconnect { user_id } if *user_id == h.users[1])));
    }

    #[tokio::test]
    async fn forfeit_on_disconnect_rejects_rebind() {
        let h = build(2, |r| {
            r.house_rules.forfeit_on_disconnect = true;
        });
        begin(&h).await;

        h.game.player_disconnected(h.users[1]).await;
        let (conn, _rx) = Connection::new(h.users[1], 256);
        let err = h.game.reconnect(h.users[1], conn).await.unwrap_err();
        assert_eq!(err, ErrorCode::ReconnectionRejected);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_turn_timer_never_times_out() {
        let mut h = build(2, |r| {
            r.house_rules.turn_timer_sec = 0;
        });
        begin(&h).await;
        h.drain_all();

        tokio::time::sleep(Duration::from_secs(3600)).await;
        let events = h.drain(0);
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, ServerMessage::TurnTimeout { .. })),
            "a disabled timer never fires"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_timeouts_forfeit_the_player() {
        let mut h = build(3, |r| {
            r.house_rules.turn_timer_sec = 5;
            r.house_rules.auto_kick_turn_count = 2;
        });
        begin(&h).await;
        h.drain_all();

        // Seat 0 sleeps through a full rotation twice.
        let mut timeouts = Vec::new();
        for _ in 0..8 {
            tokio::time::sleep(Duration::from_secs(6)).await;
            for e in h.drain(1) {
                if let ServerMessage::TurnTimeout {
                    user_id,
                    consecutive,
                    forfeited,
                } = e
                {
                    timeouts.push((user_id, consecutive, forfeited));
                }
            }
            let inner = h.game.inner.lock().await;
            if inner.players.iter().any(|p| p.forfeited) {
                break;
            }
        }
        let seat0: Vec<_> = timeouts
            .iter()
            .filter(|(u, _, _)| *u == h.users[0])
            .collect();
        assert!(seat0.len() >= 2);
        assert!(seat0.iter().any(|(_, c, f)| *c == 2 && *f));

        let inner = h.game.inner.lock().await;
        let p0 = inner.players.iter().find(|p| p.user_id == h.users[0]).unwrap();
        assert!(p0.forfeited);
        // The seat is skipped from now on.
        assert_ne!(inner.players[inner.current_idx].user_id, h.users[0]);
    }

    #[tokio::test]
    async fn king_peek_then_swap_flow() {
        let mut h = build(2, |_| {});
        begin(&h).await;
        let a0 = card(Rank::Two, Suit::Clubs);
        let b0 = card(Rank::Nine, Suit::Hearts);
        craft(
            &h,
            vec![
                vec![a0, card(Rank::Three, Suit::Clubs)],
                vec![b0, card(Rank::Four, Suit::Hearts)],
            ],
            vec![card(Rank::King, Suit::Spades)],
            vec![],
        )
        .await;
        h.drain_all();

        h.send(0, ClientMessage::DrawStockpile).await;
        h.send(0, ClientMessage::DiscardDrawn).await;
        h.send(
            0,
            ClientMessage::SpecialAction {
                input: SpecialActionInput::KingPeek {
                    first_user: h.users[0],
                    first_idx: 0,
                    second_user: h.users[1],
                    second_idx: 0,
                },
            },
        )
        .await;
        let reveals: Vec<_> = h
            .drain(0)
            .into_iter()
            .filter(|e| matches!(e, ServerMessage::PrivateReveal { .. }))
            .collect();
        assert_eq!(reveals.len(), 2, "both selections are revealed to the actor");

        h.send(
            0,
            ClientMessage::SpecialAction {
                input: SpecialActionInput::KingDecide { swap: true },
            },
        )
        .await;
        let events = h.drain(1);
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerMessage::SpecialActionDone { completed: true, .. })));

        let inner = h.game.inner.lock().await;
        assert_eq!(inner.players[0].hand[0], b0);
        assert_eq!(inner.players[1].hand[0], a0);
    }

    #[tokio::test]
    async fn wrong_turn_and_wrong_phase_are_rejected() {
        let mut h = build(2, |_| {});
        begin(&h).await;
        h.drain_all();

        h.send(1, ClientMessage::DrawStockpile).await;
        let events = h.drain(1);
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerMessage::Error { code, .. } if *code == ErrorCode::NotYourTurn)));

        h.send(0, ClientMessage::DiscardDrawn).await;
        let events = h.drain(0);
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerMessage::Error { code, .. } if *code == ErrorCode::InvalidAction)));
    }

    #[tokio::test]
    async fn draw_discard_honors_the_house_rule() {
        let mut h = build(2, |r| {
            r.house_rules.allow_draw_from_discard_pile = true;
        });
        begin(&h).await;
        craft(
            &h,
            vec![
                vec![card(Rank::Two, Suit::Clubs)],
                vec![card(Rank::Three, Suit::Clubs)],
            ],
            vec![card(Rank::Four, Suit::Diamonds)],
            vec![card(Rank::Seven, Suit::Hearts)],
        )
        .await;
        h.drain_all();

        h.send(0, ClientMessage::DrawDiscard).await;
        let events = h.drain(1);
        assert!(events.iter().any(|e| matches!(
            e,
            ServerMessage::PlayerDraw { from_discard: true, card: Some(c), .. }
                if c.rank == Rank::Seven
        )));

        // A card taken from the discard re-discarded fires no ability even
        // though a seven normally peeks.
        h.send(0, ClientMessage::DiscardDrawn).await;
        let events = h.drain(0);
        assert!(!events
            .iter()
            .any(|e| matches!(e, ServerMessage::SpecialActionPrompt { .. })));
    }
}
