//! Ephemeral lobby aggregates.
//!
//! A lobby is a purely in-memory gathering place: membership, readiness, a
//! cancellable start countdown, rule editing, and chat fan-out. When the
//! countdown fires it constructs a [`Game`] from its members and flips to
//! in-game. The last connection leaving disposes the lobby through its
//! `on_empty` callback.
//!
//! Locking discipline: every mutating method prepares its broadcasts under
//! the lobby lock and delivers them after releasing it, so an inbound
//! handler re-entering the aggregate can never deadlock against a fan-out.

mod store;

pub use store::LobbyStore;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use uuid::Uuid;

use crate::game::{Game, GameConfig, GameSeat};
use crate::protocol::messages::{LobbyMemberInfo, LobbyStatePayload};
use crate::protocol::{
    ChatPayload, ErrorCode, LobbyId, LobbyRules, LobbyType, RulesPatch, ServerMessage, UserId,
};
use crate::queue::ActionQueue;
use crate::server::Connection;
use crate::users::UserStore;

/// Outcome of binding a socket to a lobby.
pub enum BindOutcome {
    /// Joined (or rejoined) the lobby floor
    Lobby,
    /// The lobby is mid-game and this user holds a seat: the caller must
    /// complete the rebind through [`Game::reconnect`]
    Reconnect(Arc<Game>),
    /// Refused; the socket should receive the error and close
    Rejected(ErrorCode),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Membership {
    Invited,
    Joined { username: String },
}

struct CountdownTimer {
    generation: u64,
    fired: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct LobbyInner {
    host_id: UserId,
    lobby_type: LobbyType,
    game_mode: String,
    members: HashMap<UserId, Membership>,
    connections: HashMap<UserId, Connection>,
    ready: HashSet<UserId>,
    rules: LobbyRules,
    countdown: Option<CountdownTimer>,
    /// Monotone source for countdown generations; stale firings compare
    /// against the live generation and are ignored
    countdown_generation: u64,
    in_game: bool,
    game: Option<Arc<Game>>,
    on_empty_fired: bool,
}

/// Pending deliveries collected under the lobby lock.
#[derive(Default)]
struct Fanout {
    all: Vec<Arc<ServerMessage>>,
    targeted: Vec<(UserId, Arc<ServerMessage>)>,
}

impl Fanout {
    fn broadcast(&mut self, msg: ServerMessage) {
        self.all.push(Arc::new(msg));
    }

    fn to(&mut self, user: UserId, msg: ServerMessage) {
        self.targeted.push((user, Arc::new(msg)));
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

/// Knobs a lobby needs beyond its rules object.
#[derive(Clone)]
pub struct LobbySettings {
    pub countdown_secs: u32,
    pub user_lookup_timeout: Duration,
    pub game_config: GameConfig,
}

impl Default for LobbySettings {
    fn default() -> Self {
        Self {
            countdown_secs: 10,
            user_lookup_timeout: Duration::from_secs(2),
            game_config: GameConfig::default(),
        }
    }
}

pub struct Lobby {
    pub id: LobbyId,
    users: Arc<dyn UserStore>,
    queue: Arc<dyn ActionQueue>,
    settings: LobbySettings,
    inner: Mutex<LobbyInner>,
    /// Invoked exactly once when the last connection is gone.
    on_empty: Box<dyn Fn(LobbyId) + Send + Sync>,
}

impl Lobby {
    pub fn new(
        host_id: UserId,
        lobby_type: LobbyType,
        game_mode: String,
        rules: LobbyRules,
        users: Arc<dyn UserStore>,
        queue: Arc<dyn ActionQueue>,
        settings: LobbySettings,
        on_empty: Box<dyn Fn(LobbyId) + Send + Sync>,
    ) -> Arc<Self> {
        let mut members = HashMap::new();
        members.insert(host_id, Membership::Invited);
        Arc::new(Self {
            id: Uuid::new_v4(),
            users,
            queue,
            settings,
            inner: Mutex::new(LobbyInner {
                host_id,
                lobby_type,
                game_mode,
                members,
                connections: HashMap::new(),
                ready: HashSet::new(),
                rules,
                countdown: None,
                countdown_generation: 0,
                in_game: false,
                game: None,
                on_empty_fired: false,
            }),
            on_empty,
        })
    }

    pub async fn host_id(&self) -> UserId {
        self.inner.lock().await.host_id
    }

    pub async fn game_handle(&self) -> Option<Arc<Game>> {
        self.inner.lock().await.game.clone()
    }

    pub async fn member_count(&self) -> usize {
        self.inner.lock().await.connections.len()
    }

    // -- Membership --

    /// Add `target` as invited. No-op if already present.
    pub async fn invite(self: &Arc<Self>, by: UserId, target: UserId) {
        let mut fanout = Fanout::default();
        let conns;
        {
            let mut inner = self.inner.lock().await;
            if !matches!(inner.members.get(&by), Some(Membership::Joined { .. })) {
                fanout.error(by, ErrorCode::NotInLobby);
            } else if !inner.members.contains_key(&target) {
                inner.members.insert(target, Membership::Invited);
                fanout.broadcast(ServerMessage::LobbyInvite {
                    user_id: target,
                    invited_by: by,
                });
            }
            conns = inner.connections.clone();
        }
        Self::deliver(fanout, &conns);
    }

    /// Bind a socket to this lobby. Replaces and disposes any prior
    /// connection for the same user; sends the newcomer a private full-state
    /// snapshot and announces the join.
    pub async fn add_connection(self: &Arc<Self>, user: UserId, conn: Connection) -> BindOutcome {
        // Resolve the username before taking the lock; the lookup is bounded
        // and falls back to an id-derived name.
        let username = self.resolve_username(user).await;

        let mut fanout = Fanout::default();
        let outcome;
        let conns;
        {
            let mut inner = self.inner.lock().await;

            if inner.lobby_type == LobbyType::Private && !inner.members.contains_key(&user) {
                return BindOutcome::Rejected(ErrorCode::NotInvited);
            }

            if let Some(old) = inner.connections.insert(user, conn.clone()) {
                old.dispose();
            }
            inner
                .members
                .insert(user, Membership::Joined { username: username.clone() });
            inner.ready.remove(&user);

            if inner.in_game {
                if let Some(game) = inner.game.clone() {
                    return BindOutcome::Reconnect(game);
                }
            }

            // A fresh joiner is unready, so any running countdown is void.
            Self::cancel_countdown_locked(&mut inner, &mut fanout);

            fanout.to(
                user,
                ServerMessage::LobbyState(Box::new(Self::state_payload(self.id, &inner))),
            );
            fanout.broadcast(ServerMessage::LobbyUpdate {
                user_id: user,
                username,
                joined: true,
            });
            outcome = BindOutcome::Lobby;
            conns = inner.connections.clone();
        }
        Self::deliver(fanout, &conns);
        outcome
    }

    /// Drop a user entirely: connection, readiness, membership. Disposes the
    /// connection, cancels any countdown, and fires `on_empty` if nobody is
    /// left. May restart the countdown if the remaining room still qualifies.
    pub async fn remove_user(self: &Arc<Self>, user: UserId) {
        let mut fanout = Fanout::default();
        let mut fire_empty = false;
        let mut restart = false;
        let mut running_game = None;
        let conns;
        {
            let mut inner = self.inner.lock().await;
            let Some(membership) = inner.members.remove(&user) else {
                return;
            };
            if inner.in_game {
                running_game = inner.game.clone();
            }
            let username = match membership {
                Membership::Joined { username } => username,
                Membership::Invited => fallback_username(user),
            };
            inner.ready.remove(&user);
            if let Some(conn) = inner.connections.remove(&user) {
                conn.dispose();
            }
            Self::cancel_countdown_locked(&mut inner, &mut fanout);

            fanout.broadcast(ServerMessage::LobbyUpdate {
                user_id: user,
                username,
                joined: false,
            });

            if inner.connections.is_empty() {
                if !inner.on_empty_fired {
                    inner.on_empty_fired = true;
                    fire_empty = true;
                }
            } else {
                restart = Self::countdown_conditions_met(&inner);
            }
            conns = inner.connections.clone();
        }
        Self::deliver(fanout, &conns);
        if let Some(game) = running_game {
            // Leaving mid-game surrenders the seat to the disconnect rules.
            game.player_disconnected(user).await;
        }
        if fire_empty {
            (self.on_empty)(self.id);
        }
        if restart {
            self.try_start_countdown(None).await;
        }
    }

    /// A socket's read task ended. Only acts if `conn_id` still identifies
    /// the live connection; a replaced socket's teardown is stale.
    pub async fn connection_closed(self: &Arc<Self>, user: UserId, conn_id: Uuid) {
        let game = {
            let inner = self.inner.lock().await;
            if inner.connections.get(&user).map(|c| c.conn_id) != Some(conn_id) {
                return;
            }
            if inner.in_game {
                inner.game.clone()
            } else {
                None
            }
        };

        if let Some(game) = game {
            if !game.is_over().await {
                // Keep the seat and the membership; the player may reconnect.
                let mut inner = self.inner.lock().await;
                if inner.connections.get(&user).map(|c| c.conn_id) == Some(conn_id) {
                    if let Some(conn) = inner.connections.remove(&user) {
                        conn.dispose();
                    }
                }
                drop(inner);
                game.player_disconnected(user).await;
                return;
            }
        }
        self.remove_user(user).await;
    }

    /// Send the private full-state snapshot again, e.g. to a connection that
    /// bound while a game it holds no seat in is still running.
    pub async fn resend_state(self: &Arc<Self>, user: UserId) {
        let mut fanout = Fanout::default();
        let conns;
        {
            let inner = self.inner.lock().await;
            fanout.to(
                user,
                ServerMessage::LobbyState(Box::new(Self::state_payload(self.id, &inner))),
            );
            conns = inner.connections.clone();
        }
        Self::deliver(fanout, &conns);
    }

    // -- Readiness and countdown --

    /// Mark ready. Returns `true` when the caller should attempt to start
    /// the countdown (outside this lock).
    pub async fn mark_ready(self: &Arc<Self>, user: UserId) -> bool {
        let mut fanout = Fanout::default();
        let should_start;
        let conns;
        {
            let mut inner = self.inner.lock().await;
            if !inner.connections.contains_key(&user) {
                return false;
            }
            inner.ready.insert(user);
            fanout.broadcast(ServerMessage::ReadyUpdate {
                user_id: user,
                ready: true,
            });
            should_start = inner.rules.auto_start && Self::countdown_conditions_met(&inner);
            conns = inner.connections.clone();
        }
        Self::deliver(fanout, &conns);
        should_start
    }

    /// Withdraw readiness. Always cancels a running countdown.
    pub async fn mark_unready(self: &Arc<Self>, user: UserId) {
        let mut fanout = Fanout::default();
        let conns;
        {
            let mut inner = self.inner.lock().await;
            if !inner.connections.contains_key(&user) {
                return;
            }
            inner.ready.remove(&user);
            fanout.broadcast(ServerMessage::ReadyUpdate {
                user_id: user,
                ready: false,
            });
            Self::cancel_countdown_locked(&mut inner, &mut fanout);
            conns = inner.connections.clone();
        }
        Self::deliver(fanout, &conns);
    }

    /// Host-triggered start, for lobbies without auto-start.
    pub async fn request_start(self: &Arc<Self>, user: UserId) {
        let host = self.inner.lock().await.host_id;
        if user != host {
            let conns = self.inner.lock().await.connections.clone();
            let mut fanout = Fanout::default();
            fanout.error(user, ErrorCode::NotHost);
            Self::deliver(fanout, &conns);
            return;
        }
        self.try_start_countdown(Some(user)).await;
    }

    /// Begin the start countdown if nothing refuses it: not in game, no
    /// timer already active, at least two connections.
    pub async fn try_start_countdown(self: &Arc<Self>, requested_by: Option<UserId>) {
        let mut fanout = Fanout::default();
        let conns;
        {
            let mut inner = self.inner.lock().await;
            if inner.in_game || inner.countdown.is_some() || inner.connections.len() < 2 {
                if let Some(user) = requested_by {
                    fanout.error(user, ErrorCode::CountdownRefused);
                }
                let conns = inner.connections.clone();
                drop(inner);
                Self::deliver(fanout, &conns);
                return;
            }

            let seconds = self.settings.countdown_secs;
            inner.countdown_generation += 1;
            let generation = inner.countdown_generation;
            let fired = Arc::new(AtomicBool::new(false));
            let lobby = Arc::clone(self);
            let fired_clone = Arc::clone(&fired);
            let handle = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(u64::from(seconds))).await;
                lobby.countdown_fired(generation, fired_clone).await;
            });
            inner.countdown = Some(CountdownTimer {
                generation,
                fired,
                handle,
            });
            fanout.broadcast(ServerMessage::LobbyCountdownStart { seconds });
            conns = inner.connections.clone();
        }
        Self::deliver(fanout, &conns);
    }

    /// Countdown timer callback. Compares its generation against the live
    /// handle so a firing that raced a cancel-and-restart is ignored.
    async fn countdown_fired(self: &Arc<Self>, generation: u64, fired: Arc<AtomicBool>) {
        {
            let mut inner = self.inner.lock().await;
            match &inner.countdown {
                Some(timer) if timer.generation == generation => {}
                _ => return, // stale firing
            }
            fired.store(true, Ordering::SeqCst);
            inner.countdown = None;
        }
        // The actual launch happens outside the lock.
        self.launch_game().await;
    }

    /// Construct the game from current members and flip to in-game.
    async fn launch_game(self: &Arc<Self>) {
        let mut fanout = Fanout::default();
        let game;
        let conns;
        {
            let mut inner = self.inner.lock().await;
            if inner.in_game || inner.connections.len() < 2 {
                return;
            }

            let mut seats = Vec::with_capacity(inner.connections.len());
            for (user, conn) in &inner.connections {
                let username = match inner.members.get(user) {
                    Some(Membership::Joined { username }) => username.clone(),
                    _ => fallback_username(*user),
                };
                seats.push(GameSeat {
                    user_id: *user,
                    username,
                    conn: conn.clone(),
                });
            }
            // Deterministic seat order keeps rotations reproducible.
            seats.sort_by_key(|s| s.user_id);

            let lobby = Arc::downgrade(self);
            let built = Game::new(
                &inner.rules,
                seats,
                Arc::clone(&self.queue),
                self.settings.game_config.clone(),
                Box::new(move |game_id| {
                    if let Some(lobby) = lobby.upgrade() {
                        let lobby = Arc::clone(&lobby);
                        tokio::spawn(async move {
                            lobby.game_finished(game_id).await;
                        });
                    }
                }),
            );

            let players: Vec<UserId> = inner.connections.keys().copied().collect();
            fanout.broadcast(ServerMessage::GameStart {
                game_id: built.id(),
                players,
                rules: inner.rules.clone(),
            });
            inner.in_game = true;
            inner.game = Some(Arc::clone(&built));
            inner.ready.clear();
            game = built;
            conns = inner.connections.clone();
        }
        Self::deliver(fanout, &conns);
        game.start().await;

        tracing::info!(lobby_id = %self.id, game_id = %game.id(), "game started");
    }

    /// Game-over callback: the lobby is free again and may host a rematch.
    async fn game_finished(self: &Arc<Self>, game_id: crate::protocol::GameId) {
        let mut inner = self.inner.lock().await;
        if inner.game.as_ref().map(|g| g.id()) == Some(game_id) {
            inner.in_game = false;
            inner.ready.clear();
        }
        tracing::info!(lobby_id = %self.id, %game_id, "game finished, lobby open for rematch");
    }

    // -- Rules and chat --

    /// Apply a partial rules update. Invalid values fail the whole call; an
    /// update that changes nothing emits nothing.
    pub async fn update_rules(self: &Arc<Self>, user: UserId, patch: RulesPatch) {
        let mut fanout = Fanout::default();
        let conns;
        {
            let mut inner = self.inner.lock().await;
            if user != inner.host_id {
                fanout.error(user, ErrorCode::NotHost);
            } else if inner.in_game {
                fanout.error(user, ErrorCode::LobbyInGame);
            } else {
                match patch.apply(&inner.rules) {
                    Ok(next) => {
                        if next != inner.rules {
                            inner.rules = next;
                            fanout.broadcast(ServerMessage::LobbyRulesUpdated {
                                rules: inner.rules.clone(),
                            });
                        }
                    }
                    Err(reason) => {
                        fanout.to(
                            user,
                            ServerMessage::Error {
                                message: reason,
                                code: ErrorCode::InvalidRules,
                            },
                        );
                    }
                }
            }
            conns = inner.connections.clone();
        }
        Self::deliver(fanout, &conns);
    }

    pub async fn chat(self: &Arc<Self>, user: UserId, message: String) {
        let mut fanout = Fanout::default();
        let conns;
        {
            let inner = self.inner.lock().await;
            let Some(Membership::Joined { username }) = inner.members.get(&user) else {
                fanout.error(user, ErrorCode::NotInLobby);
                let conns = inner.connections.clone();
                drop(inner);
                Self::deliver(fanout, &conns);
                return;
            };
            fanout.broadcast(ServerMessage::Chat(ChatPayload {
                user_id: user,
                username: username.clone(),
                message,
                timestamp: chrono::Utc::now().timestamp(),
            }));
            conns = inner.connections.clone();
        }
        Self::deliver(fanout, &conns);
    }

    // -- Helpers --

    fn countdown_conditions_met(inner: &LobbyInner) -> bool {
        !inner.in_game
            && inner.countdown.is_none()
            && inner.connections.len() >= 2
            && inner
                .connections
                .keys()
                .all(|user| inner.ready.contains(user))
    }

    /// Stop the countdown if one exists. The cancellation event is emitted
    /// only when the timer had not yet fired; either way the handle is
    /// cleared.
    fn cancel_countdown_locked(inner: &mut LobbyInner, fanout: &mut Fanout) {
        if let Some(timer) = inner.countdown.take() {
            timer.handle.abort();
            if !timer.fired.load(Ordering::SeqCst) {
                fanout.broadcast(ServerMessage::LobbyCountdownCancel);
            }
        }
    }

    fn state_payload(id: LobbyId, inner: &LobbyInner) -> LobbyStatePayload {
        let mut users: Vec<LobbyMemberInfo> = inner
            .members
            .iter()
            .map(|(user, membership)| {
                let (username, invited_only) = match membership {
                    Membership::Joined { username } => (username.clone(), false),
                    Membership::Invited => (fallback_username(*user), true),
                };
                LobbyMemberInfo {
                    user_id: *user,
                    username,
                    connected: inner.connections.contains_key(user),
                    ready: inner.ready.contains(user),
                    invited_only,
                }
            })
            .collect();
        users.sort_by_key(|u| u.user_id);
        LobbyStatePayload {
            lobby_id: id,
            host_id: inner.host_id,
            lobby_type: inner.lobby_type,
            game_mode: inner.game_mode.clone(),
            users,
            rules: inner.rules.clone(),
            in_game: inner.in_game,
            game_id: inner.game.as_ref().map(|g| g.id()),
        }
    }

    async fn resolve_username(&self, user: UserId) -> String {
        match tokio::time::timeout(
            self.settings.user_lookup_timeout,
            self.users.get_user_by_id(user),
        )
        .await
        {
            Ok(Ok(profile)) => profile.username,
            Ok(Err(err)) => {
                tracing::warn!(user_id = %user, error = %err, "user lookup failed, using fallback name");
                fallback_username(user)
            }
            Err(_) => {
                tracing::warn!(user_id = %user, "user lookup timed out, using fallback name");
                fallback_username(user)
            }
        }
    }

    fn deliver(fanout: Fanout, conns: &HashMap<UserId, Connection>) {
        for msg in fanout.all {
            for conn in conns.values() {
                conn.send(msg.clone());
            }
        }
        for (user, msg) in fanout.targeted {
            if let Some(conn) = conns.get(&user) {
                conn.send(msg.clone());
            }
        }
    }

}

fn fallback_username(user: UserId) -> String {
    let simple = user.simple().to_string();
    format!("user-{}", &simple[..8])
}
