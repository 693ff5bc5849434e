//! Application state and inbound message dispatch.
//!
//! The dispatcher is deliberately thin: it resolves which aggregate an
//! inbound message belongs to (lobby or running game) and forwards it. All
//! actual rules live behind the aggregates' own locks.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::lobby::{Lobby, LobbyStore};
use crate::protocol::{ClientMessage, ErrorCode, ServerMessage, UserId};
use crate::queue::ActionQueue;
use crate::users::UserStore;

/// One bound client connection: the outbound sink plus its cancellation
/// handle. Clones share the same underlying channel and token.
#[derive(Debug, Clone)]
pub struct Connection {
    pub user_id: UserId,
    /// Distinguishes this socket from any later socket of the same user, so
    /// a stale read task cannot tear down its replacement.
    pub conn_id: Uuid,
    tx: mpsc::Sender<Arc<ServerMessage>>,
    pub cancel: CancellationToken,
}

impl Connection {
    /// Create a connection with a bounded outbound queue. The receiver half
    /// is handed to the socket's write task.
    pub fn new(user_id: UserId, capacity: usize) -> (Self, mpsc::Receiver<Arc<ServerMessage>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                user_id,
                conn_id: Uuid::new_v4(),
                tx,
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    /// Non-blocking send. A saturated queue drops the message with a warning
    /// rather than stalling the broadcaster; a closed queue is benign because
    /// disposal may race with in-flight broadcasts.
    pub fn send(&self, msg: Arc<ServerMessage>) {
        use mpsc::error::TrySendError;
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(user_id = %self.user_id, "outbound queue full, dropping message");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Cancel the connection's tasks. Idempotent; the write task drains and
    /// exits on cancellation.
    pub fn dispose(&self) {
        self.cancel.cancel();
    }
}

/// Process-wide shared state.
pub struct AppState {
    pub config: Arc<Config>,
    pub lobbies: LobbyStore,
    pub users: Arc<dyn UserStore>,
    pub queue: Arc<dyn ActionQueue>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        users: Arc<dyn UserStore>,
        queue: Arc<dyn ActionQueue>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            lobbies: LobbyStore::new(),
            users,
            queue,
            verifier,
            shutdown: CancellationToken::new(),
        })
    }
}

/// Route one parsed inbound message to its aggregate.
pub async fn dispatch_message(lobby: &Arc<Lobby>, conn: &Connection, msg: ClientMessage) {
    use ClientMessage as Cm;
    let user = conn.user_id;
    match msg {
        // Lobby-scoped messages
        Cm::Ready => {
            if lobby.mark_ready(user).await {
                lobby.try_start_countdown(None).await;
            }
        }
        Cm::Unready => lobby.mark_unready(user).await,
        Cm::Invite { user_id } => lobby.invite(user, user_id).await,
        Cm::Chat { message } => lobby.chat(user, message).await,
        Cm::Leave => lobby.remove_user(user).await,
        Cm::UpdateRules { rules } => lobby.update_rules(user, rules).await,
        Cm::StartGame => lobby.request_start(user).await,

        // Game-scoped messages
        game_msg => {
            let Some(game) = lobby.game_handle().await else {
                conn.send(Arc::new(ServerMessage::Error {
                    message: ErrorCode::GameNotStarted.description().to_string(),
                    code: ErrorCode::GameNotStarted,
                }));
                return;
            };
            game.handle_message(user, game_msg).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn saturated_connection_drops_instead_of_blocking() {
        let user = Uuid::new_v4();
        let (conn, mut rx) = Connection::new(user, 2);
        for _ in 0..5 {
            conn.send(Arc::new(ServerMessage::LobbyCountdownCancel));
        }
        // Only the queue capacity made it through.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_to_disposed_connection_is_benign() {
        let user = Uuid::new_v4();
        let (conn, rx) = Connection::new(user, 2);
        drop(rx);
        conn.send(Arc::new(ServerMessage::LobbyCountdownCancel));
        conn.dispose();
        conn.dispose(); // idempotent
    }
}
