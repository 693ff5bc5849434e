use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};

use crate::lobby::{BindOutcome, Lobby};
use crate::protocol::{ClientMessage, ErrorCode, ServerMessage, UserId};
use crate::server::{dispatch_message, AppState, Connection};

/// Drive one accepted lobby socket: bind it to the lobby, spawn the write
/// task, and pump inbound frames through the dispatcher until the socket or
/// the connection's cancellation ends it.
pub(super) async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    lobby: Arc<Lobby>,
    user: UserId,
) {
    let (mut sender, mut receiver) = socket.split();
    let capacity = state.config.server.outbound_queue_capacity;
    let (conn, mut rx) = Connection::new(user, capacity);
    let conn_id = conn.conn_id;
    let lobby_id = lobby.id;

    // Write task: drain the outbound queue onto the socket. Exits when the
    // connection is disposed or the peer goes away.
    let cancel = conn.cancel.clone();
    let write_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    // Flush anything already queued before closing.
                    while let Ok(msg) = rx.try_recv() {
                        if let Ok(text) = serde_json::to_string(&*msg) {
                            if sender.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: "connection replaced or closed".into(),
                        })))
                        .await;
                    break;
                }
                outbound = rx.recv() => {
                    let Some(msg) = outbound else { break };
                    let text = match serde_json::to_string(&*msg) {
                        Ok(text) => text,
                        Err(err) => {
                            tracing::error!(user_id = %user, error = %err, "failed to encode outbound message");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sender.close().await;
    });

    // Bind to the lobby (or rebind into the running game).
    match lobby.add_connection(user, conn.clone()).await {
        BindOutcome::Lobby => {
            tracing::info!(user_id = %user, %lobby_id, "lobby connection established");
        }
        BindOutcome::Reconnect(game) => match game.reconnect(user, conn.clone()).await {
            Ok(()) => {
                tracing::info!(user_id = %user, %lobby_id, game_id = %game.id(), "player reconnected");
            }
            Err(ErrorCode::NotInLobby) => {
                // Connected mid-game without a seat: stays on the lobby
                // floor and can play the rematch.
                lobby.resend_state(user).await;
                tracing::info!(user_id = %user, %lobby_id, "joined lobby while a game is running");
            }
            Err(code) => {
                conn.send(Arc::new(ServerMessage::Error {
                    message: code.description().to_string(),
                    code,
                }));
                conn.dispose();
                let _ = write_task.await;
                lobby.connection_closed(user, conn_id).await;
                return;
            }
        },
        BindOutcome::Rejected(code) => {
            conn.send(Arc::new(ServerMessage::Error {
                message: code.description().to_string(),
                code,
            }));
            conn.dispose();
            let _ = write_task.await;
            return;
        }
    }

    // Read loop.
    let max_message_size = state.config.security.max_message_size;
    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(user_id = %user, error = %err, "websocket read error");
                break;
            }
        };
        match frame {
            Message::Text(text) => {
                if text.len() > max_message_size {
                    conn.send(Arc::new(ServerMessage::Error {
                        message: format!(
                            "Message too large ({} bytes, max {} bytes)",
                            text.len(),
                            max_message_size
                        ),
                        code: ErrorCode::MessageTooLarge,
                    }));
                    continue;
                }
                let msg: ClientMessage = match serde_json::from_str(&text) {
                    Ok(msg) => msg,
                    Err(err) => {
                        // Malformed envelopes are protocol violations: the
                        // socket closes rather than limping along.
                        tracing::warn!(user_id = %user, error = %err, "rejected client frame");
                        conn.send(Arc::new(ServerMessage::Error {
                            message: ErrorCode::ProtocolViolation.description().to_string(),
                            code: ErrorCode::ProtocolViolation,
                        }));
                        break;
                    }
                };
                let leaving = matches!(msg, ClientMessage::Leave);
                dispatch_message(&lobby, &conn, msg).await;
                if leaving || conn.cancel.is_cancelled() {
                    break;
                }
            }
            Message::Binary(_) => {
                tracing::warn!(user_id = %user, "binary frame on a JSON protocol socket");
                conn.send(Arc::new(ServerMessage::Error {
                    message: ErrorCode::ProtocolViolation.description().to_string(),
                    code: ErrorCode::ProtocolViolation,
                }));
                break;
            }
            Message::Close(_) => {
                tracing::info!(user_id = %user, "websocket connection closed");
                break;
            }
            // axum answers pings automatically
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    // Teardown: the lobby decides whether this is a mid-game disconnect or a
    // plain departure. A stale conn_id (the user already reopened) is a no-op.
    lobby.connection_closed(user, conn_id).await;
    conn.dispose();
    let _ = write_task.await;
}
