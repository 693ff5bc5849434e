use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::game::GameConfig;
use crate::lobby::{Lobby, LobbySettings};
use crate::protocol::{LobbyId, LobbyRules, LobbyType, RulesPatch, UserId};
use crate::server::AppState;

use super::connection::handle_socket;

/// Create the Axum router with WebSocket support
pub fn create_router(cors_origins: &str) -> axum::Router<Arc<AppState>> {
    use tower_http::cors::{Any, CorsLayer};
    use tower_http::trace::TraceLayer;

    let cors = if cors_origins == "*" {
        CorsLayer::permissive()
    } else {
        let origins: Vec<_> = cors_origins
            .split(',')
            .filter_map(|s| s.trim().parse::<axum::http::HeaderValue>().ok())
            .collect();

        if origins.is_empty() {
            tracing::warn!("No valid CORS origins configured, using permissive CORS");
            CorsLayer::permissive()
        } else {
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    };

    axum::Router::new()
        .route("/ws/lobby/{lobby_id}", get(lobby_socket_handler))
        .route("/lobbies", get(list_lobbies).post(create_lobby))
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> &'static str {
    "OK"
}

#[derive(Debug, Deserialize)]
struct AuthQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateLobbyRequest {
    token: String,
    #[serde(default)]
    lobby_type: LobbyType,
    #[serde(default = "default_game_mode")]
    game_mode: String,
    /// Initial deviations from the default rules, if any
    #[serde(default)]
    rules: Option<RulesPatch>,
}

fn default_game_mode() -> String {
    "head_to_head".to_string()
}

#[derive(Debug, Serialize)]
struct CreateLobbyResponse {
    lobby_id: LobbyId,
    host_id: UserId,
}

#[derive(Debug, Serialize)]
struct LobbySummary {
    lobby_id: LobbyId,
    connections: usize,
}

/// Create a lobby on the host's behalf and register it. The lobby removes
/// itself from the registry once its last connection is gone.
async fn create_lobby(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateLobbyRequest>,
) -> impl IntoResponse {
    let host = match state.verifier.verify(&request.token) {
        Ok(user) => user,
        Err(err) => {
            return (StatusCode::UNAUTHORIZED, err.to_string()).into_response();
        }
    };

    let mut rules = LobbyRules {
        auto_start: true,
        ..LobbyRules::default()
    };
    if let Some(patch) = &request.rules {
        match patch.apply(&rules) {
            Ok(next) => rules = next,
            Err(reason) => {
                return (StatusCode::UNPROCESSABLE_ENTITY, reason).into_response();
            }
        }
    }

    let settings = LobbySettings {
        countdown_secs: state.config.server.lobby_countdown_sec,
        user_lookup_timeout: Duration::from_millis(state.config.server.user_lookup_timeout_ms),
        game_config: GameConfig {
            pregame_reveal: Duration::from_secs(u64::from(state.config.server.pregame_reveal_sec)),
            shuffle_seed: None,
        },
    };

    let registry = Arc::downgrade(&state);
    let lobby = Lobby::new(
        host,
        request.lobby_type,
        request.game_mode,
        rules,
        Arc::clone(&state.users),
        Arc::clone(&state.queue),
        settings,
        Box::new(move |lobby_id| {
            if let Some(state) = registry.upgrade() {
                state.lobbies.delete(&lobby_id);
                tracing::info!(%lobby_id, "empty lobby disposed");
            }
        }),
    );
    let lobby_id = lobby.id;
    state.lobbies.add(lobby);
    tracing::info!(%lobby_id, host_id = %host, "lobby created");

    (
        StatusCode::CREATED,
        Json(CreateLobbyResponse {
            lobby_id,
            host_id: host,
        }),
    )
        .into_response()
}

async fn list_lobbies(State(state): State<Arc<AppState>>) -> Json<Vec<LobbySummary>> {
    let snapshot = state.lobbies.snapshot();
    let mut summaries = Vec::with_capacity(snapshot.len());
    for (lobby_id, lobby) in snapshot {
        summaries.push(LobbySummary {
            lobby_id,
            connections: lobby.member_count().await,
        });
    }
    summaries.sort_by_key(|s| s.lobby_id);
    Json(summaries)
}

/// Upgrade a lobby socket. The token is verified before the upgrade; an
/// unknown lobby or a bad token denies it outright.
async fn lobby_socket_handler(
    ws: WebSocketUpgrade,
    Path(lobby_id): Path<LobbyId>,
    Query(auth): Query<AuthQuery>,
    State(state): State<Arc<AppState>>,
) -> axum::response::Response {
    let token = auth.token.unwrap_or_default();
    let user = match state.verifier.verify(&token) {
        Ok(user) => user,
        Err(err) => {
            tracing::warn!(%lobby_id, error = %err, "websocket upgrade denied");
            return (StatusCode::UNAUTHORIZED, err.to_string()).into_response();
        }
    };
    let Some(lobby) = state.lobbies.get(&lobby_id) else {
        return (StatusCode::NOT_FOUND, "lobby not found").into_response();
    };

    ws.protocols(["cambia.v1"])
        .on_upgrade(move |socket| handle_socket(socket, state, lobby, user))
}
