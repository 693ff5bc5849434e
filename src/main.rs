#![cfg_attr(not(test), deny(clippy::panic))]

use std::net::SocketAddr;
use std::sync::Arc;

use cambia_server::auth::UuidTokenVerifier;
use cambia_server::config;
use cambia_server::historian::{GameStore, Historian, InMemoryGameStore, PgGameStore};
use cambia_server::logging;
use cambia_server::queue::InMemoryActionQueue;
use cambia_server::server::AppState;
use cambia_server::users::InMemoryUserStore;
use cambia_server::websocket;
use clap::Parser;

/// Cambia server -- realtime multiplayer card game backend
#[derive(Parser, Debug)]
#[command(name = "cambia-server")]
#[command(about = "Realtime multiplayer server for the card game Cambia")]
#[command(version)]
struct Cli {
    /// Validate configuration and exit without starting the server.
    #[arg(long, short = 'c', conflicts_with = "print_config")]
    validate_config: bool,

    /// Print the loaded configuration to stdout (as JSON) and exit.
    #[arg(long, conflicts_with = "validate_config")]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Pick up a .env file if one is present; ignore absence.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let cfg = Arc::new(config::load());

    if cli.print_config {
        let json = serde_json::to_string_pretty(&*cfg)
            .map_err(|e| anyhow::anyhow!("Failed to serialize config: {e}"))?;
        println!("{json}");
        return Ok(());
    }

    if cli.validate_config {
        println!("Configuration validation passed");
        println!();
        println!("Configuration summary:");
        println!("  Port: {}", cfg.port);
        println!("  Lobby countdown: {}s", cfg.server.lobby_countdown_sec);
        println!("  Pregame reveal: {}s", cfg.server.pregame_reveal_sec);
        println!("  Historian batch size: {}", cfg.historian.batch_size);
        println!("  Historian flush delay: {}ms", cfg.historian.flush_ms);
        println!(
            "  Game inactivity timeout: {}s",
            cfg.historian.inactivity_sec
        );
        println!(
            "  Historian store: {}",
            if cfg.historian.database_url.is_some() {
                "postgres"
            } else {
                "in-memory"
            }
        );
        return Ok(());
    }

    logging::init_with_config(&cfg.logging);

    let port: u16 = cfg.port;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "Starting Cambia server");

    // Shared infrastructure: one queue, one user store, one verifier.
    let queue = Arc::new(InMemoryActionQueue::new());
    let users = Arc::new(InMemoryUserStore::new());
    let verifier = Arc::new(UuidTokenVerifier);

    let state = AppState::new(
        Arc::clone(&cfg),
        users,
        queue.clone(),
        verifier,
    );

    // Historian: Postgres when a connection string is configured, otherwise
    // the in-memory store.
    let store: Arc<dyn GameStore> = match &cfg.historian.database_url {
        Some(url) => {
            let store = PgGameStore::connect(url)
                .await
                .map_err(|e| anyhow::anyhow!("failed to connect historian database: {e}"))?;
            tracing::info!("historian connected to postgres");
            Arc::new(store)
        }
        None => {
            tracing::info!("historian using in-memory store");
            Arc::new(InMemoryGameStore::new())
        }
    };
    let historian = Historian::new(queue, store, cfg.historian.to_historian_config());
    let historian_tasks = historian.spawn(state.shutdown.clone());

    let app = websocket::create_router(&cfg.security.cors_origins).with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        %addr,
        cors_origins = %cfg.security.cors_origins,
        "Server started - WebSocket: /ws/lobby/{{lobby_id}}, Lobby API: /lobbies, Health: /health"
    );

    let shutdown = state.shutdown.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        })
        .await?;

    // Let the historian flush its current batch before exit.
    state.shutdown.cancel();
    for task in historian_tasks {
        let _ = task.await;
    }
    tracing::info!("shutdown complete");

    Ok(())
}
