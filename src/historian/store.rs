//! Relational persistence for game history.
//!
//! One trait, two backends: Postgres through sqlx for deployments, and an
//! in-memory table for tests and local runs without a database. Both commit
//! a batch atomically: any record failing rolls back the whole batch.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::protocol::GameId;
use crate::queue::ActionRecord;

use super::ACTION_END_GAME;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameStatus {
    InProgress,
    Completed,
    Abandoned,
}

impl GameStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait GameStore: Send + Sync {
    /// Persist a batch in one transaction: upsert each game row on first
    /// sight, insert every action in order, and complete the game row when
    /// an end-game record is seen.
    async fn persist_batch(&self, records: &[ActionRecord]) -> Result<(), StoreError>;

    /// Flag a game abandoned, only if it is still in progress. Returns
    /// whether a row was updated.
    async fn mark_abandoned(&self, game_id: GameId) -> Result<bool, StoreError>;
}

/// Postgres-backed store.
pub struct PgGameStore {
    pool: PgPool,
}

impl PgGameStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GameStore for PgGameStore {
    async fn persist_batch(&self, records: &[ActionRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO games (id, status, start_time)
                VALUES ($1, 'in_progress', NOW())
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(record.game_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO game_actions
                    (game_id, action_index, actor_user_id, action_type, action_payload)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(record.game_id)
            .bind(i64::try_from(record.action_index).unwrap_or(i64::MAX))
            .bind(record.actor_user_id)
            .bind(&record.action_type)
            .bind(&record.action_payload)
            .execute(&mut *tx)
            .await?;

            if record.action_type == ACTION_END_GAME {
                sqlx::query(
                    r#"
                    UPDATE games
                    SET status = 'completed', end_time = NOW()
                    WHERE id = $1 AND status = 'in_progress'
                    "#,
                )
                .bind(record.game_id)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn mark_abandoned(&self, game_id: GameId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE games
            SET status = 'abandoned', end_time = NOW()
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(game_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// One persisted game row.
#[derive(Debug, Clone)]
pub struct GameRow {
    pub status: GameStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct InMemoryTables {
    games: HashMap<GameId, GameRow>,
    actions: Vec<ActionRecord>,
}

/// In-memory store mirroring the Postgres flush semantics.
#[derive(Default)]
pub struct InMemoryGameStore {
    tables: Mutex<InMemoryTables>,
}

impl InMemoryGameStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn game_row(&self, game_id: GameId) -> Option<GameRow> {
        self.tables.lock().await.games.get(&game_id).cloned()
    }

    pub async fn action_count(&self, game_id: GameId) -> usize {
        self.tables
            .lock()
            .await
            .actions
            .iter()
            .filter(|a| a.game_id == game_id)
            .count()
    }

    pub async fn actions_for(&self, game_id: GameId) -> Vec<ActionRecord> {
        self.tables
            .lock()
            .await
            .actions
            .iter()
            .filter(|a| a.game_id == game_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl GameStore for InMemoryGameStore {
    async fn persist_batch(&self, records: &[ActionRecord]) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        for record in records {
            tables.games.entry(record.game_id).or_insert_with(|| GameRow {
                status: GameStatus::InProgress,
                start_time: Utc::now(),
                end_time: None,
            });
            tables.actions.push(record.clone());
            if record.action_type == ACTION_END_GAME {
                if let Some(row) = tables.games.get_mut(&record.game_id) {
                    if row.status == GameStatus::InProgress {
                        row.status = GameStatus::Completed;
                        row.end_time = Some(Utc::now());
                    }
                }
            }
        }
        Ok(())
    }

    async fn mark_abandoned(&self, game_id: GameId) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.games.get_mut(&game_id) {
            Some(row) if row.status == GameStatus::InProgress => {
                row.status = GameStatus::Abandoned;
                row.end_time = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
