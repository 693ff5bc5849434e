//! The historian: a back-pressured ingest pipeline from the action queue
//! into the relational store, plus an independent inactivity sweep that
//! flags stalled games as abandoned.
//!
//! Two cooperating loops share one queue client, one store, and one
//! cancellation token. The ingest loop dequeues with a short bounded timeout
//! so shutdown stays responsive, batches records, and flushes on size or on
//! a periodic tick. The inactivity loop scans last-activity timestamps once
//! a minute.

mod store;

pub use store::{GameRow, GameStatus, GameStore, InMemoryGameStore, PgGameStore, StoreError};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::protocol::GameId;
use crate::queue::{ActionQueue, ActionRecord};

/// Terminal action type that completes a game row.
pub const ACTION_END_GAME: &str = "action_end_game";

/// Bounded dequeue wait; keeps cancellation latency low without busy-polling.
const DEQUEUE_WAIT: Duration = Duration::from_millis(250);

/// Cadence of the inactivity sweep.
const INACTIVITY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct HistorianConfig {
    /// Flush once this many records are buffered
    pub batch_size: usize,
    /// Flush a non-empty batch after this long even if undersized
    pub flush_delay: Duration,
    /// A game with no actions for this long is considered abandoned
    pub inactivity: Duration,
}

impl Default for HistorianConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            flush_delay: Duration::from_millis(500),
            inactivity: Duration::from_secs(600),
        }
    }
}

pub struct Historian {
    queue: Arc<dyn ActionQueue>,
    store: Arc<dyn GameStore>,
    config: HistorianConfig,
    last_activity: Mutex<HashMap<GameId, Instant>>,
}

impl Historian {
    pub fn new(
        queue: Arc<dyn ActionQueue>,
        store: Arc<dyn GameStore>,
        config: HistorianConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            store,
            config,
            last_activity: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn both loops. They exit when `cancel` fires; the ingest loop
    /// flushes its current batch first.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        let ingest = {
            let historian = Arc::clone(self);
            let cancel = cancel.clone();
            tokio::spawn(async move { historian.ingest_loop(cancel).await })
        };
        let inactivity = {
            let historian = Arc::clone(self);
            tokio::spawn(async move { historian.inactivity_loop(cancel).await })
        };
        vec![ingest, inactivity]
    }

    /// Drain the queue into size- or time-bounded batches.
    pub async fn ingest_loop(self: &Arc<Self>, cancel: CancellationToken) {
        let mut batch: Vec<ActionRecord> = Vec::with_capacity(self.config.batch_size);
        let mut flush_tick = tokio::time::interval(self.config.flush_delay);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    self.flush(&mut batch).await;
                    tracing::info!("historian ingest loop stopped");
                    return;
                }
                popped = self.queue.dequeue(DEQUEUE_WAIT) => {
                    match popped {
                        Ok(Some(record)) => {
                            self.touch(record.game_id).await;
                            batch.push(record);
                            if batch.len() >= self.config.batch_size {
                                self.flush(&mut batch).await;
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            tracing::warn!(error = %err, "action queue dequeue failed");
                            self.flush(&mut batch).await;
                            return;
                        }
                    }
                }
                _ = flush_tick.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
            }
        }
    }

    /// Sweep last-activity stamps and flag stale games as abandoned.
    pub async fn inactivity_loop(self: &Arc<Self>, cancel: CancellationToken) {
        let mut sweep = tokio::time::interval(INACTIVITY_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("historian inactivity loop stopped");
                    return;
                }
                _ = sweep.tick() => {
                    self.sweep_inactive().await;
                }
            }
        }
    }

    async fn touch(&self, game_id: GameId) {
        self.last_activity
            .lock()
            .await
            .insert(game_id, Instant::now());
    }

    async fn sweep_inactive(&self) {
        let cutoff = self.config.inactivity;
        let stale: Vec<GameId> = {
            let activity = self.last_activity.lock().await;
            activity
                .iter()
                .filter(|(_, at)| at.elapsed() > cutoff)
                .map(|(id, _)| *id)
                .collect()
        };
        for game_id in stale {
            match self.store.mark_abandoned(game_id).await {
                Ok(true) => {
                    tracing::info!(%game_id, "game flagged abandoned after inactivity");
                }
                Ok(false) => {} // already completed or abandoned
                Err(err) => {
                    tracing::error!(%game_id, error = %err, "failed to flag abandoned game");
                }
            }
            self.last_activity.lock().await.remove(&game_id);
        }
    }

    /// One transaction per batch; a failed batch is logged and dropped, the
    /// pipeline keeps running.
    async fn flush(&self, batch: &mut Vec<ActionRecord>) {
        if batch.is_empty() {
            return;
        }
        let records = std::mem::take(batch);
        let count = records.len();
        match self.store.persist_batch(&records).await {
            Ok(()) => {
                tracing::debug!(count, "historian batch committed");
            }
            Err(err) => {
                tracing::error!(count, error = %err, "historian batch rolled back");
            }
        }
    }
}
