//! Durable FIFO action queue abstraction.
//!
//! The game engine pushes one [`ActionRecord`] per completed mutation; the
//! historian drains them with a bounded blocking pop so shutdown stays
//! responsive. The in-memory implementation is the default backend; a real
//! broker can slot in behind the same trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Duration;

use crate::protocol::{GameId, UserId};

/// Self-describing record of one completed game action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionRecord {
    pub game_id: GameId,
    /// Strictly monotone and contiguous per game, starting at 0
    pub action_index: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_user_id: Option<UserId>,
    pub action_type: String,
    /// Free-form payload; the historian persists it opaquely
    pub action_payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
    #[error("queue backend failure: {0}")]
    Backend(String),
}

/// Push sink + bounded blocking pop, FIFO per game.
#[async_trait]
pub trait ActionQueue: Send + Sync {
    /// Non-blocking push. Failure is reported but must never block a game.
    fn enqueue(&self, record: ActionRecord) -> Result<(), QueueError>;

    /// Pop the oldest record, waiting at most `timeout`. `Ok(None)` means the
    /// timeout elapsed with nothing available.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<ActionRecord>, QueueError>;
}

/// Process-local unbounded FIFO queue.
pub struct InMemoryActionQueue {
    tx: mpsc::UnboundedSender<ActionRecord>,
    rx: Mutex<mpsc::UnboundedReceiver<ActionRecord>>,
}

impl InMemoryActionQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }
}

impl Default for InMemoryActionQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionQueue for InMemoryActionQueue {
    fn enqueue(&self, record: ActionRecord) -> Result<(), QueueError> {
        self.tx.send(record).map_err(|_| QueueError::Closed)
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<ActionRecord>, QueueError> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(record)) => Ok(Some(record)),
            Ok(None) => Err(QueueError::Closed),
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(game_id: GameId, action_index: u64) -> ActionRecord {
        ActionRecord {
            game_id,
            action_index,
            actor_user_id: None,
            action_type: "action_test".to_string(),
            action_payload: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn queue_is_fifo() {
        let queue = InMemoryActionQueue::new();
        let game = uuid::Uuid::new_v4();
        for i in 0..5 {
            queue.enqueue(record(game, i)).unwrap();
        }
        for i in 0..5 {
            let popped = queue
                .dequeue(Duration::from_millis(50))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(popped.action_index, i);
        }
    }

    #[tokio::test]
    async fn dequeue_times_out_empty() {
        let queue = InMemoryActionQueue::new();
        let got = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn record_round_trips_through_json() {
        let rec = ActionRecord {
            game_id: uuid::Uuid::new_v4(),
            action_index: 3,
            actor_user_id: Some(uuid::Uuid::new_v4()),
            action_type: "action_replace".to_string(),
            action_payload: serde_json::json!({"idx": 2}),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&rec).unwrap();
        let back: ActionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(rec, back);
    }
}
