use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::protocol::LobbyId;

use super::Lobby;

/// Process-wide registry of live lobbies. The map itself is sharded-lock
/// concurrent; each lobby serializes its own aggregate.
#[derive(Default)]
pub struct LobbyStore {
    lobbies: DashMap<LobbyId, Arc<Lobby>>,
}

impl LobbyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a lobby. A duplicate id is a caller error: the existing
    /// entry is kept and a warning is logged.
    pub fn add(&self, lobby: Arc<Lobby>) {
        let id = lobby.id;
        if self.lobbies.contains_key(&id) {
            tracing::warn!(lobby_id = %id, "attempted to register duplicate lobby id");
            return;
        }
        self.lobbies.insert(id, lobby);
    }

    pub fn get(&self, id: &LobbyId) -> Option<Arc<Lobby>> {
        self.lobbies.get(id).map(|entry| Arc::clone(&entry))
    }

    /// Idempotent removal.
    pub fn delete(&self, id: &LobbyId) {
        self.lobbies.remove(id);
    }

    /// Shallow copy for listing. Iteration safety after the copy is the
    /// caller's concern.
    pub fn snapshot(&self) -> HashMap<LobbyId, Arc<Lobby>> {
        self.lobbies
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lobbies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lobbies.is_empty()
    }
}
