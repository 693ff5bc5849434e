//! User profile lookup.
//!
//! The persistent user store is an external service; the server only needs a
//! bounded, fallible `get_user_by_id`. Lookup failure is non-fatal: callers
//! fall back to an id-derived username.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::protocol::UserId;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
}

#[derive(Debug, thiserror::Error)]
pub enum UserStoreError {
    #[error("user {0} not found")]
    NotFound(UserId),
    #[error("user store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user_by_id(&self, id: UserId) -> Result<UserProfile, UserStoreError>;
}

/// In-memory user store; the default backend and the test double.
#[derive(Default)]
pub struct InMemoryUserStore {
    users: DashMap<UserId, UserProfile>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: UserProfile) {
        self.users.insert(profile.id, profile);
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn get_user_by_id(&self, id: UserId) -> Result<UserProfile, UserStoreError> {
        self.users
            .get(&id)
            .map(|entry| entry.clone())
            .ok_or(UserStoreError::NotFound(id))
    }
}
