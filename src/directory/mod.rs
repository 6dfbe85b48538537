//! User directory and presence collaborators.
//!
//! Identity is owned elsewhere; the messaging core only resolves ids to
//! `{display_name, role}` and asks whether someone is online.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashSet;
use futures::future::join_all;
use thiserror::Error;

use crate::database::DatabaseError;
use crate::types::{User, UserId};

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryUserDirectory;
pub use sqlite::SqliteUserDirectory;

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("User not found: {0}")]
    NotFound(UserId),

    #[error("User directory unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl From<sqlx::Error> for DirectoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DirectoryError::Unavailable(err.to_string())
            }
            other => DirectoryError::Database(DatabaseError::Sqlx(other)),
        }
    }
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user(&self, id: &UserId) -> Result<User, DirectoryError>;

    async fn list_users(&self) -> Result<Vec<User>, DirectoryError>;

    /// Resolves many ids concurrently. Each id gets its own result so one
    /// failed lookup never hides the others.
    async fn get_users(&self, ids: &[UserId]) -> HashMap<UserId, Result<User, DirectoryError>> {
        let lookups = ids.iter().map(|id| async move { (id.clone(), self.get_user(id).await) });
        join_all(lookups).await.into_iter().collect()
    }
}

/// Source of the single "online" flag shown on conversation rows.
pub trait PresenceTracker: Send + Sync {
    fn is_online(&self, user_id: &UserId) -> bool;
}

/// Presence for deployments without a tracker: everyone is offline.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPresence;

impl PresenceTracker for NoPresence {
    fn is_online(&self, _user_id: &UserId) -> bool {
        false
    }
}

/// Presence fed by an external tracker pushing online/offline transitions.
#[derive(Debug, Default)]
pub struct StaticPresence {
    online: DashSet<UserId>,
}

impl StaticPresence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_online(&self, user_id: UserId, online: bool) {
        if online {
            self.online.insert(user_id);
        } else {
            self.online.remove(&user_id);
        }
    }
}

impl PresenceTracker for StaticPresence {
    fn is_online(&self, user_id: &UserId) -> bool {
        self.online.contains(user_id)
    }
}
