//! Message store contract.
//!
//! The messaging core never talks to a database directly. Everything it needs
//! from persistence goes through [`MessageStore`]: append, point lookup,
//! ordered queries, live queries and the single mutable field (`read`).

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::database::DatabaseError;
use crate::types::{ChangeBatch, Message, MessageId, NewMessage, UserId};

pub mod cached;
mod live;
pub mod memory;
pub mod sqlite;

pub use cached::CachedMessageStore;
pub use memory::InMemoryMessageStore;
pub use sqlite::SqliteMessageStore;

/// Default capacity of the per-store change broadcast.
pub const DEFAULT_LISTEN_BUFFER: usize = 256;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Message store unavailable: {0}")]
    Unavailable(String),

    #[error("Message not found: {0}")]
    NotFound(MessageId),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Change stream closed")]
    Closed,
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Closed)
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            other => StoreError::Database(DatabaseError::Sqlx(other)),
        }
    }
}

/// Live query output: an initial snapshot batch followed by change batches.
///
/// Delivery is at-least-once. A change may be replayed, so consumers apply
/// batches idempotently.
pub type ChangeStream = BoxStream<'static, Result<ChangeBatch, StoreError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryFilter {
    BySender(UserId),
    ByReceiver(UserId),
}

/// A query over messages keyed by `(sender_id | receiver_id, created_at)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageQuery {
    pub filter: QueryFilter,
    /// Restricts results to messages exchanged with this user.
    pub counterparty: Option<UserId>,
    pub order: SortOrder,
    /// Applies to snapshots only; live changes are never truncated.
    pub limit: Option<usize>,
}

impl MessageQuery {
    pub fn by_sender(user_id: UserId) -> Self {
        Self {
            filter: QueryFilter::BySender(user_id),
            counterparty: None,
            order: SortOrder::Ascending,
            limit: None,
        }
    }

    pub fn by_receiver(user_id: UserId) -> Self {
        Self {
            filter: QueryFilter::ByReceiver(user_id),
            counterparty: None,
            order: SortOrder::Ascending,
            limit: None,
        }
    }

    pub fn with_counterparty(mut self, counterparty: UserId) -> Self {
        self.counterparty = Some(counterparty);
        self
    }

    pub fn ordered(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, message: &Message) -> bool {
        match (&self.filter, &self.counterparty) {
            (QueryFilter::BySender(sender), None) => &message.sender_id == sender,
            (QueryFilter::BySender(sender), Some(other)) => {
                &message.sender_id == sender && &message.receiver_id == other
            }
            (QueryFilter::ByReceiver(receiver), None) => &message.receiver_id == receiver,
            (QueryFilter::ByReceiver(receiver), Some(other)) => {
                &message.receiver_id == receiver && &message.sender_id == other
            }
        }
    }

    /// Filters, orders and truncates `messages` according to this query.
    pub fn apply<I>(&self, messages: I) -> Vec<Message>
    where
        I: IntoIterator<Item = Message>,
    {
        let mut matched: Vec<Message> = messages
            .into_iter()
            .filter(|m| self.matches(m))
            .collect();
        matched.sort_by(|a, b| match self.order {
            SortOrder::Ascending => a.chronological_cmp(b),
            SortOrder::Descending => b.chronological_cmp(a),
        });
        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persists a message; the store assigns `id` and `created_at`.
    async fn append(&self, message: NewMessage) -> Result<Message, StoreError>;

    async fn get(&self, id: &MessageId) -> Result<Option<Message>, StoreError>;

    async fn query(&self, query: &MessageQuery) -> Result<Vec<Message>, StoreError>;

    /// Opens a live query. The first batch is the current snapshot.
    async fn listen(&self, query: &MessageQuery) -> Result<ChangeStream, StoreError>;

    /// Sets `read = true`. Setting an already-read message is a no-op.
    async fn update_read_flag(&self, id: &MessageId) -> Result<(), StoreError>;

    async fn query_by_sender(
        &self,
        user_id: &UserId,
        order: SortOrder,
    ) -> Result<Vec<Message>, StoreError> {
        self.query(&MessageQuery::by_sender(user_id.clone()).ordered(order))
            .await
    }

    async fn query_by_receiver(
        &self,
        user_id: &UserId,
        order: SortOrder,
    ) -> Result<Vec<Message>, StoreError> {
        self.query(&MessageQuery::by_receiver(user_id.clone()).ordered(order))
            .await
    }

    async fn listen_by_sender(&self, user_id: &UserId) -> Result<ChangeStream, StoreError> {
        self.listen(&MessageQuery::by_sender(user_id.clone())).await
    }

    async fn listen_by_receiver(&self, user_id: &UserId) -> Result<ChangeStream, StoreError> {
        self.listen(&MessageQuery::by_receiver(user_id.clone()))
            .await
    }
}
