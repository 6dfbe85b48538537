use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::live::{ChangeFeed, live_stream};
use super::{
    ChangeStream, DEFAULT_LISTEN_BUFFER, MessageQuery, MessageStore, QueryFilter, SortOrder,
    StoreError,
};
use crate::database::{Database, utils::parse_timestamp};
use crate::types::{Message, MessageChange, MessageId, NewMessage, UserId, now_millis};

#[derive(Debug)]
pub(crate) struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

impl<'r, R> sqlx::FromRow<'r, R> for MessageRow
where
    R: sqlx::Row,
    &'r str: sqlx::ColumnIndex<R>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    fn from_row(row: &'r R) -> std::result::Result<Self, sqlx::Error> {
        let read: i64 = row.try_get("read")?;
        Ok(MessageRow {
            id: row.try_get("id")?,
            sender_id: row.try_get("sender_id")?,
            receiver_id: row.try_get("receiver_id")?,
            content: row.try_get("content")?,
            created_at: parse_timestamp(row, "created_at")?,
            read: read != 0,
        })
    }
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            id: MessageId::new(row.id),
            sender_id: UserId::new(row.sender_id),
            receiver_id: UserId::new(row.receiver_id),
            content: row.content,
            created_at: row.created_at,
            read: row.read,
        }
    }
}

const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, content, created_at, read";

/// Message store persisted in the careline SQLite database.
///
/// Live queries observe writes made through this instance; share one
/// instance per database file.
pub struct SqliteMessageStore {
    database: Arc<Database>,
    feed: ChangeFeed,
}

impl SqliteMessageStore {
    pub fn new(database: Arc<Database>) -> Self {
        Self::with_capacity(database, DEFAULT_LISTEN_BUFFER)
    }

    pub fn with_capacity(database: Arc<Database>, listen_buffer: usize) -> Self {
        Self {
            database,
            feed: ChangeFeed::new(listen_buffer),
        }
    }
}

async fn fetch_query(database: &Database, query: &MessageQuery) -> Result<Vec<Message>, StoreError> {
    let (key_column, key) = match &query.filter {
        QueryFilter::BySender(id) => ("sender_id", id),
        QueryFilter::ByReceiver(id) => ("receiver_id", id),
    };
    let counterparty_column = match &query.filter {
        QueryFilter::BySender(_) => "receiver_id",
        QueryFilter::ByReceiver(_) => "sender_id",
    };
    let direction = match query.order {
        SortOrder::Ascending => "ASC",
        SortOrder::Descending => "DESC",
    };

    let mut sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE {key_column} = ?");
    if query.counterparty.is_some() {
        sql.push_str(&format!(" AND {counterparty_column} = ?"));
    }
    sql.push_str(&format!(" ORDER BY created_at {direction}, id {direction}"));
    if query.limit.is_some() {
        sql.push_str(" LIMIT ?");
    }

    let mut statement = sqlx::query_as::<_, MessageRow>(&sql).bind(key.as_str());
    if let Some(counterparty) = &query.counterparty {
        statement = statement.bind(counterparty.as_str());
    }
    if let Some(limit) = query.limit {
        statement = statement.bind(i64::try_from(limit).unwrap_or(i64::MAX));
    }

    let rows = statement.fetch_all(&database.pool).await?;
    Ok(rows.into_iter().map(Message::from).collect())
}

async fn fetch_one(database: &Database, id: &MessageId) -> Result<Option<Message>, StoreError> {
    let row = sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
    ))
    .bind(id.as_str())
    .fetch_optional(&database.pool)
    .await?;
    Ok(row.map(Message::from))
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn append(&self, message: NewMessage) -> Result<Message, StoreError> {
        let persisted = Message {
            id: MessageId::generate(),
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            content: message.content,
            created_at: now_millis(),
            read: false,
        };

        sqlx::query(
            "INSERT INTO messages (id, sender_id, receiver_id, content, created_at, read)
             VALUES (?, ?, ?, ?, ?, 0)",
        )
        .bind(persisted.id.as_str())
        .bind(persisted.sender_id.as_str())
        .bind(persisted.receiver_id.as_str())
        .bind(persisted.content.as_str())
        .bind(persisted.created_at.timestamp_millis())
        .execute(&self.database.pool)
        .await?;

        self.feed.publish(MessageChange::added(persisted.clone()));
        tracing::debug!(
            target: "careline::store::sqlite",
            "Appended message {} ({} -> {})",
            persisted.id,
            persisted.sender_id,
            persisted.receiver_id
        );
        Ok(persisted)
    }

    async fn get(&self, id: &MessageId) -> Result<Option<Message>, StoreError> {
        fetch_one(&self.database, id).await
    }

    async fn query(&self, query: &MessageQuery) -> Result<Vec<Message>, StoreError> {
        fetch_query(&self.database, query).await
    }

    async fn listen(&self, query: &MessageQuery) -> Result<ChangeStream, StoreError> {
        let receiver = self.feed.subscribe();
        let initial = fetch_query(&self.database, query).await?;
        let database = Arc::clone(&self.database);

        Ok(live_stream(query.clone(), initial, receiver, move |q| {
            let database = Arc::clone(&database);
            async move { fetch_query(&database, &q).await }
        }))
    }

    async fn update_read_flag(&self, id: &MessageId) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE messages SET read = 1 WHERE id = ? AND read = 0")
            .bind(id.as_str())
            .execute(&self.database.pool)
            .await?;

        if result.rows_affected() == 0 {
            // Either already read (no-op) or missing
            return match fetch_one(&self.database, id).await? {
                Some(_) => Ok(()),
                None => Err(StoreError::NotFound(id.clone())),
            };
        }

        if let Some(message) = fetch_one(&self.database, id).await? {
            self.feed.publish(MessageChange::modified(message));
        }
        Ok(())
    }
}
