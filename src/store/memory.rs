use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::live::{ChangeFeed, live_stream};
use super::{ChangeStream, DEFAULT_LISTEN_BUFFER, MessageQuery, MessageStore, StoreError};
use crate::types::{Message, MessageChange, MessageId, NewMessage, now_millis};

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Process-local realtime store.
///
/// Backs tests and embedded deployments. Listeners see every write made
/// through this instance.
pub struct InMemoryMessageStore {
    messages: Arc<DashMap<MessageId, Message>>,
    feed: ChangeFeed,
    clock: Clock,
    available: AtomicBool,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_LISTEN_BUFFER)
    }

    pub fn with_capacity(listen_buffer: usize) -> Self {
        Self {
            messages: Arc::new(DashMap::new()),
            feed: ChangeFeed::new(listen_buffer),
            clock: Arc::new(now_millis),
            available: AtomicBool::new(true),
        }
    }

    /// Replaces the timestamp source used for `created_at`.
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Simulates a partition: while unavailable every call fails with
    /// [`StoreError::Unavailable`] and open listeners receive an error.
    pub fn set_available(&self, available: bool) {
        let was = self.available.swap(available, Ordering::SeqCst);
        if was && !available {
            self.feed.interrupt("in-memory store marked unavailable");
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn listener_count(&self) -> usize {
        self.feed.listener_count()
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ))
        }
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot(messages: &DashMap<MessageId, Message>, query: &MessageQuery) -> Vec<Message> {
    query.apply(messages.iter().map(|entry| entry.value().clone()))
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append(&self, message: NewMessage) -> Result<Message, StoreError> {
        self.ensure_available()?;

        let persisted = Message {
            id: MessageId::generate(),
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            content: message.content,
            created_at: (self.clock)(),
            read: false,
        };
        self.messages
            .insert(persisted.id.clone(), persisted.clone());
        self.feed.publish(MessageChange::added(persisted.clone()));

        tracing::debug!(
            target: "careline::store::memory",
            "Appended message {} ({} -> {})",
            persisted.id,
            persisted.sender_id,
            persisted.receiver_id
        );
        Ok(persisted)
    }

    async fn get(&self, id: &MessageId) -> Result<Option<Message>, StoreError> {
        self.ensure_available()?;
        Ok(self.messages.get(id).map(|entry| entry.value().clone()))
    }

    async fn query(&self, query: &MessageQuery) -> Result<Vec<Message>, StoreError> {
        self.ensure_available()?;
        Ok(snapshot(&self.messages, query))
    }

    async fn listen(&self, query: &MessageQuery) -> Result<ChangeStream, StoreError> {
        self.ensure_available()?;

        let receiver = self.feed.subscribe();
        let initial = snapshot(&self.messages, query);
        let messages = Arc::clone(&self.messages);

        Ok(live_stream(query.clone(), initial, receiver, move |q| {
            let result = Ok(snapshot(&messages, &q));
            async move { result }
        }))
    }

    async fn update_read_flag(&self, id: &MessageId) -> Result<(), StoreError> {
        self.ensure_available()?;

        let updated = {
            let mut entry = self
                .messages
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            if entry.read {
                None
            } else {
                entry.read = true;
                Some(entry.clone())
            }
        };

        if let Some(message) = updated {
            self.feed.publish(MessageChange::modified(message));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeKind, UserId};
    use futures::StreamExt;

    fn draft(from: &str, to: &str, content: &str) -> NewMessage {
        NewMessage {
            sender_id: UserId::new(from),
            receiver_id: UserId::new(to),
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn append_assigns_id_and_timestamp() {
        let fixed = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let store = InMemoryMessageStore::new().with_clock(move || fixed);

        let message = store.append(draft("alice", "bob", "hi")).await.unwrap();

        assert!(!message.id.as_str().is_empty());
        assert_eq!(message.created_at, fixed);
        assert!(!message.read);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn query_by_sender_and_receiver() {
        let store = InMemoryMessageStore::new();
        store.append(draft("alice", "bob", "1")).await.unwrap();
        store.append(draft("bob", "alice", "2")).await.unwrap();
        store.append(draft("carol", "bob", "3")).await.unwrap();

        let alice = UserId::new("alice");
        let bob = UserId::new("bob");
        let sent = store
            .query_by_sender(&alice, Default::default())
            .await
            .unwrap();
        let received = store
            .query_by_receiver(&bob, Default::default())
            .await
            .unwrap();

        assert_eq!(sent.len(), 1);
        assert_eq!(received.len(), 2);
    }

    #[tokio::test]
    async fn update_read_flag_publishes_once() {
        let store = InMemoryMessageStore::new();
        let message = store.append(draft("alice", "bob", "hi")).await.unwrap();

        let mut stream = store.listen_by_receiver(&UserId::new("bob")).await.unwrap();
        let initial = stream.next().await.unwrap().unwrap();
        assert_eq!(initial.changes.len(), 1);

        store.update_read_flag(&message.id).await.unwrap();
        store.update_read_flag(&message.id).await.unwrap();
        store.append(draft("carol", "bob", "marker")).await.unwrap();

        let batch = stream.next().await.unwrap().unwrap();
        let kinds: Vec<ChangeKind> = batch.changes.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Modified, ChangeKind::Added]);
        assert!(batch.changes[0].message.read);
    }

    #[tokio::test]
    async fn update_read_flag_unknown_message() {
        let store = InMemoryMessageStore::new();
        let err = store
            .update_read_flag(&MessageId::new("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn unavailable_store_rejects_calls_and_interrupts_listeners() {
        let store = InMemoryMessageStore::new();
        let mut stream = store.listen_by_sender(&UserId::new("alice")).await.unwrap();
        let _initial = stream.next().await.unwrap().unwrap();

        store.set_available(false);

        let err = store.append(draft("alice", "bob", "hi")).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(stream.next().await.unwrap().is_err());

        store.set_available(true);
        store.append(draft("alice", "bob", "back")).await.unwrap();
        let batch = stream.next().await.unwrap().unwrap();
        assert_eq!(batch.changes[0].message.content, "back");
    }
}
