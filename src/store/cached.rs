//! Read-through cache decorator for any [`MessageStore`].
//!
//! Remembers the messages it has seen and which queries it has fully
//! observed. When the wrapped store reports a retryable failure, reads for
//! an observed query are answered from the cache instead of failing.
//! Writes are never cached or queued.
//!
//! The cache holds at most `capacity` messages. Reaching the bound drops
//! everything, primed queries included, and starts a new generation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use futures::{StreamExt, stream};

use super::{ChangeStream, MessageQuery, MessageStore, StoreError};
use crate::types::{ChangeBatch, ChangeKind, Message, MessageId, NewMessage};

/// Upper bound on cached messages used by [`CachedMessageStore::new`].
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

struct CacheState {
    messages: DashMap<MessageId, Message>,
    /// Queries whose complete result set is in `messages`, limits stripped.
    primed: DashSet<MessageQuery>,
    capacity: usize,
    /// Bumped on every eviction so in-progress priming can tell it raced one.
    generation: AtomicU64,
}

impl CacheState {
    fn new(capacity: usize) -> Self {
        Self {
            messages: DashMap::new(),
            primed: DashSet::new(),
            capacity: capacity.max(1),
            generation: AtomicU64::new(0),
        }
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn remember(&self, message: &Message) {
        match self.messages.get_mut(&message.id) {
            // Read flag only ever moves false -> true
            Some(mut existing) => {
                let read = existing.read || message.read;
                *existing = message.clone();
                existing.read = read;
            }
            None => {
                if self.messages.len() >= self.capacity {
                    self.evict_all();
                }
                self.messages.insert(message.id.clone(), message.clone());
            }
        }
    }

    fn evict_all(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.primed.clear();
        self.messages.clear();
        tracing::debug!(
            target: "careline::store::cached",
            "Message cache reached {} entries, evicted",
            self.capacity
        );
    }

    fn apply_batch(&self, batch: &ChangeBatch) {
        for change in &batch.changes {
            match change.kind {
                ChangeKind::Added | ChangeKind::Modified => self.remember(&change.message),
                ChangeKind::Removed => {
                    self.messages.remove(&change.message.id);
                }
            }
        }
    }

    /// Records `query` as complete unless an eviction happened since
    /// `generation` was read.
    fn prime(&self, query: &MessageQuery, generation: u64) {
        if self.generation() == generation {
            self.primed.insert(unbounded(query));
        }
    }

    fn cached_result(&self, query: &MessageQuery) -> Option<Vec<Message>> {
        if !self.primed.contains(&unbounded(query)) {
            return None;
        }
        Some(query.apply(self.messages.iter().map(|entry| entry.value().clone())))
    }
}

fn unbounded(query: &MessageQuery) -> MessageQuery {
    let mut key = query.clone();
    key.limit = None;
    key
}

pub struct CachedMessageStore<S> {
    inner: S,
    cache: Arc<CacheState>,
}

impl<S: MessageStore> CachedMessageStore<S> {
    pub fn new(inner: S) -> Self {
        Self::with_capacity(inner, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(inner: S, capacity: usize) -> Self {
        Self {
            inner,
            cache: Arc::new(CacheState::new(capacity)),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    #[cfg(test)]
    fn cached_len(&self) -> usize {
        self.cache.messages.len()
    }
}

#[async_trait]
impl<S: MessageStore> MessageStore for CachedMessageStore<S> {
    async fn append(&self, message: NewMessage) -> Result<Message, StoreError> {
        let persisted = self.inner.append(message).await?;
        self.cache.remember(&persisted);
        Ok(persisted)
    }

    async fn get(&self, id: &MessageId) -> Result<Option<Message>, StoreError> {
        match self.inner.get(id).await {
            Ok(found) => {
                if let Some(message) = &found {
                    self.cache.remember(message);
                }
                Ok(found)
            }
            Err(e) if e.is_retryable() => match self.cache.messages.get(id) {
                Some(entry) => {
                    tracing::warn!(
                        target: "careline::store::cached",
                        "Serving cached message {} while store is unavailable: {}",
                        id,
                        e
                    );
                    Ok(Some(entry.value().clone()))
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    async fn query(&self, query: &MessageQuery) -> Result<Vec<Message>, StoreError> {
        match self.inner.query(query).await {
            Ok(messages) => {
                let generation = self.cache.generation();
                for message in &messages {
                    self.cache.remember(message);
                }
                if query.limit.is_none() {
                    self.cache.prime(query, generation);
                }
                Ok(messages)
            }
            Err(e) if e.is_retryable() => match self.cache.cached_result(query) {
                Some(messages) => {
                    tracing::warn!(
                        target: "careline::store::cached",
                        "Serving {} cached messages for {:?}: {}",
                        messages.len(),
                        query.filter,
                        e
                    );
                    Ok(messages)
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    async fn listen(&self, query: &MessageQuery) -> Result<ChangeStream, StoreError> {
        match self.inner.listen(query).await {
            Ok(changes) => {
                let cache = Arc::clone(&self.cache);
                let key = query.clone();
                Ok(changes
                    .inspect(move |item| {
                        if let Ok(batch) = item {
                            let generation = cache.generation();
                            cache.apply_batch(batch);
                            if batch.initial && key.limit.is_none() {
                                cache.prime(&key, generation);
                            }
                        }
                    })
                    .boxed())
            }
            Err(e) if e.is_retryable() => match self.cache.cached_result(query) {
                Some(messages) => {
                    tracing::warn!(
                        target: "careline::store::cached",
                        "Listening on cached snapshot for {:?}: {}",
                        query.filter,
                        e
                    );
                    Ok(stream::once(async move {
                        Ok::<_, StoreError>(ChangeBatch::initial(messages))
                    })
                    .boxed())
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    async fn update_read_flag(&self, id: &MessageId) -> Result<(), StoreError> {
        self.inner.update_read_flag(id).await?;
        if let Some(mut entry) = self.cache.messages.get_mut(id) {
            entry.read = true;
        }
        Ok(())
    }
}
