//! Unread -> Read transitions.
//!
//! The flag is monotonic: once a message is read nothing sets it back, so
//! concurrent marks can only ever agree.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::Mutex;

use crate::error::{CarelineError, Result};
use crate::store::{MessageQuery, MessageStore};
use crate::types::{MessageId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTransition {
    MarkedRead,
    AlreadyRead,
}

#[derive(Clone)]
pub struct ReadStateTracker {
    store: Arc<dyn MessageStore>,
    /// One turn lock per message currently being marked.
    in_flight: Arc<DashMap<MessageId, Arc<Mutex<()>>>>,
}

/// Holds a reference to a message's turn lock. The last holder removes the
/// entry, even if the marking future is dropped.
struct InFlightClaim<'a> {
    in_flight: &'a DashMap<MessageId, Arc<Mutex<()>>>,
    id: MessageId,
    turn: Arc<Mutex<()>>,
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        // The map and this claim are the only holders left
        self.in_flight
            .remove_if(&self.id, |_, turn| Arc::strong_count(turn) <= 2);
    }
}

impl ReadStateTracker {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Marks `id` read.
    ///
    /// Concurrent calls for the same message take turns. A caller that waited
    /// re-reads the message, so it reports `AlreadyRead` only once the earlier
    /// write has landed, and retries the write itself if that one failed.
    pub async fn mark_as_read(&self, id: &MessageId) -> Result<ReadTransition> {
        let claim = InFlightClaim {
            in_flight: &self.in_flight,
            id: id.clone(),
            turn: self.in_flight.entry(id.clone()).or_default().clone(),
        };
        let _turn = claim.turn.lock().await;

        let message = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| CarelineError::MessageNotFound(id.clone()))?;
        if message.read {
            tracing::debug!(
                target: "careline::messaging::read_state",
                "Message {} is already read",
                id
            );
            return Ok(ReadTransition::AlreadyRead);
        }

        self.store.update_read_flag(id).await?;
        tracing::debug!(
            target: "careline::messaging::read_state",
            "Marked message {} read",
            id
        );
        Ok(ReadTransition::MarkedRead)
    }

    /// Fire-and-forget variant used when a received message enters view.
    pub fn mark_in_background(&self, id: MessageId) {
        let tracker = self.clone();
        tokio::spawn(async move {
            if let Err(e) = tracker.mark_as_read(&id).await {
                tracing::warn!(
                    target: "careline::messaging::read_state",
                    "ReadMarkFailure for message {}: {}",
                    id,
                    e
                );
            }
        });
    }

    /// Marks everything `partner` sent to `viewer` as read. Returns how many
    /// messages actually changed.
    pub async fn mark_conversation_read(&self, viewer: &UserId, partner: &UserId) -> Result<usize> {
        let query = MessageQuery::by_receiver(viewer.clone()).with_counterparty(partner.clone());
        let unread: Vec<MessageId> = self
            .store
            .query(&query)
            .await?
            .into_iter()
            .filter(|message| !message.read)
            .map(|message| message.id)
            .collect();

        let results = join_all(unread.iter().map(|id| self.mark_as_read(id))).await;
        let mut marked = 0;
        for result in results {
            if result? == ReadTransition::MarkedRead {
                marked += 1;
            }
        }
        Ok(marked)
    }

    #[cfg(test)]
    pub(crate) fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }
}
