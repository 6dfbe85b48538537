//! Merged, ordered view of one two-party conversation.
//!
//! A viewer's conversation with a partner is split across two live queries:
//! messages the viewer sent and messages the viewer received. The
//! [`StreamMerger`] folds change batches from both into a single map keyed by
//! message id and derives the ordered list from it after every batch.
//!
//! Applying batches is commutative and idempotent:
//! - upserts keep the read flag as the OR of every version seen,
//! - removals leave a tombstone so a late replay of the add cannot revive
//!   the message,
//! - ordering is `(created_at, id)`, a total order over the current set.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::messaging::read_state::ReadStateTracker;
use crate::messaging::subscription::{
    CallbackSlot, ConversationSubscription, InitialGate, SourceEvent, Subscription, spawn_source,
};
use crate::store::{MessageQuery, MessageStore, StoreError};
use crate::types::{ChangeBatch, ChangeKind, ConversationMessage, Direction, MessageId, UserId};

#[derive(Debug, Clone)]
pub struct StreamMerger {
    viewer: UserId,
    partner: UserId,
    entries: HashMap<MessageId, ConversationMessage>,
    removed: HashSet<MessageId>,
}

impl StreamMerger {
    pub fn new(viewer: UserId, partner: UserId) -> Self {
        Self {
            viewer,
            partner,
            entries: HashMap::new(),
            removed: HashSet::new(),
        }
    }

    pub fn viewer(&self) -> &UserId {
        &self.viewer
    }

    pub fn partner(&self) -> &UserId {
        &self.partner
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The query feeding `direction` for this pair.
    pub fn query_for(&self, direction: Direction) -> MessageQuery {
        match direction {
            Direction::Sent => MessageQuery::by_sender(self.viewer.clone())
                .with_counterparty(self.partner.clone()),
            Direction::Received => MessageQuery::by_receiver(self.viewer.clone())
                .with_counterparty(self.partner.clone()),
        }
    }

    /// Applies one batch from the `direction` stream.
    ///
    /// Returns the received messages in the batch that are still unread after
    /// the merge, in batch order.
    pub fn apply_batch(&mut self, direction: Direction, batch: &ChangeBatch) -> Vec<MessageId> {
        let mut unread = Vec::new();

        for change in &batch.changes {
            let message = &change.message;
            if message.counterparty(&self.viewer) != Some(&self.partner)
                || message.direction_for(&self.viewer) != Some(direction)
            {
                tracing::debug!(
                    target: "careline::messaging::stream_merger",
                    "Ignoring message {} outside {} <-> {}",
                    message.id,
                    self.viewer,
                    self.partner
                );
                continue;
            }

            match change.kind {
                ChangeKind::Added | ChangeKind::Modified => {
                    if self.removed.contains(&message.id) {
                        continue;
                    }
                    let entry = self
                        .entries
                        .entry(message.id.clone())
                        .and_modify(|existing| {
                            let read = existing.message.read || message.read;
                            existing.message = message.clone();
                            existing.message.read = read;
                        })
                        .or_insert_with(|| ConversationMessage {
                            message: message.clone(),
                            direction,
                        });

                    if entry.direction == Direction::Received && !entry.message.read {
                        unread.push(entry.message.id.clone());
                    }
                }
                ChangeKind::Removed => {
                    self.entries.remove(&message.id);
                    self.removed.insert(message.id.clone());
                }
            }
        }

        unread
    }

    /// Current view ordered by `(created_at, id)` ascending.
    pub fn snapshot(&self) -> Vec<ConversationMessage> {
        let mut ordered: Vec<ConversationMessage> = self.entries.values().cloned().collect();
        ordered.sort_by(|a, b| a.message.chronological_cmp(&b.message));
        ordered
    }
}

/// Opens both live queries for `viewer <-> partner` and feeds merged
/// snapshots to `on_update`.
///
/// The first callback fires once both streams have produced their initial
/// batch, or failed. After that every batch yields one callback. If only one
/// stream can be opened the view is served from it alone.
pub(crate) async fn subscribe<F>(
    store: Arc<dyn MessageStore>,
    read_state: Option<ReadStateTracker>,
    viewer: UserId,
    partner: UserId,
    on_update: F,
) -> Result<ConversationSubscription, StoreError>
where
    F: FnMut(Vec<ConversationMessage>) + Send + 'static,
{
    let mut merger = StreamMerger::new(viewer, partner);
    let sent_query = merger.query_for(Direction::Sent);
    let received_query = merger.query_for(Direction::Received);
    let (sent, received) = tokio::join!(store.listen(&sent_query), store.listen(&received_query));

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut gate = InitialGate::default();
    let mut tasks = Vec::with_capacity(3);
    let mut sources = 0usize;
    let mut first_error = None;

    for (direction, opened) in [(Direction::Sent, sent), (Direction::Received, received)] {
        match opened {
            Ok(changes) => {
                tasks.push(spawn_source(direction, changes, events_tx.clone()));
                sources += 1;
            }
            Err(e) => {
                tracing::warn!(
                    target: "careline::messaging::stream_merger",
                    "Could not open {:?} stream for {} <-> {}: {}",
                    direction,
                    merger.viewer,
                    merger.partner,
                    e
                );
                gate.settle(direction);
                first_error.get_or_insert(e);
            }
        }
    }
    drop(events_tx);

    if sources == 0 {
        return Err(first_error.unwrap_or(StoreError::Closed));
    }

    let slot = CallbackSlot::new(on_update);
    let consumer_slot = Arc::clone(&slot);

    let consumer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            if consumer_slot.is_closed() {
                break;
            }
            let was_open = gate.is_open();

            match event {
                SourceEvent::Batch(direction, batch) => {
                    let unread = merger.apply_batch(direction, &batch);
                    if batch.initial {
                        gate.settle(direction);
                    }
                    if gate.is_open() {
                        consumer_slot.deliver(merger.snapshot());
                    }
                    // Marking happens after emission and never blocks it
                    if let Some(tracker) = &read_state {
                        for id in unread {
                            tracker.mark_in_background(id);
                        }
                    }
                }
                SourceEvent::Failed(direction, reason) => {
                    tracing::warn!(
                        target: "careline::messaging::stream_merger",
                        "{:?} stream for {} <-> {} failed, serving last known view: {}",
                        direction,
                        merger.viewer,
                        merger.partner,
                        reason
                    );
                    gate.settle(direction);
                    if !was_open && gate.is_open() {
                        consumer_slot.deliver(merger.snapshot());
                    }
                }
                SourceEvent::Ended(direction) => {
                    tracing::debug!(
                        target: "careline::messaging::stream_merger",
                        "{:?} stream for {} <-> {} ended",
                        direction,
                        merger.viewer,
                        merger.partner
                    );
                    gate.settle(direction);
                    if !was_open && gate.is_open() {
                        consumer_slot.deliver(merger.snapshot());
                    }
                }
            }
        }
    });
    tasks.push(consumer);

    Ok(Subscription::new(slot, tasks))
}

#[cfg(test)]
mod tests;
