use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::directory::{PresenceTracker, UserDirectory};
use crate::error::{CarelineError, Result};
use crate::messaging::subscription::{
    CallbackSlot, ConversationListSubscription, InitialGate, SourceEvent, Subscription,
    spawn_source,
};
use crate::store::{MessageQuery, MessageStore, SortOrder};
use crate::types::{
    ChangeBatch, ChangeKind, Conversation, Direction, Message, MessageId, UserId, UserProfile,
};

/// Per-counterparty result of reducing a user's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub counterparty_id: UserId,
    pub last_message: Message,
    pub unread_count: usize,
}

/// Reduces both halves of `viewer`'s history to one summary per counterparty.
///
/// `last_message` is the maximum by `(created_at, id)`. Unread counts come
/// from `received` only. Messages not involving `viewer` are skipped.
pub fn reduce_conversations(
    viewer: &UserId,
    sent: &[Message],
    received: &[Message],
) -> HashMap<UserId, ConversationSummary> {
    let mut summaries: HashMap<UserId, ConversationSummary> = HashMap::new();

    for message in sent.iter().chain(received) {
        let Some(counterparty) = message.counterparty(viewer) else {
            continue;
        };
        summaries
            .entry(counterparty.clone())
            .and_modify(|summary| {
                if message.chronological_cmp(&summary.last_message).is_gt() {
                    summary.last_message = message.clone();
                }
            })
            .or_insert_with(|| ConversationSummary {
                counterparty_id: counterparty.clone(),
                last_message: message.clone(),
                unread_count: 0,
            });
    }

    for message in received {
        if &message.receiver_id != viewer || message.read {
            continue;
        }
        if let Some(summary) = summaries.get_mut(&message.sender_id) {
            summary.unread_count += 1;
        }
    }

    summaries
}

/// Looks up every counterparty in one batch.
///
/// A lookup that fails for any reason yields the "Unknown User" placeholder
/// instead of failing the whole list.
pub async fn resolve_profiles(
    directory: &dyn UserDirectory,
    ids: &[UserId],
) -> HashMap<UserId, UserProfile> {
    directory
        .get_users(ids)
        .await
        .into_iter()
        .map(|(id, lookup)| {
            let profile = match lookup {
                Ok(user) => UserProfile::from(user),
                Err(e) => {
                    tracing::warn!(
                        target: "careline::messaging::conversations",
                        "Could not resolve counterparty {}: {}",
                        id,
                        e
                    );
                    UserProfile::unknown(id.clone())
                }
            };
            (id, profile)
        })
        .collect()
}

/// Builds conversation rows, most recent activity first.
fn assemble_conversations(
    summaries: HashMap<UserId, ConversationSummary>,
    profiles: &HashMap<UserId, UserProfile>,
    presence: &dyn PresenceTracker,
) -> Vec<Conversation> {
    let mut rows: Vec<Conversation> = summaries
        .into_values()
        .map(|summary| {
            let counterparty = profiles
                .get(&summary.counterparty_id)
                .cloned()
                .unwrap_or_else(|| UserProfile::unknown(summary.counterparty_id.clone()));
            Conversation {
                online: presence.is_online(&summary.counterparty_id),
                counterparty_id: summary.counterparty_id,
                counterparty,
                last_message: summary.last_message,
                unread_count: summary.unread_count,
            }
        })
        .collect();

    rows.sort_by(|a, b| b.last_message.chronological_cmp(&a.last_message));
    rows
}

/// Live copy of one source query's result set.
#[derive(Debug, Default)]
struct MessageSet {
    messages: HashMap<MessageId, Message>,
    removed: HashSet<MessageId>,
}

impl MessageSet {
    fn apply(&mut self, batch: &ChangeBatch) {
        for change in &batch.changes {
            let message = &change.message;
            match change.kind {
                ChangeKind::Added | ChangeKind::Modified => {
                    if self.removed.contains(&message.id) {
                        continue;
                    }
                    self.messages
                        .entry(message.id.clone())
                        .and_modify(|existing| {
                            let read = existing.read || message.read;
                            *existing = message.clone();
                            existing.read = read;
                        })
                        .or_insert_with(|| message.clone());
                }
                ChangeKind::Removed => {
                    self.messages.remove(&message.id);
                    self.removed.insert(message.id.clone());
                }
            }
        }
    }

    fn to_vec(&self) -> Vec<Message> {
        self.messages.values().cloned().collect()
    }
}

#[derive(Clone)]
pub struct ConversationAggregator {
    store: Arc<dyn MessageStore>,
    directory: Arc<dyn UserDirectory>,
    presence: Arc<dyn PresenceTracker>,
}

impl ConversationAggregator {
    pub fn new(
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn UserDirectory>,
        presence: Arc<dyn PresenceTracker>,
    ) -> Self {
        Self {
            store,
            directory,
            presence,
        }
    }

    /// One-shot conversation list for `user_id`.
    pub async fn list(&self, user_id: &UserId) -> Result<Vec<Conversation>> {
        let (sent, received) = tokio::try_join!(
            self.store.query_by_sender(user_id, SortOrder::Descending),
            self.store.query_by_receiver(user_id, SortOrder::Descending),
        )?;

        let summaries = reduce_conversations(user_id, &sent, &received);
        let ids: Vec<UserId> = summaries.keys().cloned().collect();
        let profiles = resolve_profiles(self.directory.as_ref(), &ids).await;

        tracing::debug!(
            target: "careline::messaging::conversations",
            "Listed {} conversations for {}",
            summaries.len(),
            user_id
        );
        Ok(assemble_conversations(
            summaries,
            &profiles,
            self.presence.as_ref(),
        ))
    }

    /// Re-runs the reduction every time either source stream emits.
    ///
    /// Same delivery contract as a conversation subscription: the first
    /// callback waits for both initial snapshots, and nothing is delivered
    /// after unsubscribing.
    pub async fn subscribe<F>(
        &self,
        user_id: &UserId,
        on_update: F,
    ) -> Result<ConversationListSubscription>
    where
        F: FnMut(Vec<Conversation>) + Send + 'static,
    {
        let sent_query = MessageQuery::by_sender(user_id.clone());
        let received_query = MessageQuery::by_receiver(user_id.clone());
        let (sent, received) = tokio::join!(
            self.store.listen(&sent_query),
            self.store.listen(&received_query)
        );

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut gate = InitialGate::default();
        let mut tasks = Vec::with_capacity(3);
        let mut first_error = None;

        for (direction, opened) in [(Direction::Sent, sent), (Direction::Received, received)] {
            match opened {
                Ok(changes) => tasks.push(spawn_source(direction, changes, events_tx.clone())),
                Err(e) => {
                    tracing::warn!(
                        target: "careline::messaging::conversations",
                        "Could not open {:?} stream for {}: {}",
                        direction,
                        user_id,
                        e
                    );
                    gate.settle(direction);
                    first_error.get_or_insert(e);
                }
            }
        }
        drop(events_tx);

        if tasks.is_empty() {
            return Err(first_error.map(CarelineError::from).unwrap_or_else(|| {
                CarelineError::StoreUnavailable("no conversation streams".to_string())
            }));
        }

        let slot = CallbackSlot::new(on_update);
        let consumer_slot = Arc::clone(&slot);
        let aggregator = self.clone();
        let viewer = user_id.clone();

        let consumer = tokio::spawn(async move {
            let mut sent = MessageSet::default();
            let mut received = MessageSet::default();
            let mut profiles: HashMap<UserId, UserProfile> = HashMap::new();

            while let Some(event) = events_rx.recv().await {
                if consumer_slot.is_closed() {
                    break;
                }
                let was_open = gate.is_open();

                let changed = match event {
                    SourceEvent::Batch(direction, batch) => {
                        match direction {
                            Direction::Sent => sent.apply(&batch),
                            Direction::Received => received.apply(&batch),
                        }
                        if batch.initial {
                            gate.settle(direction);
                        }
                        true
                    }
                    SourceEvent::Failed(direction, reason) => {
                        tracing::warn!(
                            target: "careline::messaging::conversations",
                            "{:?} stream for {} failed, serving last known list: {}",
                            direction,
                            viewer,
                            reason
                        );
                        gate.settle(direction);
                        false
                    }
                    SourceEvent::Ended(direction) => {
                        gate.settle(direction);
                        false
                    }
                };

                // Emit on every change, and once when the gate first opens
                if !gate.is_open() || (was_open && !changed) {
                    continue;
                }

                let summaries = reduce_conversations(&viewer, &sent.to_vec(), &received.to_vec());
                let missing: Vec<UserId> = summaries
                    .keys()
                    .filter(|id| profiles.get(*id).is_none_or(UserProfile::is_unknown))
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    profiles.extend(
                        resolve_profiles(aggregator.directory.as_ref(), &missing).await,
                    );
                }

                let rows =
                    assemble_conversations(summaries, &profiles, aggregator.presence.as_ref());
                consumer_slot.deliver(rows);
            }
        });
        tasks.push(consumer);

        Ok(Subscription::new(slot, tasks))
    }
}
