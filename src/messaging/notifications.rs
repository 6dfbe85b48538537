//! "Message sent" events for external notification delivery.
//!
//! Dispatch happens after the message is persisted and never influences the
//! outcome of a send.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::types::{Message, Role, UserId};

const BUFFER_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSentEvent {
    pub message: Message,
    pub sender_display_name: String,
    pub sender_role: Role,
}

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn message_sent(&self, event: MessageSentEvent) -> Result<(), NotificationError>;
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl NotificationDispatcher for NoopNotifier {
    async fn message_sent(&self, _event: MessageSentEvent) -> Result<(), NotificationError> {
        Ok(())
    }
}

/// In-process inboxes: each user can watch for messages addressed to them.
///
/// An inbox opens on the first `watch_inbox` and closes once a delivery finds
/// nobody watching it any more.
pub struct BroadcastNotifier {
    inboxes: DashMap<UserId, broadcast::Sender<MessageSentEvent>>,
}

impl BroadcastNotifier {
    pub fn new() -> Self {
        Self {
            inboxes: DashMap::new(),
        }
    }

    pub fn watch_inbox(&self, user_id: &UserId) -> broadcast::Receiver<MessageSentEvent> {
        self.inboxes
            .entry(user_id.clone())
            .or_insert_with(|| broadcast::channel(BUFFER_SIZE).0)
            .subscribe()
    }

    /// Delivers `event` to its message's receiver. Returns how many watchers
    /// got it.
    pub fn deliver(&self, event: MessageSentEvent) -> usize {
        let receiver_id = event.message.receiver_id.clone();
        let delivered = match self.inboxes.get(&receiver_id) {
            Some(inbox) => inbox.send(event).unwrap_or(0),
            None => return 0,
        };
        if delivered == 0
            && self
                .inboxes
                .remove_if(&receiver_id, |_, inbox| inbox.receiver_count() == 0)
                .is_some()
        {
            tracing::debug!(
                target: "careline::messaging::notifications",
                "Closed unwatched inbox for {}",
                receiver_id
            );
        }
        delivered
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationDispatcher for BroadcastNotifier {
    async fn message_sent(&self, event: MessageSentEvent) -> Result<(), NotificationError> {
        self.deliver(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::types::MessageId;

    fn make_event(id: &str, to: &str) -> MessageSentEvent {
        MessageSentEvent {
            message: Message {
                id: MessageId::new(id),
                sender_id: UserId::new("p1"),
                receiver_id: UserId::new(to),
                content: "test message".to_string(),
                created_at: Utc::now(),
                read: false,
            },
            sender_display_name: "Pat".to_string(),
            sender_role: Role::Patient,
        }
    }

    #[test]
    fn watchers_of_one_inbox_share_a_channel() {
        let notifier = BroadcastNotifier::new();
        let nurse = UserId::new("n1");

        let _first = notifier.watch_inbox(&nurse);
        let _second = notifier.watch_inbox(&nurse);

        assert_eq!(notifier.inboxes.len(), 1);
        assert_eq!(notifier.inboxes.get(&nurse).unwrap().receiver_count(), 2);
    }

    #[tokio::test]
    async fn message_sent_reaches_the_receiver_only() {
        let notifier = BroadcastNotifier::new();
        let mut nurse_inbox = notifier.watch_inbox(&UserId::new("n1"));
        let mut doctor_inbox = notifier.watch_inbox(&UserId::new("d1"));

        notifier
            .message_sent(make_event("msg1", "n1"))
            .await
            .unwrap();

        let received = nurse_inbox.try_recv().expect("nurse should get the event");
        assert_eq!(received.message.id.as_str(), "msg1");
        assert_eq!(received.sender_display_name, "Pat");
        assert!(doctor_inbox.try_recv().is_err());
    }

    #[test]
    fn delivery_to_an_unwatched_user_is_dropped() {
        let notifier = BroadcastNotifier::new();

        assert_eq!(notifier.deliver(make_event("msg2", "n1")), 0);
        assert!(notifier.inboxes.is_empty());
    }

    #[test]
    fn inbox_closes_once_every_watcher_is_gone() {
        let notifier = BroadcastNotifier::new();
        let nurse = UserId::new("n1");

        let inbox = notifier.watch_inbox(&nurse);
        assert_eq!(notifier.deliver(make_event("msg3", "n1")), 1);
        drop(inbox);
        assert!(notifier.inboxes.contains_key(&nurse));

        assert_eq!(notifier.deliver(make_event("msg4", "n1")), 0);
        assert!(!notifier.inboxes.contains_key(&nurse));
    }
}
