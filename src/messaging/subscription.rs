//! Subscription handles shared by conversation and conversation-list views.
//!
//! The callback lives in a [`CallbackSlot`]. Delivery holds the slot's lock
//! for the duration of the callback, and closing the slot takes the same
//! lock, so once [`Subscription::unsubscribe`] returns no callback is running
//! and none will start. Unsubscribing from inside the callback deadlocks and
//! is not supported.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::store::ChangeStream;
use crate::types::{ChangeBatch, Conversation, ConversationMessage, Direction};

type Callback<T> = Box<dyn FnMut(T) + Send + 'static>;

pub(crate) struct CallbackSlot<T> {
    callback: Mutex<Option<Callback<T>>>,
    closed: AtomicBool,
}

impl<T> CallbackSlot<T> {
    pub(crate) fn new<F>(callback: F) -> Arc<Self>
    where
        F: FnMut(T) + Send + 'static,
    {
        Arc::new(Self {
            callback: Mutex::new(Some(Box::new(callback))),
            closed: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<Callback<T>>> {
        // A panicking callback poisons the lock; the slot itself is still valid
        self.callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Invokes the callback unless the slot is closed. Returns whether it ran.
    pub(crate) fn deliver(&self, value: T) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut guard = self.lock();
        if self.is_closed() {
            return false;
        }
        match guard.as_mut() {
            Some(callback) => {
                callback(value);
                true
            }
            None => false,
        }
    }

    /// Waits for an in-flight delivery, then drops the callback.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut guard = self.lock();
        guard.take();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Handle to a live view. Dropping it unsubscribes.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription<T> {
    slot: Arc<CallbackSlot<T>>,
    tasks: Vec<JoinHandle<()>>,
}

pub type ConversationSubscription = Subscription<Vec<ConversationMessage>>;
pub type ConversationListSubscription = Subscription<Vec<Conversation>>;

impl<T> Subscription<T> {
    pub(crate) fn new(slot: Arc<CallbackSlot<T>>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { slot, tasks }
    }

    /// Detaches both underlying listeners. After this returns the callback is
    /// never invoked again.
    pub fn unsubscribe(mut self) {
        self.shutdown();
    }

    pub fn is_active(&self) -> bool {
        !self.slot.is_closed() && self.tasks.iter().any(|task| !task.is_finished())
    }

    fn shutdown(&mut self) {
        self.slot.close();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// What a source task forwards to the view's single consumer.
#[derive(Debug)]
pub(crate) enum SourceEvent {
    Batch(Direction, ChangeBatch),
    Failed(Direction, String),
    Ended(Direction),
}

/// Forwards one live query into the consumer channel until the stream ends
/// or the consumer goes away.
pub(crate) fn spawn_source(
    direction: Direction,
    mut changes: ChangeStream,
    events: mpsc::UnboundedSender<SourceEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = changes.next().await {
            let event = match item {
                Ok(batch) => SourceEvent::Batch(direction, batch),
                Err(e) => SourceEvent::Failed(direction, e.to_string()),
            };
            if events.send(event).is_err() {
                return;
            }
        }
        let _ = events.send(SourceEvent::Ended(direction));
    })
}

/// Tracks whether both sources have settled their first batch.
///
/// A source settles by delivering its initial snapshot, failing or ending.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct InitialGate {
    sent: bool,
    received: bool,
}

impl InitialGate {
    pub(crate) fn settle(&mut self, direction: Direction) {
        match direction {
            Direction::Sent => self.sent = true,
            Direction::Received => self.received = true,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.sent && self.received
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn closed_slot_never_delivers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let slot = CallbackSlot::new(move |_: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(slot.deliver(1));
        slot.close();
        assert!(!slot.deliver(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_waits_for_running_callback() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let slot = CallbackSlot::new(move |_: ()| {
            let _ = started_tx.send(());
            std::thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
        });

        let delivering = Arc::clone(&slot);
        let worker = std::thread::spawn(move || delivering.deliver(()));
        started_rx.recv().unwrap();

        slot.close();
        assert!(finished.load(Ordering::SeqCst));
        assert!(worker.join().unwrap());
    }

    #[test]
    fn gate_opens_after_both_directions() {
        let mut gate = InitialGate::default();
        assert!(!gate.is_open());
        gate.settle(Direction::Sent);
        assert!(!gate.is_open());
        gate.settle(Direction::Sent);
        assert!(!gate.is_open());
        gate.settle(Direction::Received);
        assert!(gate.is_open());
    }

    #[tokio::test]
    async fn dropping_subscription_closes_slot_and_aborts_tasks() {
        let slot = CallbackSlot::new(|_: ()| {});
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let subscription = Subscription::new(Arc::clone(&slot), vec![task]);
        assert!(subscription.is_active());

        subscription.unsubscribe();
        assert!(slot.is_closed());
    }
}
