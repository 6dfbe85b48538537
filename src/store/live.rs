use std::future::Future;

use futures::StreamExt;
use futures::stream;
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};

use super::{ChangeStream, MessageQuery, StoreError};
use crate::types::{ChangeBatch, Message, MessageChange};

/// What a store publishes to its live listeners.
#[derive(Debug, Clone)]
pub(crate) enum FeedEvent {
    Change(MessageChange),
    /// Transient failure that every open listener should surface as an error.
    Interrupted(String),
}

/// Fan-out of store writes to live queries.
#[derive(Debug)]
pub(crate) struct ChangeFeed {
    sender: broadcast::Sender<FeedEvent>,
}

impl ChangeFeed {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub(crate) fn publish(&self, change: MessageChange) {
        // No listeners is the common case and not an error
        let _ = self.sender.send(FeedEvent::Change(change));
    }

    pub(crate) fn interrupt(&self, reason: impl Into<String>) {
        let _ = self.sender.send(FeedEvent::Interrupted(reason.into()));
    }

    /// Must be called before reading the snapshot so no write falls between
    /// the two.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.sender.subscribe()
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

struct LiveState<F> {
    query: MessageQuery,
    initial: Option<Vec<Message>>,
    receiver: broadcast::Receiver<FeedEvent>,
    resnapshot: F,
    pending_interruption: Option<String>,
}

/// Builds a [`ChangeStream`] from a snapshot and a feed subscription.
///
/// Changes already waiting in the feed are drained into the same batch. If
/// the receiver lags behind the feed, the stream re-reads the query through
/// `resnapshot` and emits every current match as `Added`.
pub(crate) fn live_stream<F, Fut>(
    query: MessageQuery,
    initial: Vec<Message>,
    receiver: broadcast::Receiver<FeedEvent>,
    resnapshot: F,
) -> ChangeStream
where
    F: Fn(MessageQuery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Message>, StoreError>> + Send + 'static,
{
    let state = LiveState {
        query,
        initial: Some(initial),
        receiver,
        resnapshot,
        pending_interruption: None,
    };

    stream::unfold(state, |mut state| async move {
        if let Some(initial) = state.initial.take() {
            return Some((Ok(ChangeBatch::initial(initial)), state));
        }

        loop {
            if let Some(reason) = state.pending_interruption.take() {
                return Some((Err(StoreError::Unavailable(reason)), state));
            }

            let mut changes = Vec::new();
            let mut lagged = false;

            match state.receiver.recv().await {
                Ok(FeedEvent::Change(change)) => {
                    if state.query.matches(&change.message) {
                        changes.push(change);
                    }
                }
                Ok(FeedEvent::Interrupted(reason)) => {
                    return Some((Err(StoreError::Unavailable(reason)), state));
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        target: "careline::store::live",
                        "Listener lagged by {} changes, resynchronising",
                        skipped
                    );
                    lagged = true;
                }
                Err(RecvError::Closed) => return None,
            }

            loop {
                match state.receiver.try_recv() {
                    Ok(FeedEvent::Change(change)) => {
                        if state.query.matches(&change.message) {
                            changes.push(change);
                        }
                    }
                    Ok(FeedEvent::Interrupted(reason)) => {
                        state.pending_interruption = Some(reason);
                        break;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Lagged(_)) => lagged = true,
                    Err(TryRecvError::Closed) => break,
                }
            }

            if lagged {
                let mut unbounded = state.query.clone();
                unbounded.limit = None;
                match (state.resnapshot)(unbounded).await {
                    Ok(messages) => {
                        changes.extend(messages.into_iter().map(MessageChange::added));
                    }
                    Err(e) => return Some((Err(e), state)),
                }
            }

            if !changes.is_empty() {
                return Some((Ok(ChangeBatch::live(changes)), state));
            }
        }
    })
    .boxed()
}
