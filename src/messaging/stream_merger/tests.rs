use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::DateTime;
use tokio::time::timeout;

use super::*;
use crate::store::InMemoryMessageStore;
use crate::types::{Message, MessageChange, NewMessage};

fn message(id: &str, from: &str, to: &str, millis: i64) -> Message {
    Message {
        id: MessageId::new(id),
        sender_id: UserId::new(from),
        receiver_id: UserId::new(to),
        content: format!("{id} from {from}"),
        created_at: DateTime::from_timestamp_millis(millis).unwrap(),
        read: false,
    }
}

fn read(mut message: Message) -> Message {
    message.read = true;
    message
}

fn ids(view: &[ConversationMessage]) -> Vec<&str> {
    view.iter().map(|entry| entry.message.id.as_str()).collect()
}

fn merger() -> StreamMerger {
    StreamMerger::new(UserId::new("alice"), UserId::new("bob"))
}

fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut all = Vec::new();
    for i in 0..items.len() {
        let mut rest = items.to_vec();
        let head = rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, head.clone());
            all.push(tail);
        }
    }
    all
}

#[test]
fn merges_both_directions_in_chronological_order() {
    let mut merger = merger();
    merger.apply_batch(
        Direction::Sent,
        &ChangeBatch::initial(vec![
            message("a1", "alice", "bob", 10),
            message("a2", "alice", "bob", 30),
        ]),
    );
    merger.apply_batch(
        Direction::Received,
        &ChangeBatch::initial(vec![message("b1", "bob", "alice", 20)]),
    );

    let view = merger.snapshot();
    assert_eq!(ids(&view), vec!["a1", "b1", "a2"]);
    assert_eq!(view[0].direction, Direction::Sent);
    assert_eq!(view[1].direction, Direction::Received);
}

#[test]
fn identical_timestamps_order_by_id() {
    let mut merger = merger();
    let later_id = message("m-b", "bob", "alice", 1_000);
    let earlier_id = message("m-a", "alice", "bob", 1_000);

    merger.apply_batch(Direction::Received, &ChangeBatch::initial(vec![later_id.clone()]));
    merger.apply_batch(Direction::Sent, &ChangeBatch::initial(vec![earlier_id.clone()]));
    let first = ids(&merger.snapshot()).join(",");

    for _ in 0..5 {
        merger.apply_batch(
            Direction::Received,
            &ChangeBatch::live(vec![MessageChange::modified(later_id.clone())]),
        );
        merger.apply_batch(
            Direction::Sent,
            &ChangeBatch::live(vec![MessageChange::added(earlier_id.clone())]),
        );
        assert_eq!(ids(&merger.snapshot()).join(","), first);
    }
    assert_eq!(first, "m-a,m-b");
}

#[test]
fn final_view_is_independent_of_arrival_order() {
    let a1 = message("a1", "alice", "bob", 10);
    let b1 = message("b1", "bob", "alice", 10);
    let b2 = message("b2", "bob", "alice", 20);
    let a2 = message("a2", "alice", "bob", 30);

    let events: Vec<(Direction, MessageChange)> = vec![
        (Direction::Sent, MessageChange::added(a1.clone())),
        (Direction::Received, MessageChange::added(b1.clone())),
        (Direction::Received, MessageChange::modified(read(b1.clone()))),
        (Direction::Received, MessageChange::added(b2.clone())),
        (Direction::Sent, MessageChange::removed(a2.clone())),
        (Direction::Sent, MessageChange::added(a2.clone())),
    ];

    let mut expected: Option<Vec<ConversationMessage>> = None;
    for order in permutations(&events) {
        let mut merger = merger();
        for (direction, change) in order {
            merger.apply_batch(direction, &ChangeBatch::live(vec![change]));
        }
        let view = merger.snapshot();
        match &expected {
            None => expected = Some(view),
            Some(expected) => assert_eq!(&view, expected),
        }
    }

    let expected = expected.unwrap();
    assert_eq!(ids(&expected), vec!["a1", "b1", "b2"]);
    assert!(expected[1].message.read);
    assert!(!expected[2].message.read);
}

#[test]
fn replayed_batches_are_idempotent() {
    let mut merger = merger();
    let batch = ChangeBatch::initial(vec![
        message("b1", "bob", "alice", 10),
        message("b2", "bob", "alice", 20),
    ]);

    merger.apply_batch(Direction::Received, &batch);
    let once = merger.snapshot();
    merger.apply_batch(Direction::Received, &batch);

    assert_eq!(merger.snapshot(), once);
    assert_eq!(merger.len(), 2);
}

#[test]
fn stale_unread_version_does_not_undo_read() {
    let mut merger = merger();
    let unread = message("b1", "bob", "alice", 10);

    merger.apply_batch(
        Direction::Received,
        &ChangeBatch::live(vec![MessageChange::modified(read(unread.clone()))]),
    );
    let pending = merger.apply_batch(
        Direction::Received,
        &ChangeBatch::live(vec![MessageChange::added(unread)]),
    );

    assert!(pending.is_empty());
    assert!(merger.snapshot()[0].message.read);
}

#[test]
fn reports_unread_received_messages_only() {
    let mut merger = merger();
    let pending = merger.apply_batch(
        Direction::Received,
        &ChangeBatch::initial(vec![
            message("b1", "bob", "alice", 10),
            read(message("b2", "bob", "alice", 20)),
        ]),
    );
    let sent = merger.apply_batch(
        Direction::Sent,
        &ChangeBatch::initial(vec![message("a1", "alice", "bob", 5)]),
    );

    assert_eq!(pending, vec![MessageId::new("b1")]);
    assert!(sent.is_empty());
}

#[test]
fn ignores_messages_outside_the_pair() {
    let mut merger = merger();
    merger.apply_batch(
        Direction::Received,
        &ChangeBatch::initial(vec![
            message("c1", "carol", "alice", 10),
            message("a1", "alice", "bob", 20),
        ]),
    );

    assert!(merger.is_empty());
}

fn draft(from: &str, to: &str, content: &str) -> NewMessage {
    NewMessage {
        sender_id: UserId::new(from),
        receiver_id: UserId::new(to),
        content: content.to_string(),
    }
}

#[tokio::test]
async fn subscription_emits_complete_first_view_then_updates() {
    let store = Arc::new(InMemoryMessageStore::new());
    store.append(draft("alice", "bob", "hi bob")).await.unwrap();
    store.append(draft("bob", "alice", "hi alice")).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = subscribe(
        store.clone(),
        None,
        UserId::new("alice"),
        UserId::new("bob"),
        move |view| {
            let _ = tx.send(view);
        },
    )
    .await
    .unwrap();

    let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.len(), 2);

    store.append(draft("bob", "alice", "again")).await.unwrap();
    let second = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(second.len(), 3);
    assert_eq!(second[2].message.content, "again");

    subscription.unsubscribe();
}

#[tokio::test]
async fn subscription_marks_received_messages_read() {
    let store = Arc::new(InMemoryMessageStore::new());
    let incoming = store.append(draft("bob", "alice", "ping")).await.unwrap();
    let tracker = ReadStateTracker::new(store.clone());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = subscribe(
        store.clone(),
        Some(tracker),
        UserId::new("alice"),
        UserId::new("bob"),
        move |view| {
            let _ = tx.send(view);
        },
    )
    .await
    .unwrap();

    // The mark may land before or after the first emission
    loop {
        let view = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(view.len(), 1);
        if view[0].message.read {
            break;
        }
    }
    assert!(store.get(&incoming.id).await.unwrap().unwrap().read);
}

#[tokio::test]
async fn no_callbacks_after_unsubscribe() {
    let store = Arc::new(InMemoryMessageStore::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let subscription = subscribe(
        store.clone(),
        None,
        UserId::new("alice"),
        UserId::new("bob"),
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    subscription.unsubscribe();
    let before = calls.load(Ordering::SeqCst);

    store.append(draft("bob", "alice", "too late")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(calls.load(Ordering::SeqCst), before);
    assert_eq!(store.listener_count(), 0);
}

#[tokio::test]
async fn keeps_last_view_when_a_stream_fails() {
    let store = Arc::new(InMemoryMessageStore::new());
    store.append(draft("bob", "alice", "before")).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = subscribe(
        store.clone(),
        None,
        UserId::new("alice"),
        UserId::new("bob"),
        move |view| {
            let _ = tx.send(view);
        },
    )
    .await
    .unwrap();
    let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.len(), 1);

    store.set_available(false);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(subscription.is_active());

    store.set_available(true);
    store.append(draft("bob", "alice", "after")).await.unwrap();
    let next = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(next.len(), 2);
}

#[tokio::test]
async fn fails_when_no_stream_can_be_opened() {
    let store = Arc::new(InMemoryMessageStore::new());
    store.set_available(false);

    let result = subscribe(
        store.clone(),
        None,
        UserId::new("alice"),
        UserId::new("bob"),
        |_| {},
    )
    .await;

    assert!(matches!(result, Err(StoreError::Unavailable(_))));
}
