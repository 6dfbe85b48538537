use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Display name used when a counterparty cannot be resolved in the directory.
pub const UNKNOWN_USER_DISPLAY_NAME: &str = "Unknown User";

/// Identifier of a portal user.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Store-assigned message identifier.
///
/// Ordering is plain string ordering; it is the tie-break whenever two
/// messages share a `created_at`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random identifier (UUID v4).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Portal role of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Patient,
    Doctor,
    Nurse,
    Admin,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Patient, Role::Doctor, Role::Nurse, Role::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Doctor => "doctor",
            Role::Nurse => "nurse",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "patient" => Ok(Role::Patient),
            "doctor" => Ok(Role::Doctor),
            "nurse" => Ok(Role::Nurse),
            "admin" => Ok(Role::Admin),
            _ => Err(UnknownRole(s.to_string())),
        }
    }
}

/// A portal user as seen by the messaging core (read-only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub role: Role,
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

impl User {
    pub fn new(id: impl Into<UserId>, role: Role, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            display_name: display_name.into(),
            avatar_ref: None,
        }
    }

    pub fn with_avatar(mut self, avatar_ref: impl Into<String>) -> Self {
        self.avatar_ref = Some(avatar_ref.into());
        self
    }
}

/// Profile shown for a conversation counterparty.
///
/// `role` is `None` only for the placeholder produced when a lookup fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub display_name: String,
    pub role: Option<Role>,
    pub avatar_ref: Option<String>,
}

impl UserProfile {
    pub fn unknown(id: UserId) -> Self {
        Self {
            id,
            display_name: UNKNOWN_USER_DISPLAY_NAME.to_string(),
            role: None,
            avatar_ref: None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.role.is_none()
    }
}

impl From<User> for UserProfile {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            display_name: user.display_name,
            role: Some(user.role),
            avatar_ref: user.avatar_ref,
        }
    }
}

/// A persisted message. Only `read` ever changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    /// Assigned by the store; the only authoritative ordering key.
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

impl Message {
    /// Total chronological order: `created_at`, then `id`.
    pub fn chronological_cmp(&self, other: &Message) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }

    /// The other participant relative to `viewer`, if `viewer` takes part.
    pub fn counterparty(&self, viewer: &UserId) -> Option<&UserId> {
        if &self.sender_id == viewer {
            Some(&self.receiver_id)
        } else if &self.receiver_id == viewer {
            Some(&self.sender_id)
        } else {
            None
        }
    }

    pub fn direction_for(&self, viewer: &UserId) -> Option<Direction> {
        if &self.sender_id == viewer {
            Some(Direction::Sent)
        } else if &self.receiver_id == viewer {
            Some(Direction::Received)
        } else {
            None
        }
    }

    pub fn timestamp(&self) -> MessageTimestamp {
        MessageTimestamp::Confirmed(self.created_at)
    }
}

/// Fields a caller supplies when appending; the store fills in the rest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
}

/// Either a client-side guess or the store's authoritative time.
///
/// A provisional value is never compared with or blended into a confirmed
/// one; confirming replaces it outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "at", rename_all = "snake_case")]
pub enum MessageTimestamp {
    Provisional(DateTime<Utc>),
    Confirmed(DateTime<Utc>),
}

impl MessageTimestamp {
    pub fn instant(&self) -> DateTime<Utc> {
        match self {
            MessageTimestamp::Provisional(at) | MessageTimestamp::Confirmed(at) => *at,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, MessageTimestamp::Confirmed(_))
    }
}

/// An outgoing message that has not been acknowledged by the store yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMessage {
    pub local_id: Uuid,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub timestamp: MessageTimestamp,
}

impl PendingMessage {
    pub fn new(sender_id: UserId, receiver_id: UserId, content: impl Into<String>) -> Self {
        Self {
            local_id: Uuid::new_v4(),
            sender_id,
            receiver_id,
            content: content.into(),
            timestamp: MessageTimestamp::Provisional(Utc::now()),
        }
    }

    pub fn to_new_message(&self) -> NewMessage {
        NewMessage {
            sender_id: self.sender_id.clone(),
            receiver_id: self.receiver_id.clone(),
            content: self.content.clone(),
        }
    }

    /// Swaps the pending value for the persisted record.
    ///
    /// Nothing from the pending value survives, in particular its provisional
    /// timestamp.
    pub fn confirm(self, persisted: Message) -> Message {
        debug_assert_eq!(self.sender_id, persisted.sender_id);
        debug_assert_eq!(self.receiver_id, persisted.receiver_id);
        persisted
    }
}

/// Which of the viewer's two source streams a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One change delivered by a live query, always carrying the full record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageChange {
    pub kind: ChangeKind,
    pub message: Message,
}

impl MessageChange {
    pub fn added(message: Message) -> Self {
        Self {
            kind: ChangeKind::Added,
            message,
        }
    }

    pub fn modified(message: Message) -> Self {
        Self {
            kind: ChangeKind::Modified,
            message,
        }
    }

    pub fn removed(message: Message) -> Self {
        Self {
            kind: ChangeKind::Removed,
            message,
        }
    }
}

/// A batch of changes from one live query.
///
/// The first batch of every stream has `initial` set and lists the complete
/// result set as `Added` changes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub changes: Vec<MessageChange>,
    pub initial: bool,
}

impl ChangeBatch {
    pub fn initial(messages: Vec<Message>) -> Self {
        Self {
            changes: messages.into_iter().map(MessageChange::added).collect(),
            initial: true,
        }
    }

    pub fn live(changes: Vec<MessageChange>) -> Self {
        Self {
            changes,
            initial: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// An entry in a merged conversation view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub message: Message,
    pub direction: Direction,
}

/// One row of a user's conversation list. Derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub counterparty_id: UserId,
    pub counterparty: UserProfile,
    pub last_message: Message,
    pub unread_count: usize,
    pub online: bool,
}

/// Current time truncated to the millisecond resolution stores keep.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}
