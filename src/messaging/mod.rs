//! Secure messaging core.
//!
//! [`MessagingService`] is the entry point. It composes the permission
//! matrix, the stream merger, the conversation aggregator and read-state
//! tracking over a [`MessageStore`] and a [`UserDirectory`].

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use crate::database::Database;
use crate::directory::{NoPresence, PresenceTracker, SqliteUserDirectory, UserDirectory};
use crate::error::{CarelineError, Result};
use crate::store::{
    CachedMessageStore, DEFAULT_LISTEN_BUFFER, MessageStore, SqliteMessageStore,
};
use crate::types::{
    ChangeBatch, Conversation, ConversationMessage, Direction, Message, MessageId, PendingMessage,
    User, UserId,
};

pub mod conversations;
pub mod notifications;
pub mod permissions;
pub mod read_state;
pub mod stream_merger;
pub mod subscription;


pub use conversations::ConversationAggregator;
pub use notifications::{
    BroadcastNotifier, MessageSentEvent, NoopNotifier, NotificationDispatcher, NotificationError,
};
pub use permissions::PermissionMatrix;
pub use read_state::{ReadStateTracker, ReadTransition};
pub use stream_merger::StreamMerger;
pub use subscription::{ConversationListSubscription, ConversationSubscription, Subscription};

/// Default upper bound on message length, in characters.
pub const DEFAULT_MAX_CONTENT_LEN: usize = 4000;

const DATABASE_FILE_NAME: &str = "careline.sqlite";

#[derive(Clone, Debug)]
pub struct MessagingConfig {
    /// Directory for application data
    pub data_dir: PathBuf,

    /// Directory for application logs
    pub logs_dir: PathBuf,

    /// Mark received messages read as soon as they enter a conversation view
    pub auto_mark_read: bool,

    pub max_content_len: usize,

    /// Capacity of the store's live-change broadcast
    pub listen_buffer: usize,
}

impl MessagingConfig {
    pub fn new(data_dir: &Path, logs_dir: &Path) -> Self {
        let env_suffix = if cfg!(debug_assertions) {
            "dev"
        } else {
            "release"
        };

        Self {
            data_dir: data_dir.join(env_suffix),
            logs_dir: logs_dir.join(env_suffix),
            auto_mark_read: true,
            max_content_len: DEFAULT_MAX_CONTENT_LEN,
            listen_buffer: DEFAULT_LISTEN_BUFFER,
        }
    }

    /// Reads `CARELINE_DATA_DIR` (required), `CARELINE_LOGS_DIR`,
    /// `CARELINE_AUTO_MARK_READ` and `CARELINE_MAX_CONTENT_LEN`.
    pub fn from_env() -> Result<Self> {
        let data_dir = env::var("CARELINE_DATA_DIR")
            .map(PathBuf::from)
            .map_err(|_| CarelineError::Configuration("CARELINE_DATA_DIR is not set".into()))?;
        let logs_dir = env::var("CARELINE_LOGS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("logs"));

        let mut config = Self::new(&data_dir, &logs_dir);
        if let Ok(value) = env::var("CARELINE_AUTO_MARK_READ") {
            config.auto_mark_read = parse_flag("CARELINE_AUTO_MARK_READ", &value)?;
        }
        if let Ok(value) = env::var("CARELINE_MAX_CONTENT_LEN") {
            config.max_content_len = value.trim().parse().map_err(|_| {
                CarelineError::Configuration(format!(
                    "CARELINE_MAX_CONTENT_LEN must be a positive integer, got {value:?}"
                ))
            })?;
        }
        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE_NAME)
    }
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            logs_dir: PathBuf::from("logs"),
            auto_mark_read: true,
            max_content_len: DEFAULT_MAX_CONTENT_LEN,
            listen_buffer: DEFAULT_LISTEN_BUFFER,
        }
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(CarelineError::Configuration(format!(
            "{name} must be a boolean, got {value:?}"
        ))),
    }
}

pub struct MessagingService {
    config: MessagingConfig,
    store: Arc<dyn MessageStore>,
    directory: Arc<dyn UserDirectory>,
    notifier: Arc<dyn NotificationDispatcher>,
    permissions: PermissionMatrix,
    read_state: ReadStateTracker,
    aggregator: ConversationAggregator,
}

impl MessagingService {
    /// Composes a service from arbitrary collaborators, with no presence
    /// tracking, no notifications and the standard permission table.
    pub fn new(
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn UserDirectory>,
        config: MessagingConfig,
    ) -> Self {
        Self {
            read_state: ReadStateTracker::new(Arc::clone(&store)),
            aggregator: ConversationAggregator::new(
                Arc::clone(&store),
                Arc::clone(&directory),
                Arc::new(NoPresence),
            ),
            config,
            store,
            directory,
            notifier: Arc::new(NoopNotifier),
            permissions: PermissionMatrix::standard(),
        }
    }

    pub fn with_presence(mut self, presence: Arc<dyn PresenceTracker>) -> Self {
        self.aggregator =
            ConversationAggregator::new(Arc::clone(&self.store), Arc::clone(&self.directory), presence);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationDispatcher>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_permissions(mut self, permissions: PermissionMatrix) -> Self {
        self.permissions = permissions;
        self
    }

    /// Opens the SQLite-backed service described by `config`.
    ///
    /// Creates the data and log directories, installs tracing, runs
    /// migrations and wraps the message store in the read-through cache.
    ///
    /// # Errors
    ///
    /// Fails if a directory cannot be created, the log appender cannot be
    /// built or the database cannot be opened or migrated.
    pub async fn initialize(config: MessagingConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("Failed to create data directory: {:?}", config.data_dir)
        })?;
        std::fs::create_dir_all(&config.logs_dir).with_context(|| {
            format!("Failed to create logs directory: {:?}", config.logs_dir)
        })?;

        crate::init_tracing(&config.logs_dir)?;

        tracing::debug!(
            target: "careline::messaging::initialize",
            "Opening database at {:?}",
            config.database_path()
        );
        let database = Arc::new(Database::new(config.database_path()).await?);

        let store: Arc<dyn MessageStore> = Arc::new(CachedMessageStore::new(
            SqliteMessageStore::with_capacity(Arc::clone(&database), config.listen_buffer),
        ));
        let directory: Arc<dyn UserDirectory> = Arc::new(SqliteUserDirectory::new(database));

        tracing::info!(
            target: "careline::messaging::initialize",
            "Messaging service ready (data dir {:?})",
            config.data_dir
        );
        Ok(Self::new(store, directory, config))
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    pub fn permissions(&self) -> &PermissionMatrix {
        &self.permissions
    }

    /// Sends `content` from `sender_id` to `receiver_id`.
    ///
    /// Both users are resolved first, then the permission matrix is
    /// consulted, then the content is validated. Nothing is written unless
    /// all three pass.
    pub async fn send_message(
        &self,
        sender_id: &UserId,
        receiver_id: &UserId,
        content: &str,
    ) -> Result<Message> {
        let pending = PendingMessage::new(sender_id.clone(), receiver_id.clone(), content);
        self.send_pending(pending).await
    }

    /// Persists a draft created on the client. The returned message replaces
    /// the draft, including its provisional timestamp.
    pub async fn send_pending(&self, pending: PendingMessage) -> Result<Message> {
        let sender = self.directory.get_user(&pending.sender_id).await?;
        let receiver = self.directory.get_user(&pending.receiver_id).await?;

        if !self.permissions.can_message(sender.role, receiver.role) {
            tracing::warn!(
                target: "careline::messaging::send",
                "Rejected message from {} ({}) to {} ({})",
                sender.id,
                sender.role,
                receiver.id,
                receiver.role
            );
            return Err(CarelineError::PermissionDenied {
                sender_role: sender.role,
                receiver_role: receiver.role,
            });
        }
        if sender.id == receiver.id {
            return Err(CarelineError::InvalidRecipient);
        }
        self.validate_content(&pending.content)?;

        let persisted = self.store.append(pending.to_new_message()).await?;
        tracing::debug!(
            target: "careline::messaging::send",
            "Sent message {} from {} to {}",
            persisted.id,
            persisted.sender_id,
            persisted.receiver_id
        );

        self.dispatch_notification(&sender, &persisted);
        Ok(pending.confirm(persisted))
    }

    fn validate_content(&self, content: &str) -> Result<()> {
        if content.trim().is_empty() {
            return Err(CarelineError::InvalidContent(
                "message content is empty".to_string(),
            ));
        }
        let length = content.chars().count();
        if length > self.config.max_content_len {
            return Err(CarelineError::InvalidContent(format!(
                "message is {length} characters, the limit is {}",
                self.config.max_content_len
            )));
        }
        Ok(())
    }

    fn dispatch_notification(&self, sender: &User, message: &Message) {
        let notifier = Arc::clone(&self.notifier);
        let event = MessageSentEvent {
            message: message.clone(),
            sender_display_name: sender.display_name.clone(),
            sender_role: sender.role,
        };
        tokio::spawn(async move {
            let message_id = event.message.id.clone();
            if let Err(e) = notifier.message_sent(event).await {
                tracing::warn!(
                    target: "careline::messaging::notifications",
                    "Notification for message {} failed: {}",
                    message_id,
                    e
                );
            }
        });
    }

    /// One-shot merged view of the conversation between `viewer` and `partner`.
    pub async fn get_messages(
        &self,
        viewer: &UserId,
        partner: &UserId,
    ) -> Result<Vec<ConversationMessage>> {
        let mut merger = StreamMerger::new(viewer.clone(), partner.clone());
        let sent_query = merger.query_for(Direction::Sent);
        let received_query = merger.query_for(Direction::Received);
        let (sent, received) = tokio::try_join!(
            self.store.query(&sent_query),
            self.store.query(&received_query),
        )?;

        merger.apply_batch(Direction::Sent, &ChangeBatch::initial(sent));
        merger.apply_batch(Direction::Received, &ChangeBatch::initial(received));
        Ok(merger.snapshot())
    }

    /// Live merged view of one conversation. Each call owns its own merger.
    pub async fn subscribe_conversation<F>(
        &self,
        viewer: &UserId,
        partner: &UserId,
        on_update: F,
    ) -> Result<ConversationSubscription>
    where
        F: FnMut(Vec<ConversationMessage>) + Send + 'static,
    {
        let read_state = self
            .config
            .auto_mark_read
            .then(|| self.read_state.clone());

        let subscription = stream_merger::subscribe(
            Arc::clone(&self.store),
            read_state,
            viewer.clone(),
            partner.clone(),
            on_update,
        )
        .await?;

        tracing::debug!(
            target: "careline::messaging::subscribe",
            "Subscribed to conversation {} <-> {}",
            viewer,
            partner
        );
        Ok(subscription)
    }

    pub async fn list_conversations(&self, user_id: &UserId) -> Result<Vec<Conversation>> {
        self.aggregator.list(user_id).await
    }

    /// Alias of [`MessagingService::list_conversations`].
    pub async fn get_conversations(&self, user_id: &UserId) -> Result<Vec<Conversation>> {
        self.list_conversations(user_id).await
    }

    pub async fn subscribe_conversations<F>(
        &self,
        user_id: &UserId,
        on_update: F,
    ) -> Result<ConversationListSubscription>
    where
        F: FnMut(Vec<Conversation>) + Send + 'static,
    {
        self.aggregator.subscribe(user_id, on_update).await
    }

    pub async fn mark_as_read(&self, message_id: &MessageId) -> Result<ReadTransition> {
        self.read_state.mark_as_read(message_id).await
    }

    /// Marks every message `partner` sent to `viewer` as read.
    pub async fn mark_conversation_read(&self, viewer: &UserId, partner: &UserId) -> Result<usize> {
        self.read_state.mark_conversation_read(viewer, partner).await
    }

    /// Users `sender_id` may start a conversation with, filtered by display
    /// name (case-insensitive substring, empty matches everyone).
    pub async fn search_recipients(&self, sender_id: &UserId, query: &str) -> Result<Vec<User>> {
        let sender = self.directory.get_user(sender_id).await?;
        let needle = query.trim().to_lowercase();

        let mut recipients: Vec<User> = self
            .directory
            .list_users()
            .await?
            .into_iter()
            .filter(|user| user.id != sender.id)
            .filter(|user| self.permissions.can_message(sender.role, user.role))
            .filter(|user| needle.is_empty() || user.display_name.to_lowercase().contains(&needle))
            .collect();

        recipients.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(recipients)
    }
}
