//! Secure messaging core for a role-based healthcare portal.
//!
//! Patients, doctors, nurses and admins exchange two-party messages. The
//! crate enforces who may message whom, merges each user's sent and received
//! live streams into ordered conversation views, tracks read state and
//! summarises a user's conversations.

use std::path::Path;
use std::sync::Mutex;

use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt::Layer, prelude::*, registry::Registry};

pub mod database;
pub mod directory;
pub mod error;
pub mod messaging;
pub mod store;
pub mod types;

pub use crate::directory::{
    DirectoryError, InMemoryUserDirectory, NoPresence, PresenceTracker, SqliteUserDirectory,
    StaticPresence, UserDirectory,
};
pub use crate::error::{CarelineError, Result};
pub use crate::messaging::{
    BroadcastNotifier, ConversationListSubscription, ConversationSubscription, MessagingConfig,
    MessagingService, NoopNotifier, NotificationDispatcher, PermissionMatrix, ReadTransition,
};
pub use crate::store::{
    CachedMessageStore, InMemoryMessageStore, MessageQuery, MessageStore, SortOrder,
    SqliteMessageStore, StoreError,
};
pub use crate::types::{
    Conversation, ConversationMessage, Direction, Message, MessageId, PendingMessage, Role, User,
    UserId, UserProfile,
};

static TRACING_GUARDS: OnceCell<Mutex<Option<(WorkerGuard, WorkerGuard)>>> = OnceCell::new();
static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Installs the global tracing subscriber: stdout plus a daily-rolling file
/// in `logs_dir`. Filtering follows `RUST_LOG`, defaulting to `info`.
///
/// Only the first call has any effect.
pub fn init_tracing(logs_dir: &Path) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix("careline")
            .filename_suffix("log")
            .build(logs_dir)
            .map_err(|e| {
                CarelineError::Configuration(format!("Failed to create file appender: {e}"))
            })?;

        let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
        let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

        TRACING_GUARDS
            .set(Mutex::new(Some((file_guard, stdout_guard))))
            .ok();

        let stdout_layer = Layer::new()
            .with_writer(non_blocking_stdout)
            .with_ansi(true)
            .with_target(true);

        let file_layer = Layer::new()
            .with_writer(non_blocking_file)
            .with_ansi(false)
            .with_target(true);

        // Another subscriber may already be installed by an embedding app
        let _ = Registry::default()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(stdout_layer)
            .with(file_layer)
            .try_init();
        Ok(())
    })?;
    Ok(())
}
