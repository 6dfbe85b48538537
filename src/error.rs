use thiserror::Error;

use crate::database::DatabaseError;
use crate::directory::DirectoryError;
use crate::store::StoreError;
use crate::types::{MessageId, Role, UserId};

pub type Result<T> = core::result::Result<T, CarelineError>;

#[derive(Error, Debug)]
pub enum CarelineError {
    #[error("Permission denied: {sender_role} may not message {receiver_role}")]
    PermissionDenied {
        sender_role: Role,
        receiver_role: Role,
    },

    #[error("User not found: {0}")]
    UserNotFound(UserId),

    #[error("Message store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("Invalid message content: {0}")]
    InvalidContent(String),

    #[error("Sender and receiver must be different users")]
    InvalidRecipient,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl CarelineError {
    /// Only transient store failures are worth retrying; permission and
    /// existence errors will fail again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CarelineError::StoreUnavailable(_))
    }
}

impl From<StoreError> for CarelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => CarelineError::StoreUnavailable(reason),
            StoreError::Closed => CarelineError::StoreUnavailable("change stream closed".into()),
            StoreError::NotFound(id) => CarelineError::MessageNotFound(id),
            StoreError::Database(e) => CarelineError::Database(e),
        }
    }
}

impl From<DirectoryError> for CarelineError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::NotFound(id) => CarelineError::UserNotFound(id),
            DirectoryError::Unavailable(reason) => CarelineError::StoreUnavailable(reason),
            DirectoryError::Database(e) => CarelineError::Database(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_unavailable_maps_to_retryable_error() {
        let err: CarelineError = StoreError::Unavailable("partition".to_string()).into();
        assert!(matches!(err, CarelineError::StoreUnavailable(ref r) if r == "partition"));
        assert!(err.is_retryable());
    }

    #[test]
    fn directory_not_found_maps_to_user_not_found() {
        let err: CarelineError = DirectoryError::NotFound(UserId::new("ghost")).into();
        assert!(matches!(err, CarelineError::UserNotFound(ref id) if id.as_str() == "ghost"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn permission_denied_is_not_retryable() {
        let err = CarelineError::PermissionDenied {
            sender_role: Role::Patient,
            receiver_role: Role::Admin,
        };
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Permission denied: patient may not message admin"
        );
    }
}
