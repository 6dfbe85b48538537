use async_trait::async_trait;
use dashmap::DashMap;

use super::{DirectoryError, UserDirectory};
use crate::types::{User, UserId};

#[derive(Debug, Default)]
pub struct InMemoryUserDirectory {
    users: DashMap<UserId, User>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users<I>(users: I) -> Self
    where
        I: IntoIterator<Item = User>,
    {
        let directory = Self::new();
        for user in users {
            directory.insert(user);
        }
        directory
    }

    pub fn insert(&self, user: User) {
        self.users.insert(user.id.clone(), user);
    }

    pub fn remove(&self, id: &UserId) -> Option<User> {
        self.users.remove(id).map(|(_, user)| user)
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn get_user(&self, id: &UserId) -> Result<User, DirectoryError> {
        self.users
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DirectoryError::NotFound(id.clone()))
    }

    async fn list_users(&self) -> Result<Vec<User>, DirectoryError> {
        Ok(self
            .users
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[tokio::test]
    async fn insert_get_and_remove() {
        let directory = InMemoryUserDirectory::with_users([
            User::new("p1", Role::Patient, "Pat"),
            User::new("n1", Role::Nurse, "Nora"),
        ]);

        assert_eq!(directory.list_users().await.unwrap().len(), 2);
        assert_eq!(
            directory.get_user(&UserId::new("p1")).await.unwrap().role,
            Role::Patient
        );

        directory.remove(&UserId::new("p1"));
        assert!(matches!(
            directory.get_user(&UserId::new("p1")).await,
            Err(DirectoryError::NotFound(_))
        ));
    }
}
