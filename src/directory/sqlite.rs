use std::sync::Arc;

use async_trait::async_trait;

use super::{DirectoryError, UserDirectory};
use crate::database::{Database, utils::create_column_decode_error};
use crate::types::{Role, User, UserId, now_millis};

#[derive(Debug)]
pub(crate) struct UserRow {
    pub id: String,
    pub role: Role,
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

impl<'r, R> sqlx::FromRow<'r, R> for UserRow
where
    R: sqlx::Row,
    &'r str: sqlx::ColumnIndex<R>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    Option<String>: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    fn from_row(row: &'r R) -> std::result::Result<Self, sqlx::Error> {
        let role_str: String = row.try_get("role")?;
        let role = role_str
            .parse::<Role>()
            .map_err(|e| create_column_decode_error("role", &e.to_string()))?;

        Ok(UserRow {
            id: row.try_get("id")?,
            role,
            display_name: row.try_get("display_name")?,
            avatar_ref: row.try_get("avatar_ref")?,
        })
    }
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: UserId::new(row.id),
            role: row.role,
            display_name: row.display_name,
            avatar_ref: row.avatar_ref,
        }
    }
}

/// Directory backed by the `users` table.
#[derive(Debug, Clone)]
pub struct SqliteUserDirectory {
    database: Arc<Database>,
}

impl SqliteUserDirectory {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }

    /// Inserts or replaces a user. Provisioning only; the messaging core
    /// itself never writes users.
    pub async fn upsert_user(&self, user: &User) -> Result<(), DirectoryError> {
        sqlx::query(
            "INSERT INTO users (id, role, display_name, avatar_ref, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                role = excluded.role,
                display_name = excluded.display_name,
                avatar_ref = excluded.avatar_ref",
        )
        .bind(user.id.as_str())
        .bind(user.role.as_str())
        .bind(user.display_name.as_str())
        .bind(user.avatar_ref.as_deref())
        .bind(now_millis().timestamp_millis())
        .execute(&self.database.pool)
        .await?;

        tracing::debug!(
            target: "careline::directory::sqlite",
            "Upserted user {} ({})",
            user.id,
            user.role
        );
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for SqliteUserDirectory {
    async fn get_user(&self, id: &UserId) -> Result<User, DirectoryError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, role, display_name, avatar_ref FROM users WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.database.pool)
        .await?;

        row.map(User::from)
            .ok_or_else(|| DirectoryError::NotFound(id.clone()))
    }

    async fn list_users(&self) -> Result<Vec<User>, DirectoryError> {
        let rows = sqlx::query_as::<_, UserRow>(
            "SELECT id, role, display_name, avatar_ref FROM users ORDER BY display_name, id",
        )
        .fetch_all(&self.database.pool)
        .await?;

        Ok(rows.into_iter().map(User::from).collect())
    }
}
