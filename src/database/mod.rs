use sqlx::{
    Sqlite, SqlitePool,
    migrate::{MigrateDatabase, Migrator},
    sqlite::SqlitePoolOptions,
};
use std::{
    path::PathBuf,
    sync::LazyLock,
    time::Duration,
};
use thiserror::Error;

pub(crate) mod utils;

pub static MIGRATOR: LazyLock<Migrator> = LazyLock::new(|| sqlx::migrate!("./db_migrations"));

const DB_ACQUIRE_TIMEOUT_SECS: u64 = 5;
const DB_MAX_CONNECTIONS: u32 = 10;
const DB_BUSY_TIMEOUT_MS: u32 = 5000;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),
    #[error("Invalid timestamp: {timestamp} cannot be converted to DateTime")]
    InvalidTimestamp { timestamp: i64 },
}

#[derive(Clone, Debug)]
pub struct Database {
    pub pool: SqlitePool,
    pub path: PathBuf,
}

impl Database {
    pub async fn new(db_path: PathBuf) -> Result<Self, DatabaseError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}", db_path.display());

        tracing::debug!(target: "careline::database", "Checking if DB exists...{:?}", db_url);
        match Sqlite::database_exists(&db_url).await {
            Ok(true) => {
                tracing::debug!(target: "careline::database", "DB exists");
            }
            Ok(false) => {
                tracing::debug!(target: "careline::database", "DB does not exist, creating...");
                Sqlite::create_database(&db_url).await.map_err(|e| {
                    tracing::error!(target: "careline::database", "Error creating DB: {:?}", e);
                    DatabaseError::Sqlx(e)
                })?;
            }
            Err(e) => {
                tracing::warn!(
                    target: "careline::database",
                    "Could not check if database exists: {:?}, attempting to create",
                    e
                );
                Sqlite::create_database(&db_url).await.map_err(|e| {
                    tracing::error!(target: "careline::database", "Error creating DB: {:?}", e);
                    DatabaseError::Sqlx(e)
                })?;
            }
        }

        let pool = Self::create_connection_pool(&db_url).await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self {
            pool,
            path: db_path,
        })
    }

    /// Creates and configures a SQLite connection pool
    async fn create_connection_pool(db_url: &str) -> Result<SqlitePool, DatabaseError> {
        let pool = SqlitePoolOptions::new()
            .acquire_timeout(Duration::from_secs(DB_ACQUIRE_TIMEOUT_SECS))
            .max_connections(DB_MAX_CONNECTIONS)
            .after_connect(|conn, _| {
                Box::pin(async move {
                    let conn = &mut *conn;
                    // WAL lets listeners read while a send is writing
                    sqlx::query("PRAGMA journal_mode=WAL")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query(&format!("PRAGMA busy_timeout={DB_BUSY_TIMEOUT_MS}"))
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA foreign_keys = ON")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&format!("{db_url}?mode=rwc"))
            .await?;
        Ok(pool)
    }

    /// Runs all pending database migrations. Safe to call repeatedly.
    pub async fn migrate_up(&self) -> Result<(), DatabaseError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::create_test_db;
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_database_creation_with_nested_path() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("nested").join("path").join("test.db");

        let db = Database::new(db_path.clone()).await;
        assert!(db.is_ok());

        let db = db.unwrap();
        assert_eq!(db.path, db_path);
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_database_migrations_applied() {
        let (db, _temp_dir) = create_test_db().await;

        for table in ["users", "messages"] {
            let result =
                sqlx::query("SELECT name FROM sqlite_master WHERE type='table' AND name = ?")
                    .bind(table)
                    .fetch_optional(&db.pool)
                    .await
                    .unwrap();
            assert!(result.is_some(), "missing table {table}");
        }
    }

    #[tokio::test]
    async fn test_migrate_up_is_idempotent() {
        let (db, _temp_dir) = create_test_db().await;
        assert!(db.migrate_up().await.is_ok());
        assert!(db.migrate_up().await.is_ok());
    }

    #[tokio::test]
    async fn test_database_pragma_settings() {
        let (db, _temp_dir) = create_test_db().await;

        let foreign_keys: (i64,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&db.pool)
            .await
            .expect("Failed to check foreign_keys pragma");
        assert_eq!(foreign_keys.0, 1);

        let journal_mode: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&db.pool)
            .await
            .expect("Failed to check journal_mode pragma");
        assert_eq!(journal_mode.0.to_lowercase(), "wal");
    }
}
