use chrono::{DateTime, Utc};
use sqlx::Row;

use super::DatabaseError;

/// Parses a millisecond timestamp column.
///
/// Falls back to RFC3339 text so rows written by external tooling still load.
pub(crate) fn parse_timestamp<'r, R>(
    row: &'r R,
    column_name: &'r str,
) -> Result<DateTime<Utc>, sqlx::Error>
where
    R: Row,
    &'r str: sqlx::ColumnIndex<R>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    if let Ok(timestamp_ms) = row.try_get::<i64, _>(column_name) {
        return DateTime::from_timestamp_millis(timestamp_ms).ok_or_else(|| {
            sqlx::Error::ColumnDecode {
                index: column_name.to_string(),
                source: Box::new(DatabaseError::InvalidTimestamp {
                    timestamp: timestamp_ms,
                }),
            }
        });
    }

    if let Ok(datetime_str) = row.try_get::<String, _>(column_name) {
        return DateTime::parse_from_rfc3339(&datetime_str)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: column_name.to_string(),
                source: Box::new(e),
            });
    }

    Err(create_column_decode_error(
        column_name,
        "Could not parse as INTEGER or RFC3339 TEXT",
    ))
}

pub(crate) fn create_column_decode_error(column_name: &str, message: &str) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column_name.to_string(),
        source: Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message.to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};

    async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        sqlx::query(
            "CREATE TABLE test_timestamps (
                id INTEGER PRIMARY KEY,
                int_timestamp INTEGER,
                text_timestamp TEXT
            )",
        )
        .execute(&pool)
        .await
        .unwrap();

        pool
    }

    #[tokio::test]
    async fn test_parse_integer_timestamp() {
        let pool = setup_test_db().await;
        sqlx::query("INSERT INTO test_timestamps (id, int_timestamp) VALUES (1, ?)")
            .bind(1_700_000_000_123_i64)
            .execute(&pool)
            .await
            .unwrap();

        let row: SqliteRow = sqlx::query("SELECT * FROM test_timestamps WHERE id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();

        let parsed = parse_timestamp(&row, "int_timestamp").unwrap();
        assert_eq!(parsed.timestamp_millis(), 1_700_000_000_123);
    }

    #[tokio::test]
    async fn test_parse_rfc3339_text_timestamp() {
        let pool = setup_test_db().await;
        sqlx::query("INSERT INTO test_timestamps (id, text_timestamp) VALUES (1, ?)")
            .bind("2024-01-02T03:04:05Z")
            .execute(&pool)
            .await
            .unwrap();

        let row: SqliteRow = sqlx::query("SELECT * FROM test_timestamps WHERE id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();

        let parsed = parse_timestamp(&row, "text_timestamp").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-01-02T03:04:05+00:00");
    }

    #[tokio::test]
    async fn test_parse_garbage_text_fails() {
        let pool = setup_test_db().await;
        sqlx::query("INSERT INTO test_timestamps (id, text_timestamp) VALUES (1, 'yesterday')")
            .execute(&pool)
            .await
            .unwrap();

        let row: SqliteRow = sqlx::query("SELECT * FROM test_timestamps WHERE id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();

        assert!(parse_timestamp(&row, "text_timestamp").is_err());
    }
}
