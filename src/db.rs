//! SQLite connection management for the history store.
//!
//! WAL mode keeps concurrent readers off the writer's back, and a busy
//! timeout absorbs short lock contention before the store's own retry layer
//! kicks in.

use std::path::Path;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::instrument;

/// Maximum pooled connections. Low on purpose: SQLite locks per file.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// SQLite busy timeout in milliseconds.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connection(#[from] sqlx::Error),

    /// Failed to run migrations.
    #[error("failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Connection pool wrapper with WAL mode and embedded migrations.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if necessary) the database at `db_path`.
    ///
    /// Enables WAL journalling, sets the busy timeout, and runs pending
    /// migrations.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connection`] or [`DbError::Migration`].
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn open(db_path: &Path) -> Result<Self, DbError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;
        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Creates an in-memory database for tests.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connection`] or [`DbError::Migration`].
    #[instrument]
    pub async fn open_in_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Returns the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Gracefully closes all pooled connections.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory_runs_migrations() {
        let db = Database::open_in_memory().await.unwrap();
        let result = sqlx::query(
            "INSERT INTO history (url, status) VALUES ('https://example.com/a.mp4', 'completed')",
        )
        .execute(db.pool())
        .await;
        assert!(result.is_ok(), "history table should exist after migration");
    }

    #[tokio::test]
    async fn test_open_file_backed_enables_wal() {
        let temp = tempfile::tempdir().unwrap();
        let db = Database::open(&temp.path().join("history.db")).await.unwrap();

        let mode: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(mode.0.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_status_check_constraint() {
        let db = Database::open_in_memory().await.unwrap();
        let result = sqlx::query(
            "INSERT INTO history (url, status) VALUES ('https://example.com/a', 'bogus')",
        )
        .execute(db.pool())
        .await;
        assert!(result.is_err(), "CHECK constraint should reject bad status");
    }
}
