//! SQLite-backed relational store for posts, crawl state and the processing log.

mod migrations;
mod models;
mod queries;

pub use models::*;
pub use queries::*;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use tracing::info;

/// Maximum pooled connections. Writers are serialized by SQLite anyway.
const MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database at `path` and bring its schema up to date.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails, migrations fail, or the file is
    /// not writable.
    pub async fn new(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            // Overlapping crawls for the same account write concurrently; without a
            // busy timeout they fail with SQLITE_BUSY instead of waiting their turn.
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open SQLite database at {}", path.display()))?;

        migrations::run(&pool).await?;
        info!(path = %path.display(), "Database ready");

        let db = Self { pool };
        db.verify_writable(path).await?;
        Ok(db)
    }

    async fn verify_writable(&self, path: &Path) -> Result<()> {
        // A read-only volume otherwise only surfaces at the end of the first crawl.
        let mut tx = self.pool.begin().await.with_context(|| {
            format!(
                "SQLite database is not writable (path: {}). Check volume permissions",
                path.display()
            )
        })?;
        sqlx::query("DELETE FROM kv_cache WHERE 0")
            .execute(&mut *tx)
            .await
            .context("SQLite write probe failed")?;
        tx.commit()
            .await
            .context("Failed to commit SQLite writability check")?;
        Ok(())
    }

    /// Get a reference to the connection pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
