use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::debug;

/// Run all pending migrations.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    create_migration_table(pool).await?;
    let current_version = get_schema_version(pool).await?;

    if current_version < 1 {
        debug!("Running migration v1");
        run_migration_v1(pool).await?;
        set_schema_version(pool, 1).await?;
    }

    if current_version < 2 {
        debug!("Running migration v2");
        run_migration_v2(pool).await?;
        set_schema_version(pool, 2).await?;
    }

    Ok(())
}

async fn create_migration_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS _schema_version (
            version INTEGER PRIMARY KEY
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create schema version table")?;

    Ok(())
}

async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let row: Option<(i32,)> = sqlx::query_as("SELECT version FROM _schema_version LIMIT 1")
        .fetch_optional(pool)
        .await
        .context("Failed to get schema version")?;

    Ok(row.map_or(0, |(v,)| v))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("DELETE FROM _schema_version")
        .execute(pool)
        .await?;
    sqlx::query("INSERT INTO _schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

async fn run_migration_v1(pool: &SqlitePool) -> Result<()> {
    debug!("Running migration v1: creating initial schema");

    // Posts table
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS posts (
            post_id TEXT PRIMARY KEY,
            account TEXT NOT NULL,
            url TEXT NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            likes INTEGER,
            comments INTEGER,
            reposts INTEGER,
            shares INTEGER,
            views INTEGER,
            images TEXT NOT NULL DEFAULT '[]',
            videos TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            source TEXT NOT NULL DEFAULT '',
            processing_stage TEXT NOT NULL DEFAULT '',
            is_complete INTEGER NOT NULL DEFAULT 0,
            fetched_at TEXT,
            views_fetched_at TEXT,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            UNIQUE(account, url)
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create posts table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_posts_account ON posts(account, created_at)")
        .execute(pool)
        .await
        .context("Failed to create posts account index")?;

    // Crawl state, one row per account
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS crawl_state (
            account TEXT PRIMARY KEY,
            latest_post_id TEXT,
            total_crawled INTEGER NOT NULL DEFAULT 0,
            last_crawl_at TEXT
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create crawl_state table")?;

    // Processing log
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS processing_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL,
            stage TEXT NOT NULL,
            status TEXT NOT NULL,
            metadata TEXT,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create processing_log table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_processing_log_url ON processing_log(url)")
        .execute(pool)
        .await
        .context("Failed to create processing_log index")?;

    Ok(())
}

async fn run_migration_v2(pool: &SqlitePool) -> Result<()> {
    debug!("Running migration v2: cache and queue tables");

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS kv_cache (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create kv_cache table")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS queue_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            queue TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create queue_items table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_queue_items_queue ON queue_items(queue, id)")
        .execute(pool)
        .await
        .context("Failed to create queue_items index")?;

    Ok(())
}
