use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use super::models::{CrawlState, Metrics, PostRecord, PostRow, ProcessingLogEntry, ProcessingStatus};

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ========== Posts ==========

/// Get a post by its stable ID.
pub async fn get_post(pool: &SqlitePool, post_id: &str) -> Result<Option<PostRecord>> {
    let row: Option<PostRow> = sqlx::query_as("SELECT * FROM posts WHERE post_id = ?")
        .bind(post_id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch post")?;
    Ok(row.map(PostRow::into_record))
}

/// Most recent posts for an account, newest first.
pub async fn get_posts_for_account(
    pool: &SqlitePool,
    account: &str,
    limit: i64,
) -> Result<Vec<PostRecord>> {
    let rows: Vec<PostRow> = sqlx::query_as(
        "SELECT * FROM posts WHERE account = ? ORDER BY created_at DESC, post_id LIMIT ?",
    )
    .bind(account)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("Failed to fetch posts for account")?;
    Ok(rows.into_iter().map(PostRow::into_record).collect())
}

/// Insert or merge a post by `post_id`.
///
/// An existing row is merged with monotonic fill, so re-ingesting the same post
/// updates it instead of duplicating it and never loses known values.
/// Returns `true` when the post was not stored before.
///
/// The read and the write run under `BEGIN IMMEDIATE`: the write lock is taken
/// before the read, so concurrent upserts of the same post wait on the busy
/// timeout instead of failing with a stale snapshot.
pub async fn upsert_post(pool: &SqlitePool, record: &PostRecord) -> Result<bool> {
    let mut conn = pool.acquire().await.context("Failed to acquire connection")?;
    sqlx::query("BEGIN IMMEDIATE")
        .execute(&mut *conn)
        .await
        .context("Failed to begin transaction")?;

    let merged = match merge_post(&mut conn, record).await {
        Ok(inserted) => sqlx::query("COMMIT")
            .execute(&mut *conn)
            .await
            .context("Failed to commit post upsert")
            .map(|_| inserted),
        Err(e) => Err(e),
    };
    if merged.is_err() {
        let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
    }
    merged
}

async fn merge_post(conn: &mut SqliteConnection, record: &PostRecord) -> Result<bool> {
    let existing: Option<PostRow> = sqlx::query_as("SELECT * FROM posts WHERE post_id = ?")
        .bind(&record.post_id)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to read existing post")?;

    let inserted = existing.is_none();
    let merged = match existing {
        Some(row) => {
            let mut current = row.into_record();
            current.merge_from(record);
            current
        }
        None => record.clone(),
    };

    let images = serde_json::to_string(&merged.images).context("Failed to encode images")?;
    let videos = serde_json::to_string(&merged.videos).context("Failed to encode videos")?;

    sqlx::query(
        r"
        INSERT INTO posts (
            post_id, account, url, content, likes, comments, reposts, shares, views,
            images, videos, created_at, source, processing_stage, is_complete,
            fetched_at, views_fetched_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(post_id) DO UPDATE SET
            url = excluded.url,
            content = excluded.content,
            likes = excluded.likes,
            comments = excluded.comments,
            reposts = excluded.reposts,
            shares = excluded.shares,
            views = excluded.views,
            images = excluded.images,
            videos = excluded.videos,
            created_at = excluded.created_at,
            source = excluded.source,
            processing_stage = excluded.processing_stage,
            is_complete = excluded.is_complete,
            fetched_at = excluded.fetched_at,
            views_fetched_at = excluded.views_fetched_at,
            updated_at = excluded.updated_at
        ",
    )
    .bind(&merged.post_id)
    .bind(&merged.account)
    .bind(&merged.url)
    .bind(&merged.content)
    .bind(merged.metrics.likes)
    .bind(merged.metrics.comments)
    .bind(merged.metrics.reposts)
    .bind(merged.metrics.shares)
    .bind(merged.metrics.views)
    .bind(images)
    .bind(videos)
    .bind(merged.created_at.to_rfc3339_opts(SecondsFormat::Millis, true))
    .bind(&merged.source)
    .bind(&merged.processing_stage)
    .bind(merged.is_complete())
    .bind(
        merged
            .fetched_at
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
    )
    .bind(
        merged
            .views_fetched_at
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
    )
    .bind(now_rfc3339())
    .execute(&mut *conn)
    .await
    .context("Failed to upsert post")?;

    Ok(inserted)
}

/// Raise stored metrics for a post. Values only move upward; `None` leaves a
/// column untouched. Returns `false` if the post is unknown.
pub async fn upsert_metrics(pool: &SqlitePool, post_id: &str, metrics: &Metrics) -> Result<bool> {
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;

    let result = sqlx::query(
        r"
        UPDATE posts SET
            likes = CASE WHEN ? IS NOT NULL AND (likes IS NULL OR ? > likes) THEN ? ELSE likes END,
            comments = CASE WHEN ? IS NOT NULL AND (comments IS NULL OR ? > comments) THEN ? ELSE comments END,
            reposts = CASE WHEN ? IS NOT NULL AND (reposts IS NULL OR ? > reposts) THEN ? ELSE reposts END,
            shares = CASE WHEN ? IS NOT NULL AND (shares IS NULL OR ? > shares) THEN ? ELSE shares END,
            views = CASE WHEN ? IS NOT NULL AND (views IS NULL OR ? > views) THEN ? ELSE views END,
            views_fetched_at = CASE WHEN ? > 0 THEN ? ELSE views_fetched_at END,
            updated_at = ?
        WHERE post_id = ?
        ",
    )
    .bind(metrics.likes)
    .bind(metrics.likes)
    .bind(metrics.likes)
    .bind(metrics.comments)
    .bind(metrics.comments)
    .bind(metrics.comments)
    .bind(metrics.reposts)
    .bind(metrics.reposts)
    .bind(metrics.reposts)
    .bind(metrics.shares)
    .bind(metrics.shares)
    .bind(metrics.shares)
    .bind(metrics.views)
    .bind(metrics.views)
    .bind(metrics.views)
    .bind(metrics.views.unwrap_or(0))
    .bind(now_rfc3339())
    .bind(now_rfc3339())
    .bind(post_id)
    .execute(&mut *tx)
    .await
    .context("Failed to update post metrics")?;

    if result.rows_affected() == 0 {
        tx.rollback().await.ok();
        return Ok(false);
    }

    sqlx::query(
        r"
        UPDATE posts SET is_complete = COALESCE(
            likes >= 0 AND comments >= 0 AND reposts >= 0 AND shares >= 0 AND views >= 0, 0)
        WHERE post_id = ?
        ",
    )
    .bind(post_id)
    .execute(&mut *tx)
    .await
    .context("Failed to recompute completeness")?;

    tx.commit().await.context("Failed to commit metrics update")?;
    Ok(true)
}

/// All post IDs already stored for an account.
pub async fn get_existing_post_ids(pool: &SqlitePool, account: &str) -> Result<HashSet<String>> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT post_id FROM posts WHERE account = ?")
        .bind(account)
        .fetch_all(pool)
        .await
        .context("Failed to fetch existing post IDs")?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

// ========== Crawl State ==========

/// Crawl state for one account, if it has been crawled before.
pub async fn get_crawl_state(pool: &SqlitePool, account: &str) -> Result<Option<CrawlState>> {
    sqlx::query_as("SELECT * FROM crawl_state WHERE account = ?")
        .bind(account)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch crawl state")
}

/// Crawl states for several accounts in one query.
pub async fn get_crawl_states(pool: &SqlitePool, accounts: &[String]) -> Result<Vec<CrawlState>> {
    if accounts.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; accounts.len()].join(", ");
    let sql = format!("SELECT * FROM crawl_state WHERE account IN ({placeholders}) ORDER BY account");
    let mut query = sqlx::query_as::<_, CrawlState>(&sql);
    for account in accounts {
        query = query.bind(account);
    }
    query
        .fetch_all(pool)
        .await
        .context("Failed to fetch crawl states")
}

/// Bump `total_crawled` by `added` and move the cursor forward.
///
/// A single upsert with an in-place increment, so overlapping runs for the
/// same account add up instead of overwriting each other. A `None` cursor
/// keeps the stored one.
pub async fn advance_crawl_state(
    pool: &SqlitePool,
    account: &str,
    latest_post_id: Option<&str>,
    added: i64,
) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO crawl_state (account, latest_post_id, total_crawled, last_crawl_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(account) DO UPDATE SET
            latest_post_id = COALESCE(excluded.latest_post_id, crawl_state.latest_post_id),
            total_crawled = crawl_state.total_crawled + excluded.total_crawled,
            last_crawl_at = excluded.last_crawl_at
        ",
    )
    .bind(account)
    .bind(latest_post_id)
    .bind(added.max(0))
    .bind(now_rfc3339())
    .execute(pool)
    .await
    .context("Failed to advance crawl state")?;

    Ok(())
}

// ========== Processing Log ==========

/// Record one processing step for a URL.
pub async fn log_processing(
    pool: &SqlitePool,
    url: &str,
    stage: &str,
    status: ProcessingStatus,
    metadata: Option<&serde_json::Value>,
) -> Result<()> {
    sqlx::query("INSERT INTO processing_log (url, stage, status, metadata) VALUES (?, ?, ?, ?)")
        .bind(url)
        .bind(stage)
        .bind(status.as_str())
        .bind(metadata.map(serde_json::Value::to_string))
        .execute(pool)
        .await
        .context("Failed to write processing log")?;
    Ok(())
}

/// Processing log rows for a URL, oldest first.
pub async fn get_processing_log(pool: &SqlitePool, url: &str) -> Result<Vec<ProcessingLogEntry>> {
    sqlx::query_as("SELECT * FROM processing_log WHERE url = ? ORDER BY id")
        .bind(url)
        .fetch_all(pool)
        .await
        .context("Failed to fetch processing log")
}

// ========== Cache & Queues ==========

pub async fn kv_get(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM kv_cache WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("Failed to read cache entry")?;
    Ok(row.map(|(v,)| v))
}

pub async fn kv_set(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO kv_cache (key, value, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        ",
    )
    .bind(key)
    .bind(value)
    .bind(now_rfc3339())
    .execute(pool)
    .await
    .context("Failed to write cache entry")?;
    Ok(())
}

pub async fn queue_push(pool: &SqlitePool, queue: &str, payload: &str) -> Result<()> {
    sqlx::query("INSERT INTO queue_items (queue, payload) VALUES (?, ?)")
        .bind(queue)
        .bind(payload)
        .execute(pool)
        .await
        .context("Failed to push queue item")?;
    Ok(())
}

/// Remove and return the oldest item of a queue.
pub async fn queue_pop(pool: &SqlitePool, queue: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as(
        r"
        DELETE FROM queue_items
        WHERE id = (SELECT id FROM queue_items WHERE queue = ? ORDER BY id LIMIT 1)
        RETURNING payload
        ",
    )
    .bind(queue)
    .fetch_optional(pool)
    .await
    .context("Failed to pop queue item")?;
    Ok(row.map(|(p,)| p))
}

pub async fn queue_len(pool: &SqlitePool, queue: &str) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_items WHERE queue = ?")
        .bind(queue)
        .fetch_one(pool)
        .await
        .context("Failed to count queue items")?;
    Ok(count)
}
