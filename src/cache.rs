//! Key-value cache and named queues.
//!
//! Small metrics records are cached by URL so the cheap tier can answer
//! without a network round-trip, and posts needing the vision tier are handed
//! off through a queue.

use std::collections::{HashMap, VecDeque};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::constants::METRICS_CACHE_PREFIX;
use crate::db::{self, Database, Metrics};

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn push(&self, queue: &str, payload: &str) -> Result<()>;
    async fn pop(&self, queue: &str) -> Result<Option<String>>;
    async fn len(&self, queue: &str) -> Result<usize>;
}

/// Cached metrics for a post URL. Corrupt entries read as a miss.
pub async fn get_cached_metrics(cache: &dyn CacheStore, url: &str) -> Result<Option<Metrics>> {
    let key = format!("{METRICS_CACHE_PREFIX}{url}");
    let Some(raw) = cache.get(&key).await? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(metrics) => Ok(Some(metrics)),
        Err(e) => {
            debug!(key = %key, error = %e, "Ignoring unreadable cache entry");
            Ok(None)
        }
    }
}

pub async fn set_cached_metrics(cache: &dyn CacheStore, url: &str, metrics: &Metrics) -> Result<()> {
    let key = format!("{METRICS_CACHE_PREFIX}{url}");
    cache.set(&key, &serde_json::to_string(metrics)?).await
}

/// Process-local cache, used when no shared store is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
    queues: Mutex<HashMap<String, VecDeque<String>>>,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn push(&self, queue: &str, payload: &str) -> Result<()> {
        self.queues
            .lock()
            .await
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.to_string());
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<String>> {
        Ok(self
            .queues
            .lock()
            .await
            .get_mut(queue)
            .and_then(VecDeque::pop_front))
    }

    async fn len(&self, queue: &str) -> Result<usize> {
        Ok(self.queues.lock().await.get(queue).map_or(0, VecDeque::len))
    }
}

#[async_trait]
impl CacheStore for Database {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        db::kv_get(self.pool(), key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        db::kv_set(self.pool(), key, value).await
    }

    async fn push(&self, queue: &str, payload: &str) -> Result<()> {
        db::queue_push(self.pool(), queue, payload).await
    }

    async fn pop(&self, queue: &str) -> Result<Option<String>> {
        db::queue_pop(self.pool(), queue).await
    }

    async fn len(&self, queue: &str) -> Result<usize> {
        Ok(usize::try_from(db::queue_len(self.pool(), queue).await?).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_queue_is_fifo() {
        let cache = MemoryCache::new();
        cache.push("q", "a").await.unwrap();
        cache.push("q", "b").await.unwrap();
        assert_eq!(cache.len("q").await.unwrap(), 2);
        assert_eq!(cache.pop("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(cache.pop("q").await.unwrap().as_deref(), Some("b"));
        assert_eq!(cache.pop("q").await.unwrap(), None);
        assert_eq!(cache.len("other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_metrics_round_trip_and_corrupt_entry() {
        let cache = MemoryCache::new();
        let url = "https://www.threads.net/@acme/post/A";
        assert!(get_cached_metrics(&cache, url).await.unwrap().is_none());

        let metrics = Metrics {
            views: Some(4000),
            ..Metrics::default()
        };
        set_cached_metrics(&cache, url, &metrics).await.unwrap();
        assert_eq!(get_cached_metrics(&cache, url).await.unwrap(), Some(metrics));

        cache
            .set(&format!("{METRICS_CACHE_PREFIX}{url}"), "not json")
            .await
            .unwrap();
        assert!(get_cached_metrics(&cache, url).await.unwrap().is_none());
    }
}
