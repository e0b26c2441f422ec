use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::reader::{ReaderTiers, ReturnFormat};
use super::{Tier, TierFetcher};
use crate::cache::{self, CacheStore};
use crate::error::FetchError;
use crate::normalize;

/// View count of a post, read from reader text.
pub struct ViewsFetcher {
    readers: ReaderTiers,
    cache: Arc<dyn CacheStore>,
}

impl ViewsFetcher {
    #[must_use]
    pub fn new(readers: ReaderTiers, cache: Arc<dyn CacheStore>) -> Self {
        Self { readers, cache }
    }

    async fn cached_views(&self, url: &str) -> Option<i64> {
        match cache::get_cached_metrics(self.cache.as_ref(), url).await {
            Ok(metrics) => metrics
                .and_then(|m| m.views)
                .filter(|v| normalize::is_sane_views(*v)),
            Err(e) => {
                debug!(url = %url, error = %e, "Metrics cache read failed");
                None
            }
        }
    }

    /// Store failures are logged; they never fail the fetch.
    async fn remember(&self, url: &str, views: i64) {
        let mut metrics = cache::get_cached_metrics(self.cache.as_ref(), url)
            .await
            .ok()
            .flatten()
            .unwrap_or_default();
        metrics.views = Some(views);
        if let Err(e) = cache::set_cached_metrics(self.cache.as_ref(), url, &metrics).await {
            warn!(url = %url, error = %e, "Failed to cache metrics");
        }
    }
}

#[async_trait]
impl TierFetcher for ViewsFetcher {
    type Output = i64;

    async fn fetch(&self, url: &str, tier: Tier) -> Result<i64, FetchError> {
        if tier == Tier::LocalCached {
            if let Some(views) = self.cached_views(url).await {
                debug!(url = %url, views, "Views served from cache");
                return Ok(views);
            }
        }

        let text = self.readers.read(url, tier, ReturnFormat::Text).await?;
        let views = normalize::parse_views_text(&text)
            .ok_or_else(|| FetchError::ParseMiss("no valid view count in document".to_string()))?;

        self.remember(url, views).await;
        Ok(views)
    }
}

/// Whole-page document text, used when the browser found no caption.
pub struct DocumentFetcher {
    readers: ReaderTiers,
}

impl DocumentFetcher {
    #[must_use]
    pub fn new(readers: ReaderTiers) -> Self {
        Self { readers }
    }
}

/// Reader output with the boilerplate header lines removed.
#[must_use]
pub fn document_body(text: &str) -> String {
    let mut lines = text.lines().peekable();
    // Some readers prefix "Title:", "URL Source:" and similar metadata lines.
    while let Some(line) = lines.peek() {
        let trimmed = line.trim();
        let is_meta = ["Title:", "URL Source:", "Published Time:", "Markdown Content:"]
            .iter()
            .any(|p| trimmed.starts_with(p));
        if is_meta || trimmed.is_empty() {
            lines.next();
        } else {
            break;
        }
    }
    lines
        .map(normalize::clean_text)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl TierFetcher for DocumentFetcher {
    type Output = String;

    async fn fetch(&self, url: &str, tier: Tier) -> Result<String, FetchError> {
        let text = self.readers.read(url, tier, ReturnFormat::Text).await?;
        let body = document_body(&text);
        if body.is_empty() {
            return Err(FetchError::ParseMiss("document has no body text".to_string()));
        }
        Ok(body)
    }
}
