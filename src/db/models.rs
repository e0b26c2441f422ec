use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::METRIC_FAILED;
use crate::platform::PostLink;

/// One of the five engagement metrics tracked per post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Likes,
    Comments,
    Reposts,
    Shares,
    Views,
}

impl Metric {
    pub const ALL: [Self; 5] = [
        Self::Likes,
        Self::Comments,
        Self::Reposts,
        Self::Shares,
        Self::Views,
    ];

    /// The four metrics rendered on the post itself, in descending typical magnitude.
    pub const ENGAGEMENT: [Self; 4] = [Self::Likes, Self::Comments, Self::Reposts, Self::Shares];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Likes => "likes",
            Self::Comments => "comments",
            Self::Reposts => "reposts",
            Self::Shares => "shares",
            Self::Views => "views",
        }
    }
}

/// Engagement counts. `None` means unknown, `Some(-1)` means a fetch was
/// attempted and failed, `Some(0)` is a real zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub likes: Option<i64>,
    pub comments: Option<i64>,
    pub reposts: Option<i64>,
    pub shares: Option<i64>,
    pub views: Option<i64>,
}

impl Metrics {
    #[must_use]
    pub fn get(&self, metric: Metric) -> Option<i64> {
        match metric {
            Metric::Likes => self.likes,
            Metric::Comments => self.comments,
            Metric::Reposts => self.reposts,
            Metric::Shares => self.shares,
            Metric::Views => self.views,
        }
    }

    pub fn slot(&mut self, metric: Metric) -> &mut Option<i64> {
        match metric {
            Metric::Likes => &mut self.likes,
            Metric::Comments => &mut self.comments,
            Metric::Reposts => &mut self.reposts,
            Metric::Shares => &mut self.shares,
            Metric::Views => &mut self.views,
        }
    }

    /// Value if it is a real count (not unknown, not the failure sentinel).
    #[must_use]
    pub fn known(&self, metric: Metric) -> Option<i64> {
        self.get(metric).filter(|v| *v >= 0)
    }

    /// True when no metric carries a real count.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        Metric::ALL.iter().all(|m| self.known(*m).is_none())
    }

    /// True when at least one of the on-post engagement counts is known.
    #[must_use]
    pub fn has_engagement(&self) -> bool {
        Metric::ENGAGEMENT.iter().any(|m| self.known(*m).is_some())
    }

    /// All five metrics hold a real count.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        Metric::ALL.iter().all(|m| self.known(*m).is_some())
    }

    /// Metrics among `wanted` that still lack a real count.
    #[must_use]
    pub fn missing(&self, wanted: &[Metric]) -> Vec<Metric> {
        wanted
            .iter()
            .copied()
            .filter(|m| self.known(*m).is_none())
            .collect()
    }

    /// Sum of likes, comments, reposts and shares, treating unknown as zero.
    #[must_use]
    pub fn engagement(&self) -> i64 {
        Metric::ENGAGEMENT
            .iter()
            .filter_map(|m| self.known(*m))
            .sum()
    }

    /// Monotonic fill: only absent, zero or failed slots are replaced, and
    /// only by a better candidate. Positive values are never lowered.
    pub fn fill_from(&mut self, other: &Self) {
        for metric in Metric::ALL {
            let slot = self.slot(metric);
            *slot = fill_value(*slot, other.get(metric));
        }
    }

    /// Raise-only update used when refreshing metrics of stored posts.
    pub fn raise_from(&mut self, other: &Self) {
        for metric in Metric::ALL {
            let slot = self.slot(metric);
            *slot = match (*slot, other.get(metric)) {
                (Some(old), Some(new)) if new > old => Some(new),
                (None, new) => new,
                (old, _) => old,
            };
        }
    }

    /// Mark every unknown metric as failed so stored rows are never ambiguous.
    pub fn mark_unknown_failed(&mut self) {
        for metric in Metric::ALL {
            let slot = self.slot(metric);
            if slot.is_none() {
                *slot = Some(METRIC_FAILED);
            }
        }
    }
}

/// Merge rule for one metric slot.
#[must_use]
pub fn fill_value(current: Option<i64>, candidate: Option<i64>) -> Option<i64> {
    match (current, candidate) {
        (Some(old), Some(new)) if old <= 0 && new > 0 => Some(new),
        (None, Some(new)) if new > 0 => Some(new),
        (None | Some(METRIC_FAILED), Some(0)) => Some(0),
        (None, new) => new,
        (old, _) => old,
    }
}

/// One harvested post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRecord {
    pub post_id: String,
    pub account: String,
    pub url: String,
    pub content: String,
    pub metrics: Metrics,
    pub images: Vec<String>,
    pub videos: Vec<String>,
    /// Best-effort publish time; ingestion time when the real one is unreadable.
    pub created_at: DateTime<Utc>,
    /// Extraction path that produced the base record.
    pub source: String,
    /// Pipeline marker for observability only.
    pub processing_stage: String,
    pub fetched_at: Option<DateTime<Utc>>,
    pub views_fetched_at: Option<DateTime<Utc>>,
}

impl PostRecord {
    /// Provisional record for a freshly discovered post: identity only.
    #[must_use]
    pub fn provisional(account: &str, link: &PostLink) -> Self {
        Self {
            post_id: link.post_id(),
            account: account.trim_start_matches('@').to_lowercase(),
            url: link.url.clone(),
            content: String::new(),
            metrics: Metrics::default(),
            images: Vec::new(),
            videos: Vec::new(),
            created_at: Utc::now(),
            source: "discovery".to_string(),
            processing_stage: "discovered".to_string(),
            fetched_at: None,
            views_fetched_at: None,
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.metrics.is_complete()
    }

    /// Merge a later pass into this record without losing known-good data.
    ///
    /// Repeating the same merge is a no-op.
    pub fn merge_from(&mut self, other: &Self) {
        self.metrics.fill_from(&other.metrics);

        if self.content.trim().is_empty() && !other.content.trim().is_empty() {
            self.content = other.content.clone();
        }

        union_into(&mut self.images, &other.images);
        union_into(&mut self.videos, &other.videos);

        if other.created_at < self.created_at {
            self.created_at = other.created_at;
        }
        self.fetched_at = later(self.fetched_at, other.fetched_at);
        self.views_fetched_at = later(self.views_fetched_at, other.views_fetched_at);

        if self.source.is_empty() {
            self.source = other.source.clone();
        }
        if !other.processing_stage.is_empty() {
            self.processing_stage = other.processing_stage.clone();
        }
    }
}

/// Append items from `extra` that `target` does not contain yet, keeping order.
pub fn union_into(target: &mut Vec<String>, extra: &[String]) {
    for item in extra {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
}

fn later(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

/// Stored form of a post.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PostRow {
    pub post_id: String,
    pub account: String,
    pub url: String,
    pub content: String,
    pub likes: Option<i64>,
    pub comments: Option<i64>,
    pub reposts: Option<i64>,
    pub shares: Option<i64>,
    pub views: Option<i64>,
    pub images: String,
    pub videos: String,
    pub created_at: String,
    pub source: String,
    pub processing_stage: String,
    pub is_complete: bool,
    pub fetched_at: Option<String>,
    pub views_fetched_at: Option<String>,
    pub updated_at: String,
}

impl PostRow {
    /// Convert to the domain record. Unparseable timestamps fall back to now.
    #[must_use]
    pub fn into_record(self) -> PostRecord {
        PostRecord {
            post_id: self.post_id,
            account: self.account,
            url: self.url,
            content: self.content,
            metrics: Metrics {
                likes: self.likes,
                comments: self.comments,
                reposts: self.reposts,
                shares: self.shares,
                views: self.views,
            },
            images: serde_json::from_str(&self.images).unwrap_or_default(),
            videos: serde_json::from_str(&self.videos).unwrap_or_default(),
            created_at: parse_timestamp(&self.created_at).unwrap_or_else(Utc::now),
            source: self.source,
            processing_stage: self.processing_stage,
            fetched_at: self.fetched_at.as_deref().and_then(parse_timestamp),
            views_fetched_at: self.views_fetched_at.as_deref().and_then(parse_timestamp),
        }
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Per-account crawl progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CrawlState {
    pub account: String,
    pub latest_post_id: Option<String>,
    pub total_crawled: i64,
    pub last_crawl_at: Option<String>,
}

/// Processing status recorded in the processing log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Started,
    Success,
    Escalated,
    Failed,
}

impl ProcessingStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Success => "success",
            Self::Escalated => "escalated",
            Self::Failed => "failed",
        }
    }
}

/// One row of the processing log.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProcessingLogEntry {
    pub id: i64,
    pub url: String,
    pub stage: String,
    pub status: String,
    pub metadata: Option<String>,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::parse_post_link;

    fn record(code: &str) -> PostRecord {
        let link = parse_post_link(&format!("/@acme/post/{code}"), "https://www.threads.net").unwrap();
        PostRecord::provisional("acme", &link)
    }

    #[test]
    fn test_fill_value_rules() {
        assert_eq!(fill_value(None, Some(5)), Some(5));
        assert_eq!(fill_value(Some(0), Some(5)), Some(5));
        assert_eq!(fill_value(Some(-1), Some(5)), Some(5));
        assert_eq!(fill_value(Some(120), Some(999)), Some(120));
        assert_eq!(fill_value(Some(120), Some(3)), Some(120));
        assert_eq!(fill_value(Some(120), None), Some(120));
        assert_eq!(fill_value(None, Some(0)), Some(0));
        assert_eq!(fill_value(Some(-1), Some(0)), Some(0));
        assert_eq!(fill_value(Some(0), Some(-1)), Some(0));
        assert_eq!(fill_value(None, Some(-1)), Some(-1));
        assert_eq!(fill_value(None, None), None);
    }

    #[test]
    fn test_merge_never_decreases_or_shrinks() {
        let mut a = record("A1");
        a.metrics.likes = Some(120);
        a.metrics.views = Some(0);
        a.images = vec!["img1".to_string()];

        let mut b = record("A1");
        b.metrics.likes = Some(7);
        b.metrics.views = Some(900);
        b.metrics.comments = Some(4);
        b.images = vec!["img2".to_string()];
        b.videos = vec!["vid1".to_string()];
        b.content = "hello".to_string();

        a.merge_from(&b);
        assert_eq!(a.metrics.likes, Some(120));
        assert_eq!(a.metrics.views, Some(900));
        assert_eq!(a.metrics.comments, Some(4));
        assert_eq!(a.images, vec!["img1".to_string(), "img2".to_string()]);
        assert_eq!(a.videos, vec!["vid1".to_string()]);
        assert_eq!(a.content, "hello");

        let once = a.clone();
        a.merge_from(&b);
        assert_eq!(a, once);
    }

    #[test]
    fn test_merge_keeps_existing_content_and_earliest_time() {
        let mut a = record("A2");
        a.content = "original".to_string();
        let mut b = record("A2");
        b.content = "other".to_string();
        b.created_at = a.created_at - chrono::Duration::days(2);

        a.merge_from(&b);
        assert_eq!(a.content, "original");
        assert_eq!(a.created_at, b.created_at);
    }

    #[test]
    fn test_completeness_and_sentinels() {
        let mut m = Metrics {
            likes: Some(1),
            comments: Some(0),
            reposts: Some(2),
            shares: Some(3),
            views: None,
        };
        assert!(!m.is_complete());
        assert_eq!(m.missing(&Metric::ALL), vec![Metric::Views]);
        m.mark_unknown_failed();
        assert_eq!(m.views, Some(METRIC_FAILED));
        assert!(!m.is_complete());
        m.views = Some(10);
        assert!(m.is_complete());
        assert_eq!(m.engagement(), 6);
    }

    #[test]
    fn test_raise_from() {
        let mut m = Metrics {
            likes: Some(10),
            views: Some(-1),
            ..Metrics::default()
        };
        m.raise_from(&Metrics {
            likes: Some(8),
            views: Some(50),
            shares: Some(2),
            ..Metrics::default()
        });
        assert_eq!(m.likes, Some(10));
        assert_eq!(m.views, Some(50));
        assert_eq!(m.shares, Some(2));
    }
}
