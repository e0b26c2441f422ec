//! Hybrid per-post extraction.
//!
//! Metrics come from the first of three strategies that yields anything:
//! network interception of the counts API, replay of a request captured
//! earlier in the session, then DOM parsing. Caption and media are extracted
//! independently of which metrics strategy won.

pub mod dom;
pub mod graphql;
pub mod media;
pub mod replay;

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::browser::{ObservedResponse, PageSession};
use crate::db::{Metrics, PostRecord};
use crate::error::FetchError;
use crate::platform;

use dom::PageKind;
use graphql::CountsRecord;
use replay::{CapturedRequest, ReplayCache, RequestReplayer};

/// Per-post extraction tuning.
#[derive(Debug, Clone)]
pub struct ExtractorSettings {
    /// How long to keep listening for API responses after the page loaded.
    pub intercept_window: Duration,
    pub navigation_timeout: Duration,
    /// Minimum rendered width and height for post images.
    pub min_image_px: u32,
    /// Pause after navigation for lazy content.
    pub settle_delay: Duration,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            intercept_window: Duration::from_secs(4),
            navigation_timeout: Duration::from_secs(30),
            min_image_px: 150,
            settle_delay: Duration::from_millis(1500),
        }
    }
}

/// Which strategy produced the metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsSource {
    Interception,
    Replay,
    Dom,
}

impl MetricsSource {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interception => "interception",
            Self::Replay => "replay",
            Self::Dom => "dom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractMode {
    /// Metrics, caption and media.
    Full,
    /// Metrics only; used when refreshing stored posts.
    MetricsOnly,
}

/// Best-effort result for one post.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub metrics: Metrics,
    pub metrics_source: Option<MetricsSource>,
    pub content: Option<String>,
    pub images: Vec<String>,
    pub videos: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub page_kind: PageKind,
}

impl Extraction {
    /// Merge into `record` under the monotonic-fill rules.
    pub fn apply_to(&self, record: &mut PostRecord) {
        let mut update = record.clone();
        update.metrics = self.metrics;
        update.content = self.content.clone().unwrap_or_default();
        update.images.clone_from(&self.images);
        update.videos.clone_from(&self.videos);
        if let Some(created_at) = self.created_at {
            update.created_at = created_at;
        }
        update.fetched_at = Some(Utc::now());
        update.processing_stage = "extracted".to_string();

        if record.source == "discovery" {
            if let Some(source) = self.metrics_source {
                record.source = source.as_str().to_string();
            }
        }
        record.merge_from(&update);
    }
}

/// Runs the three strategies against one page at a time.
///
/// One extractor lives for one crawl session; captured requests are shared
/// between the posts of that session only.
pub struct HybridExtractor {
    settings: ExtractorSettings,
    replayer: RequestReplayer,
    captures: ReplayCache,
}

impl HybridExtractor {
    /// # Errors
    ///
    /// Returns an error if the replay HTTP client cannot be built.
    pub fn new(settings: ExtractorSettings) -> Result<Self> {
        let replayer = RequestReplayer::new(settings.navigation_timeout)?;
        Ok(Self {
            settings,
            replayer,
            captures: ReplayCache::new(),
        })
    }

    /// Extract one post on `page`.
    ///
    /// # Errors
    ///
    /// `Transient` when navigation fails or times out, `PageAnomaly` for empty
    /// or login-walled pages, `ParseMiss` for URLs that are not post links.
    pub async fn extract(
        &self,
        page: &dyn PageSession,
        url: &str,
        account: &str,
        mode: ExtractMode,
    ) -> Result<Extraction, FetchError> {
        let link = platform::parse_post_link(url, "")
            .ok_or_else(|| FetchError::ParseMiss(format!("not a post URL: {url}")))?;
        let shortcode = link.shortcode;

        let observer = match page.observe_network().await {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!(url = %url, error = %e, "Network observation unavailable");
                None
            }
        };

        match tokio::time::timeout(self.settings.navigation_timeout, page.goto(url)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(FetchError::Transient(format!("navigation failed: {e:#}"))),
            Err(_) => return Err(FetchError::Transient("navigation timed out".to_string())),
        }
        if !self.settings.settle_delay.is_zero() {
            tokio::time::sleep(self.settings.settle_delay).await;
        }

        let html = match tokio::time::timeout(self.settings.navigation_timeout, page.content()).await {
            Ok(Ok(html)) => html,
            Ok(Err(e)) => return Err(FetchError::Transient(format!("content read failed: {e:#}"))),
            Err(_) => return Err(FetchError::Transient("content read timed out".to_string())),
        };
        let page_kind = dom::classify_page(&html);
        match page_kind {
            PageKind::Empty | PageKind::LoginWall => {
                return Err(FetchError::PageAnomaly(format!("{} page", page_kind.as_str())));
            }
            PageKind::Gate => debug!(url = %url, "Gate page, using DOM only"),
            PageKind::Hydrated => {}
        }

        let intercepted = match observer {
            Some(rx) if page_kind == PageKind::Hydrated => self.drain(rx, &shortcode).await,
            _ => Intercepted::default(),
        };

        let mut counts = intercepted.counts.clone();
        let mut metrics_source = counts.as_ref().map(|_| MetricsSource::Interception);

        if counts.is_none() && page_kind == PageKind::Hydrated {
            counts = self.replay(page, url, &shortcode).await;
            if counts.is_some() {
                metrics_source = Some(MetricsSource::Replay);
            }
        }

        let metrics = match &counts {
            Some(record) => record.metrics,
            None => {
                let metrics = dom::metrics_from_dom(&html);
                if metrics.has_engagement() {
                    metrics_source = Some(MetricsSource::Dom);
                }
                metrics
            }
        };

        debug!(
            url = %url,
            source = metrics_source.map_or("none", |s| s.as_str()),
            likes = ?metrics.likes,
            comments = ?metrics.comments,
            "Metrics extracted"
        );

        let mut extraction = Extraction {
            metrics,
            metrics_source,
            content: None,
            images: Vec::new(),
            videos: Vec::new(),
            created_at: None,
            page_kind,
        };

        if mode == ExtractMode::Full {
            extraction.content = counts
                .as_ref()
                .and_then(|r| r.caption.clone())
                .or_else(|| dom::caption_from_dom(&html, account));
            extraction.created_at = counts
                .as_ref()
                .and_then(|r| r.taken_at)
                .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
                .or_else(|| dom::published_at(&html));

            let candidates =
                match tokio::time::timeout(self.settings.navigation_timeout, page.media_candidates()).await {
                    Ok(Ok(candidates)) => candidates,
                    Ok(Err(e)) => {
                        debug!(url = %url, error = %e, "Media read failed");
                        Vec::new()
                    }
                    Err(_) => {
                        debug!(url = %url, "Media read timed out");
                        Vec::new()
                    }
                };
            extraction.images = media::select_images(&candidates, self.settings.min_image_px);
            extraction.videos = media::select_videos(&candidates, &intercepted.videos);
        }

        Ok(extraction)
    }

    /// Listen for the intercept window and collect counts and media.
    async fn drain(
        &self,
        mut rx: mpsc::UnboundedReceiver<ObservedResponse>,
        shortcode: &str,
    ) -> Intercepted {
        let deadline = tokio::time::Instant::now() + self.settings.intercept_window;
        let mut out = Intercepted::default();

        while let Ok(Some(response)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            if media::is_video_response(&response) {
                out.videos.push(response.url.clone());
                continue;
            }
            if !graphql::is_counts_query(&response) {
                continue;
            }
            let Some(body) = response.body.as_deref() else {
                continue;
            };
            match graphql::parse_counts_payload(body) {
                Ok(records) => {
                    // The page's own post unless the payload names another one.
                    let captured_for = records
                        .iter()
                        .find_map(|r| r.shortcode.clone())
                        .unwrap_or_else(|| shortcode.to_string());
                    self.captures
                        .remember(CapturedRequest::from_observed(&response, Some(captured_for)))
                        .await;
                    if out.counts.is_none() {
                        out.counts = graphql::record_for(&records, shortcode).cloned();
                    }
                }
                Err(e) => debug!(url = %response.url, error = %e, "Unreadable counts response"),
            }
        }
        out
    }

    async fn replay(&self, page: &dyn PageSession, url: &str, shortcode: &str) -> Option<CountsRecord> {
        let captured = self.captures.latest().await?;
        let cookies = tokio::time::timeout(self.settings.navigation_timeout, page.cookie_header())
            .await
            .ok()
            .and_then(|read| read.ok())
            .unwrap_or_default();

        let body = match self.replayer.replay(&captured, shortcode, &cookies).await {
            Ok(body) => body,
            Err(e) => {
                debug!(url = %url, error = %e, "Replay failed");
                return None;
            }
        };
        match graphql::parse_counts_payload(&body) {
            Ok(records) => graphql::labeled_record_for(&records, shortcode).cloned(),
            Err(e) => {
                debug!(url = %url, error = %e, "Replay response unusable");
                None
            }
        }
    }
}

#[derive(Debug, Default)]
struct Intercepted {
    counts: Option<CountsRecord>,
    videos: Vec<String>,
}
