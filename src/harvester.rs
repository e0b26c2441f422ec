//! Crawl orchestration.
//!
//! One [`Harvester::crawl_account`] call runs the whole pipeline for an
//! account: work out how many new posts are wanted, discover them on the
//! profile page, extract each post, escalate views and missing captions
//! through the reader tiers, collapse near-duplicates, persist, and advance
//! the crawl cursor. Per-post failures are recorded and counted; only a
//! browser or storage setup failure aborts the call.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use rand::Rng;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::browser::{BrowserDriver, PagePool};
use crate::cache::CacheStore;
use crate::config::Config;
use crate::constants::VISION_QUEUE;
use crate::db::{self, Metric, PostRecord, ProcessingStatus};
use crate::dedup;
use crate::discovery::{DiscoveryController, DiscoveryMode, DiscoveryRequest, StopReason};
use crate::error::FetchError;
use crate::escalation::{DocumentFetcher, EscalationPipeline, ReaderTiers, ViewsFetcher};
use crate::extractor::{ExtractMode, ExtractorSettings, HybridExtractor};
use crate::platform;
use crate::progress::{NoopProgress, ProgressEvent, ProgressSink};
use crate::state::CrawlStateStore;
use crate::vision::{VisionClient, VisionJob};

/// Inputs of one crawl invocation.
#[derive(Debug, Clone)]
pub struct CrawlRequest {
    pub account: String,
    /// Exact number of new posts wanted.
    pub extra_requested: i64,
    pub mode: DiscoveryMode,
    /// Correlates progress events and log lines.
    pub task_id: String,
}

impl CrawlRequest {
    #[must_use]
    pub fn new(account: &str, extra_requested: i64) -> Self {
        Self {
            account: account.trim_start_matches('@').to_lowercase(),
            extra_requested,
            mode: DiscoveryMode::New,
            task_id: Uuid::new_v4().to_string(),
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: DiscoveryMode) -> Self {
        self.mode = mode;
        self
    }
}

/// What a crawl produced. Returned even when individual posts failed.
#[derive(Debug, Clone, Default)]
pub struct CrawlReport {
    pub account: String,
    pub task_id: String,
    /// Final batch in discovery order, after dedup.
    pub records: Vec<PostRecord>,
    /// Posts with all four engagement counts.
    pub succeeded: usize,
    /// Posts handed to the vision queue for missing counts.
    pub needs_escalation: usize,
    /// Posts whose page could not be extracted at all.
    pub failed: usize,
    /// Rows that did not exist before this crawl.
    pub inserted: usize,
    /// Near-duplicates dropped in favour of their main post.
    pub duplicates: usize,
    pub stop: Option<StopReason>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub refreshed: usize,
    /// URLs with no stored post to update.
    pub unknown: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refresh {
    Stored,
    Unknown,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VisionReport {
    pub processed: usize,
    pub filled: usize,
    pub failed: usize,
}

pub struct Harvester {
    state: CrawlStateStore,
    cache: Arc<dyn CacheStore>,
    driver: Arc<dyn BrowserDriver>,
    scroll_pool: PagePool,
    detail_pool: PagePool,
    metrics_pool: PagePool,
    discovery: DiscoveryController,
    extractor_settings: ExtractorSettings,
    views: EscalationPipeline<ViewsFetcher>,
    documents: EscalationPipeline<DocumentFetcher>,
    vision: Option<VisionClient>,
    progress: Arc<dyn ProgressSink>,
    metrics_concurrency: usize,
    page_timeout: Duration,
    pause: Duration,
}

impl Harvester {
    /// Wire the pipeline from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be built.
    pub fn new(
        config: &Config,
        driver: Arc<dyn BrowserDriver>,
        state: CrawlStateStore,
        cache: Arc<dyn CacheStore>,
    ) -> Result<Self> {
        let readers = ReaderTiers::new(
            &config.local_reader_url,
            &config.remote_reader_url,
            config.remote_reader_api_key.clone(),
            config.page_timeout,
        )?;
        let escalation = config.escalation_settings();

        Ok(Self {
            state,
            views: EscalationPipeline::new(
                ViewsFetcher::new(readers.clone(), Arc::clone(&cache)),
                escalation.clone(),
            ),
            documents: EscalationPipeline::new(DocumentFetcher::new(readers), escalation),
            cache,
            scroll_pool: PagePool::new(Arc::clone(&driver), 1, "discovery"),
            detail_pool: PagePool::new(Arc::clone(&driver), config.detail_concurrency, "detail"),
            metrics_pool: PagePool::new(Arc::clone(&driver), config.metrics_concurrency, "metrics"),
            driver,
            discovery: DiscoveryController::new(
                config.discovery_settings(),
                config.platform_base_url.clone(),
            ),
            extractor_settings: config.extractor_settings(),
            vision: VisionClient::from_config(config)?,
            progress: Arc::new(NoopProgress),
            metrics_concurrency: config.metrics_concurrency.max(1),
            page_timeout: config.page_timeout,
            pause: config.settle_delay,
        })
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn with_vision(mut self, vision: VisionClient) -> Self {
        self.vision = Some(vision);
        self
    }

    #[must_use]
    pub fn state(&self) -> &CrawlStateStore {
        &self.state
    }

    /// Crawl `request.extra_requested` new posts of one account.
    ///
    /// # Errors
    ///
    /// Only failures to reach the browser or read crawl state are errors.
    /// Everything that goes wrong for a single post is counted in the report.
    pub async fn crawl_account(&self, request: &CrawlRequest) -> Result<CrawlReport> {
        let result = self.run_crawl(request).await;
        // The browser belongs to this invocation only.
        self.driver.shutdown().await;
        result
    }

    async fn run_crawl(&self, request: &CrawlRequest) -> Result<CrawlReport> {
        let account = request.account.as_str();
        let mut report = CrawlReport {
            account: account.to_string(),
            task_id: request.task_id.clone(),
            ..CrawlReport::default()
        };

        let needed = self.state.needed(account, request.extra_requested);
        if needed == 0 {
            return Ok(report);
        }
        self.publish(
            ProgressEvent::new(&request.task_id, "started")
                .with("account", account)
                .with("needed", needed)
                .with("mode", request.mode.as_str()),
        );

        let known_ids = self.state.existing_ids(account).await?;
        let stored = self.state.state(account).await?;
        let anchor = stored.as_ref().and_then(|s| s.latest_post_id.clone());

        // Discovery
        let lease = self.scroll_pool.acquire().await?;
        let discovered = self
            .discovery
            .discover(
                lease.page(),
                &DiscoveryRequest {
                    account,
                    target: needed,
                    anchor: anchor.as_deref(),
                    mode: request.mode,
                    known_ids: &known_ids,
                },
            )
            .await;
        lease.release().await;
        let outcome = match discovered {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(account = %account, error = %e, "Discovery failed");
                self.publish(
                    ProgressEvent::new(&request.task_id, "failed")
                        .with("stage", "discovery")
                        .with("error", format!("{e:#}")),
                );
                return Ok(report);
            }
        };
        report.stop = Some(outcome.stop);
        self.publish(
            ProgressEvent::new(&request.task_id, "discovered")
                .with("found", outcome.links.len())
                .with("stop", outcome.stop.as_str())
                .with("rounds", outcome.rounds),
        );

        let mut records: Vec<PostRecord> = outcome
            .links
            .iter()
            .map(|link| PostRecord::provisional(account, link))
            .collect();

        // Details, one page at a time
        let extractor = HybridExtractor::new(self.extractor_settings.clone())?;
        let mut failed_ids = HashSet::new();
        for (i, record) in records.iter_mut().enumerate() {
            if i > 0 {
                self.jitter_pause().await;
            }
            if !self.extract_detail(&extractor, record, account).await? {
                failed_ids.insert(record.post_id.clone());
            }
            self.publish(
                ProgressEvent::new(&request.task_id, "extracted")
                    .with("post_id", record.post_id.as_str())
                    .with("index", i + 1)
                    .with("total", outcome.links.len()),
            );
        }

        self.escalate_views(&mut records).await;
        self.fill_missing_content(&mut records).await;

        let collapsed = dedup::collapse(records);
        report.duplicates = collapsed.dropped.len();
        for (dropped, main) in &collapsed.dropped {
            debug!(post_id = %dropped, main = %main, "Dropped near-duplicate");
        }
        let mut records = collapsed.kept;
        let newest = records.first().map(|r| r.post_id.clone());

        // Failed extractions stay in the batch with sentinel counts.
        for record in &mut records {
            if failed_ids.contains(&record.post_id) {
                report.failed += 1;
            } else if record.metrics.missing(&Metric::ENGAGEMENT).is_empty() {
                report.succeeded += 1;
            } else {
                report.needs_escalation += 1;
                self.queue_for_vision(record).await;
            }
            record.metrics.mark_unknown_failed();
            record.processing_stage = "persisted".to_string();
        }

        report.inserted = self.state.persist(&records).await;
        let latest = match (request.mode, anchor.as_deref()) {
            (DiscoveryMode::HistoricalBackfill, Some(_)) => None,
            _ => newest.as_deref(),
        };
        self.state
            .advance(account, latest, report.inserted)
            .await
            .with_context(|| format!("Failed to advance crawl state for {account}"))?;

        info!(
            account = %account,
            task_id = %request.task_id,
            found = records.len(),
            inserted = report.inserted,
            succeeded = report.succeeded,
            needs_escalation = report.needs_escalation,
            failed = report.failed,
            duplicates = report.duplicates,
            "Crawl complete"
        );
        self.publish(
            ProgressEvent::new(&request.task_id, "done")
                .with("inserted", report.inserted)
                .with("succeeded", report.succeeded)
                .with("needs_escalation", report.needs_escalation)
                .with("failed", report.failed),
        );

        report.records = records;
        Ok(report)
    }

    /// Re-read engagement counts of stored posts. Values only ever go up.
    ///
    /// # Errors
    ///
    /// Returns an error if no page can be opened.
    pub async fn refresh_metrics(&self, urls: &[String]) -> Result<RefreshReport> {
        let extractor = HybridExtractor::new(self.extractor_settings.clone())?;
        let extractor = &extractor;

        let outcomes: Vec<Result<Refresh>> = stream::iter(urls)
            .map(|url| async move {
                let Some(link) = platform::parse_post_link(url, "") else {
                    warn!(url = %url, "Not a post URL, skipping refresh");
                    return Ok::<_, anyhow::Error>(Refresh::Unknown);
                };
                let lease = self.metrics_pool.acquire().await?;
                let extracted = extractor
                    .extract(lease.page(), url, &link.username, ExtractMode::MetricsOnly)
                    .await;
                lease.release().await;

                let pool = self.state.database().pool();
                match extracted {
                    Ok(extraction) if !extraction.metrics.is_empty() => {
                        match db::upsert_metrics(pool, &link.post_id(), &extraction.metrics).await {
                            Ok(true) => {
                                let source = extraction.metrics_source.map(|s| s.as_str());
                                self.log(url, "refresh", ProcessingStatus::Success, json!({ "source": source }))
                                    .await;
                                Ok(Refresh::Stored)
                            }
                            Ok(false) => {
                                debug!(url = %url, "Refreshed post is not stored");
                                Ok(Refresh::Unknown)
                            }
                            Err(e) => {
                                warn!(url = %url, error = %e, "Failed to store refreshed metrics");
                                Ok(Refresh::Failed)
                            }
                        }
                    }
                    Ok(_) => {
                        self.log(url, "refresh", ProcessingStatus::Failed, json!({ "error": "no metrics" }))
                            .await;
                        Ok(Refresh::Failed)
                    }
                    Err(e) => {
                        debug!(url = %url, error = %e, "Refresh extraction failed");
                        self.log(
                            url,
                            "refresh",
                            ProcessingStatus::Failed,
                            json!({ "error": e.to_string(), "kind": e.kind() }),
                        )
                        .await;
                        Ok(Refresh::Failed)
                    }
                }
            })
            .buffer_unordered(self.metrics_concurrency)
            .collect()
            .await;

        self.driver.shutdown().await;

        let mut report = RefreshReport::default();
        for outcome in outcomes {
            match outcome? {
                Refresh::Stored => report.refreshed += 1,
                Refresh::Unknown => report.unknown += 1,
                Refresh::Failed => report.failed += 1,
            }
        }
        info!(
            urls = urls.len(),
            refreshed = report.refreshed,
            unknown = report.unknown,
            failed = report.failed,
            "Metrics refresh complete"
        );
        Ok(report)
    }

    /// Pop up to `limit` posts from the vision queue and read their counts
    /// from a screenshot. Does nothing when the vision tier is disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be read or no page can be opened.
    pub async fn drain_vision_queue(&self, limit: usize) -> Result<VisionReport> {
        let mut report = VisionReport::default();
        let Some(ref vision) = self.vision else {
            return Ok(report);
        };

        while report.processed < limit {
            let Some(payload) = self.cache.pop(VISION_QUEUE).await? else {
                break;
            };
            let job: VisionJob = match serde_json::from_str(&payload) {
                Ok(job) => job,
                Err(e) => {
                    warn!(error = %e, "Discarding unreadable vision job");
                    continue;
                }
            };
            report.processed += 1;

            match self.read_with_vision(vision, &job).await? {
                Ok(filled) => {
                    if filled {
                        report.filled += 1;
                    }
                    self.log(
                        &job.url,
                        "vision",
                        ProcessingStatus::Success,
                        json!({ "filled": filled, "missing": job.missing }),
                    )
                    .await;
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(url = %job.url, error = %e, "Vision tier failed");
                    self.log(
                        &job.url,
                        "vision",
                        ProcessingStatus::Failed,
                        json!({ "error": e.to_string(), "kind": e.kind() }),
                    )
                    .await;
                }
            }
        }

        if report.processed > 0 {
            info!(
                processed = report.processed,
                filled = report.filled,
                failed = report.failed,
                "Vision queue drained"
            );
            self.driver.shutdown().await;
        }
        Ok(report)
    }

    /// Outer error: no page could be opened. Inner error: this job failed.
    async fn read_with_vision(
        &self,
        vision: &VisionClient,
        job: &VisionJob,
    ) -> Result<Result<bool, FetchError>> {
        let lease = self.metrics_pool.acquire().await?;
        let shot = match tokio::time::timeout(self.page_timeout, lease.page().goto(&job.url)).await {
            Ok(Ok(())) => lease
                .page()
                .screenshot()
                .await
                .map_err(|e| FetchError::Transient(format!("screenshot failed: {e:#}"))),
            Ok(Err(e)) => Err(FetchError::Transient(format!("navigation failed: {e:#}"))),
            Err(_) => Err(FetchError::Transient("navigation timed out".to_string())),
        };
        lease.release().await;

        let png = match shot {
            Ok(png) => png,
            Err(e) => return Ok(Err(e)),
        };
        let metrics = match vision.read_metrics(&png).await {
            Ok(metrics) => metrics,
            Err(e) => return Ok(Err(e)),
        };
        let stored = match db::upsert_metrics(self.state.database().pool(), &job.post_id, &metrics).await {
            Ok(stored) => stored,
            Err(e) => return Ok(Err(FetchError::Store(format!("{e:#}")))),
        };
        // Filled only when a count the job was missing is now known.
        let recovered = job.missing.iter().any(|m| metrics.known(*m).is_some());
        if stored && !recovered {
            debug!(url = %job.url, "Vision reply had none of the missing counts");
        }
        Ok(Ok(stored && recovered))
    }

    /// Run the hybrid extractor on one post and merge the result. `Ok(false)`
    /// when the post itself failed; an error means no page could be opened.
    async fn extract_detail(
        &self,
        extractor: &HybridExtractor,
        record: &mut PostRecord,
        account: &str,
    ) -> Result<bool> {
        let lease = self.detail_pool.acquire().await?;
        let extracted = extractor
            .extract(lease.page(), &record.url, account, ExtractMode::Full)
            .await;
        lease.release().await;

        match extracted {
            Ok(extraction) => {
                extraction.apply_to(record);
                self.log(
                    &record.url,
                    "extract",
                    ProcessingStatus::Success,
                    json!({
                        "account": account,
                        "source": extraction.metrics_source.map(|s| s.as_str()),
                        "page": extraction.page_kind.as_str(),
                    }),
                )
                .await;
                Ok(true)
            }
            Err(e) => {
                warn!(url = %record.url, account = %account, error = %e, "Post extraction failed");
                record.processing_stage = "extract_failed".to_string();
                self.log(
                    &record.url,
                    "extract",
                    ProcessingStatus::Failed,
                    json!({ "account": account, "error": e.to_string(), "kind": e.kind() }),
                )
                .await;
                Ok(false)
            }
        }
    }

    /// Fill views through the reader tiers.
    async fn escalate_views(&self, records: &mut [PostRecord]) {
        let urls: Vec<String> = records
            .iter()
            .filter(|r| r.metrics.known(Metric::Views).is_none())
            .map(|r| r.url.clone())
            .collect();
        if urls.is_empty() {
            return;
        }

        for result in self.views.run_batch(&urls).await {
            let Some(record) = records.iter_mut().find(|r| r.url == result.url) else {
                continue;
            };
            let tiers: Vec<&str> = result.attempted().iter().map(|t| t.as_str()).collect();
            let error = result.last_error().map(ToString::to_string);
            match (result.value, result.tier) {
                (Some(views), Some(tier)) => {
                    record.metrics.views = db::fill_value(record.metrics.views, Some(views));
                    record.views_fetched_at = Some(Utc::now());
                    let status = if tier.number() > 1 {
                        ProcessingStatus::Escalated
                    } else {
                        ProcessingStatus::Success
                    };
                    self.log(&record.url, "views", status, json!({ "tier": tier.number(), "views": views }))
                        .await;
                }
                _ => {
                    debug!(url = %record.url, error = ?error, "No view count from any tier");
                    self.log(
                        &record.url,
                        "views",
                        ProcessingStatus::Failed,
                        json!({ "attempted": tiers, "error": error }),
                    )
                    .await;
                }
            }
        }
    }

    /// Use reader document text for posts whose caption the browser missed.
    async fn fill_missing_content(&self, records: &mut [PostRecord]) {
        let urls: Vec<String> = records
            .iter()
            .filter(|r| r.content.trim().is_empty())
            .map(|r| r.url.clone())
            .collect();
        if urls.is_empty() {
            return;
        }

        for result in self.documents.run_batch(&urls).await {
            let Some(body) = result.value else {
                continue;
            };
            if let Some(record) = records.iter_mut().find(|r| r.url == result.url) {
                debug!(url = %record.url, tier = ?result.tier.map(|t| t.as_str()), "Content from reader document");
                record.content = body;
            }
        }
    }

    async fn queue_for_vision(&self, record: &PostRecord) {
        let job = VisionJob {
            post_id: record.post_id.clone(),
            account: record.account.clone(),
            url: record.url.clone(),
            missing: record.metrics.missing(&Metric::ENGAGEMENT),
        };
        let pushed = match serde_json::to_string(&job) {
            Ok(payload) => self.cache.push(VISION_QUEUE, &payload).await,
            Err(e) => Err(e.into()),
        };
        match pushed {
            Ok(()) => {
                self.log(
                    &record.url,
                    "vision_queue",
                    ProcessingStatus::Escalated,
                    json!({ "missing": job.missing }),
                )
                .await;
            }
            Err(e) => warn!(url = %record.url, error = %e, "Failed to queue post for vision"),
        }
    }

    async fn jitter_pause(&self) {
        if self.pause.is_zero() {
            return;
        }
        let millis = u64::try_from(self.pause.as_millis()).unwrap_or(u64::MAX);
        let wait = rand::thread_rng().gen_range(millis / 2..=millis);
        tokio::time::sleep(Duration::from_millis(wait)).await;
    }

    fn publish(&self, event: ProgressEvent) {
        self.progress.publish(event);
    }

    /// Processing-log write; failures are logged and swallowed.
    async fn log(&self, url: &str, stage: &str, status: ProcessingStatus, metadata: serde_json::Value) {
        if let Err(e) =
            db::log_processing(self.state.database().pool(), url, stage, status, Some(&metadata)).await
        {
            warn!(url = %url, stage = %stage, error = %e, "Failed to write processing log");
        }
    }
}
