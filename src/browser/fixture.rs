//! Scripted in-memory browser.
//!
//! Serves canned pages, feeds and network responses keyed by URL. Used by the
//! test suites and handy for dry runs without a Chromium install.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{BrowserDriver, MediaCandidate, ObservedResponse, PageSession};

/// An infinitely scrolling list of post links.
#[derive(Debug, Clone)]
pub struct FeedScript {
    /// Every link the feed will ever render, newest first.
    pub links: Vec<String>,
    /// Links rendered before any scrolling.
    pub initial: usize,
    /// Links added per loaded batch.
    pub per_batch: usize,
    /// Downward scrolls needed to load one batch.
    pub scrolls_per_batch: usize,
    /// Zero-based link reads that fail.
    pub failing_reads: HashSet<usize>,
}

impl FeedScript {
    #[must_use]
    pub fn new(links: Vec<String>, initial: usize, per_batch: usize) -> Self {
        Self {
            links,
            initial,
            per_batch,
            scrolls_per_batch: 1,
            failing_reads: HashSet::new(),
        }
    }

    #[must_use]
    pub fn with_scrolls_per_batch(mut self, scrolls: usize) -> Self {
        self.scrolls_per_batch = scrolls.max(1);
        self
    }

    #[must_use]
    pub fn with_failing_read(mut self, read: usize) -> Self {
        self.failing_reads.insert(read);
        self
    }

    fn rendered(&self, down_scrolls: usize) -> usize {
        let batches = down_scrolls / self.scrolls_per_batch;
        (self.initial + batches * self.per_batch).min(self.links.len())
    }
}

/// What a URL serves.
#[derive(Debug, Clone, Default)]
pub struct PageScript {
    pub html: String,
    pub responses: Vec<ObservedResponse>,
    pub media: Vec<MediaCandidate>,
    pub feed: Option<FeedScript>,
    pub cookies: String,
    /// Extra latency added to navigation.
    pub load_delay: Duration,
    /// Latency of every read after navigation.
    pub read_delay: Duration,
}

impl PageScript {
    #[must_use]
    pub fn html(html: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn feed(feed: FeedScript) -> Self {
        Self {
            html: "<html><body></body></html>".to_string(),
            feed: Some(feed),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_response(mut self, response: ObservedResponse) -> Self {
        self.responses.push(response);
        self
    }

    #[must_use]
    pub fn with_media(mut self, media: Vec<MediaCandidate>) -> Self {
        self.media = media;
        self
    }

    #[must_use]
    pub fn with_cookies(mut self, cookies: impl Into<String>) -> Self {
        self.cookies = cookies.into();
        self
    }

    #[must_use]
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    #[must_use]
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }
}

#[derive(Debug, Default)]
struct SiteState {
    pages: Mutex<HashMap<String, PageScript>>,
    visits: Mutex<HashMap<String, usize>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    open_now: AtomicUsize,
    max_open: AtomicUsize,
    scrolls: AtomicUsize,
}

/// Scripted [`BrowserDriver`].
#[derive(Debug, Clone, Default)]
pub struct FixtureBrowser {
    state: Arc<SiteState>,
}

impl FixtureBrowser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_page(self, url: impl Into<String>, script: PageScript) -> Self {
        self.set_page(url, script);
        self
    }

    /// Install or replace the script for `url`.
    pub fn set_page(&self, url: impl Into<String>, script: PageScript) {
        lock(&self.state.pages).insert(url.into(), script);
    }

    /// Navigations to `url` so far.
    #[must_use]
    pub fn visits(&self, url: &str) -> usize {
        lock(&self.state.visits).get(url).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn total_visits(&self) -> usize {
        lock(&self.state.visits).values().sum()
    }

    #[must_use]
    pub fn pages_opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn pages_closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn open_pages(&self) -> usize {
        self.state.open_now.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open pages.
    #[must_use]
    pub fn max_open_pages(&self) -> usize {
        self.state.max_open.load(Ordering::SeqCst)
    }

    /// Total scroll actions across all pages.
    #[must_use]
    pub fn scrolls(&self) -> usize {
        self.state.scrolls.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl BrowserDriver for FixtureBrowser {
    async fn open_page(&self) -> Result<Box<dyn PageSession>> {
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        let now = self.state.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_open.fetch_max(now, Ordering::SeqCst);
        Ok(Box::new(FixturePage {
            state: Arc::clone(&self.state),
            current: Mutex::new(None),
            observers: Mutex::new(Vec::new()),
            down_scrolls: AtomicUsize::new(0),
            link_reads: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct FixturePage {
    state: Arc<SiteState>,
    current: Mutex<Option<PageScript>>,
    observers: Mutex<Vec<mpsc::UnboundedSender<ObservedResponse>>>,
    down_scrolls: AtomicUsize,
    link_reads: AtomicUsize,
    closed: AtomicBool,
}

impl FixturePage {
    fn current(&self) -> Option<PageScript> {
        lock(&self.current).clone()
    }

    async fn read_latency(&self) {
        let delay = self.current().map_or(Duration::ZERO, |script| script.read_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl PageSession for FixturePage {
    async fn goto(&self, url: &str) -> Result<()> {
        *lock(&self.state.visits).entry(url.to_string()).or_default() += 1;
        let Some(script) = lock(&self.state.pages).get(url).cloned() else {
            bail!("net::ERR_NAME_NOT_RESOLVED at {url}");
        };
        if !script.load_delay.is_zero() {
            tokio::time::sleep(script.load_delay).await;
        }

        self.down_scrolls.store(0, Ordering::SeqCst);
        self.link_reads.store(0, Ordering::SeqCst);
        {
            let mut observers = lock(&self.observers);
            observers.retain(|tx| !tx.is_closed());
            for response in &script.responses {
                for tx in observers.iter() {
                    let _ = tx.send(response.clone());
                }
            }
        }
        *lock(&self.current) = Some(script);
        Ok(())
    }

    async fn content(&self) -> Result<String> {
        self.read_latency().await;
        Ok(self
            .current()
            .map(|script| script.html)
            .unwrap_or_else(|| "<html><head></head><body></body></html>".to_string()))
    }

    async fn evaluate(&self, _script: &str) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    async fn observe_network(&self) -> Result<mpsc::UnboundedReceiver<ObservedResponse>> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.observers).push(tx);
        Ok(rx)
    }

    async fn cookie_header(&self) -> Result<String> {
        self.read_latency().await;
        Ok(self.current().map(|script| script.cookies).unwrap_or_default())
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        Ok(b"\x89PNG\r\n\x1a\nfixture".to_vec())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            lock(&self.observers).clear();
            self.state.closed.fetch_add(1, Ordering::SeqCst);
            self.state.open_now.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn scroll_by(&self, dy: i64) -> Result<()> {
        self.state.scrolls.fetch_add(1, Ordering::SeqCst);
        if dy > 0 {
            self.down_scrolls.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn post_links(&self) -> Result<Vec<String>> {
        let read = self.link_reads.fetch_add(1, Ordering::SeqCst);
        let Some(feed) = self.current().and_then(|script| script.feed) else {
            return Ok(Vec::new());
        };
        if feed.failing_reads.contains(&read) {
            bail!("Execution context was destroyed");
        }
        let rendered = feed.rendered(self.down_scrolls.load(Ordering::SeqCst));
        Ok(feed.links[..rendered].to_vec())
    }

    async fn media_candidates(&self) -> Result<Vec<MediaCandidate>> {
        self.read_latency().await;
        Ok(self.current().map(|script| script.media).unwrap_or_default())
    }
}
