//! Headless browser control surface.
//!
//! The crawl core only needs a handful of capabilities (navigate, read the DOM,
//! scroll, observe network responses, read cookies, screenshot, close). They
//! are expressed as the [`BrowserDriver`] / [`PageSession`] traits so the core
//! does not depend on a particular automation product.

pub mod chromium;
pub mod fixture;
mod pool;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use chromium::ChromiumDriver;
pub use pool::{PageLease, PagePool};

/// Default viewport width in pixels.
pub const DEFAULT_VIEWPORT_WIDTH: u32 = 1280;

/// Default viewport height in pixels.
pub const DEFAULT_VIEWPORT_HEIGHT: u32 = 1600;

/// Default page load timeout in seconds.
pub const DEFAULT_PAGE_TIMEOUT_SECS: u64 = 30;

/// Post permalinks currently rendered, in document order.
const LINKS_SCRIPT: &str = r#"
    Array.from(document.querySelectorAll('a[href*="/post/"]')).map(a => a.href)
"#;

/// Rendered images and videos with their on-screen size.
const MEDIA_SCRIPT: &str = r"
    (() => {
        const out = [];
        const size = el => {
            const r = el.getBoundingClientRect();
            return [Math.round(r.width), Math.round(r.height)];
        };
        document.querySelectorAll('img').forEach(img => {
            const [width, height] = size(img);
            const src = img.currentSrc || img.src;
            if (src) out.push({ kind: 'image', src, width, height });
        });
        document.querySelectorAll('video').forEach(v => {
            const [width, height] = size(v);
            const src = v.currentSrc || v.src;
            if (src) out.push({ kind: 'video', src, width, height });
            v.querySelectorAll('source').forEach(s => {
                if (s.src) out.push({ kind: 'video', src: s.src, width, height });
            });
            if (v.poster) out.push({ kind: 'poster', src: v.poster, width, height });
        });
        return out;
    })()
";

/// Browser launch configuration.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// Viewport width in pixels.
    pub viewport_width: u32,
    /// Viewport height in pixels.
    pub viewport_height: u32,
    /// Timeout applied to every navigation.
    pub page_timeout: Duration,
    /// Path to Chrome/Chromium executable (None for auto-detection).
    pub chrome_path: Option<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            viewport_width: DEFAULT_VIEWPORT_WIDTH,
            viewport_height: DEFAULT_VIEWPORT_HEIGHT,
            page_timeout: Duration::from_secs(DEFAULT_PAGE_TIMEOUT_SECS),
            chrome_path: None,
        }
    }
}

/// A network response seen while a page was loading, joined with its request.
#[derive(Debug, Clone, Default)]
pub struct ObservedResponse {
    pub url: String,
    pub status: u16,
    pub mime_type: String,
    pub request_method: String,
    /// Request headers with lower-cased names.
    pub request_headers: HashMap<String, String>,
    pub request_body: Option<String>,
    /// Response body, only captured for API calls.
    pub body: Option<String>,
}

impl ObservedResponse {
    #[must_use]
    pub fn request_header(&self, name: &str) -> Option<&str> {
        self.request_headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Kind of a rendered media element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    /// Still frame shown before a video plays; never a playable source.
    Poster,
}

/// A media element as rendered in the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaCandidate {
    pub kind: MediaKind,
    pub src: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

/// One browser tab. A unit of work owns exactly one page for its lifetime.
#[async_trait]
pub trait PageSession: Send + Sync {
    /// Navigate and wait for the load, bounded by the page timeout.
    async fn goto(&self, url: &str) -> Result<()>;

    /// Current serialized DOM.
    async fn content(&self) -> Result<String>;

    /// Evaluate a script and return its JSON result (`Null` for `undefined`).
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value>;

    /// Start observing network responses. Must be called before [`Self::goto`].
    async fn observe_network(&self) -> Result<mpsc::UnboundedReceiver<ObservedResponse>>;

    /// Cookies of the current page as a `Cookie` header value.
    async fn cookie_header(&self) -> Result<String>;

    /// PNG screenshot of the viewport.
    async fn screenshot(&self) -> Result<Vec<u8>>;

    async fn close(&self) -> Result<()>;

    async fn scroll_by(&self, dy: i64) -> Result<()> {
        self.evaluate(&format!("window.scrollBy(0, {dy}); true"))
            .await
            .map(|_| ())
    }

    /// Post permalinks currently in the DOM, in render order.
    async fn post_links(&self) -> Result<Vec<String>> {
        let value = self.evaluate(LINKS_SCRIPT).await?;
        serde_json::from_value(value).context("Unexpected link list shape")
    }

    /// Rendered images and videos.
    async fn media_candidates(&self) -> Result<Vec<MediaCandidate>> {
        let value = self.evaluate(MEDIA_SCRIPT).await?;
        serde_json::from_value(value).context("Unexpected media list shape")
    }
}

/// Source of fresh pages.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn open_page(&self) -> Result<Box<dyn PageSession>>;

    /// Release the underlying browser, if any.
    async fn shutdown(&self) {}
}
