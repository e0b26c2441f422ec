//! Same-session replay of a captured counts request.
//!
//! When the live page never re-issues the counts call inside the observation
//! window, the headers and body of an earlier capture are sent again as a
//! plain HTTP request with the current page's cookies.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE, USER_AGENT};
use reqwest::Method;
use tokio::sync::RwLock;
use tracing::debug;

use crate::browser::ObservedResponse;
use crate::constants::{BROWSER_USER_AGENT, QUERY_NAME_HEADER};
use crate::error::FetchError;

/// Headers the HTTP client must compute itself.
const SKIPPED_HEADERS: &[&str] = &[
    "content-length",
    "host",
    "cookie",
    "connection",
    "accept-encoding",
];

/// Headers and body of an intercepted counts call. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    /// Shortcode of the post the capture was made for, when known.
    pub shortcode: Option<String>,
}

impl CapturedRequest {
    #[must_use]
    pub fn from_observed(response: &ObservedResponse, shortcode: Option<String>) -> Self {
        let mut headers: Vec<(String, String)> = response
            .request_headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        headers.sort();
        Self {
            url: response.url.clone(),
            method: if response.request_method.is_empty() {
                "POST".to_string()
            } else {
                response.request_method.clone()
            },
            headers,
            body: response.request_body.clone(),
            shortcode,
        }
    }

    #[must_use]
    pub fn query_name(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == QUERY_NAME_HEADER)
            .map(|(_, v)| v.as_str())
    }

    /// Body retargeted at another post. `None` when the capture cannot be
    /// pointed at `shortcode`: its own post is unknown or absent from the body.
    #[must_use]
    pub fn body_for(&self, shortcode: &str) -> Option<String> {
        let body = self.body.as_ref()?;
        let old = self.shortcode.as_deref().filter(|old| !old.is_empty())?;
        body.contains(old).then(|| body.replace(old, shortcode))
    }
}

/// Most recent capture of the current crawl session.
#[derive(Debug, Default)]
pub struct ReplayCache {
    latest: RwLock<Option<CapturedRequest>>,
}

impl ReplayCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn remember(&self, request: CapturedRequest) {
        debug!(url = %request.url, query = ?request.query_name(), "Captured counts request");
        *self.latest.write().await = Some(request);
    }

    pub async fn latest(&self) -> Option<CapturedRequest> {
        self.latest.read().await.clone()
    }
}

/// Reissues captured requests over plain HTTP.
#[derive(Debug, Clone)]
pub struct RequestReplayer {
    client: reqwest::Client,
}

impl RequestReplayer {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .build()
            .context("Failed to build replay HTTP client")?;
        Ok(Self { client })
    }

    /// Send `captured` for `shortcode` and return the response body.
    ///
    /// # Errors
    ///
    /// `Transient` on network errors or non-success status.
    pub async fn replay(
        &self,
        captured: &CapturedRequest,
        shortcode: &str,
        cookie_header: &str,
    ) -> Result<String, FetchError> {
        let method = Method::from_bytes(captured.method.as_bytes())
            .map_err(|e| FetchError::ParseMiss(format!("bad captured method: {e}")))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &captured.headers {
            if name.starts_with(':') || SKIPPED_HEADERS.contains(&name.as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
        if !headers.contains_key(USER_AGENT) {
            headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        }
        if !cookie_header.is_empty() {
            if let Ok(value) = HeaderValue::from_str(cookie_header) {
                headers.insert(COOKIE, value);
            }
        }

        let body = captured.body_for(shortcode).ok_or_else(|| {
            FetchError::ParseMiss("captured request cannot be retargeted".to_string())
        })?;

        let response = self
            .client
            .request(method, &captured.url)
            .headers(headers)
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Transient(format!("replay returned HTTP {status}")));
        }
        Ok(response.text().await?)
    }
}
