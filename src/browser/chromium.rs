//! Chromium-backed [`BrowserDriver`] using the DevTools protocol.
//!
//! The browser is launched lazily on the first page request and shared by
//! every page afterwards.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use chromiumoxide::browser::{Browser, BrowserConfig as LaunchConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventLoadingFinished, EventRequestWillBeSent, EventResponseReceived,
    GetResponseBodyParams,
};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use super::{BrowserConfig, BrowserDriver, ObservedResponse, PageSession};
use crate::constants::{BROWSER_USER_AGENT, QUERY_NAME_HEADER};

pub struct ChromiumDriver {
    config: BrowserConfig,
    browser: Arc<Mutex<Option<Browser>>>,
}

impl ChromiumDriver {
    #[must_use]
    pub fn new(config: BrowserConfig) -> Self {
        Self {
            config,
            browser: Arc::new(Mutex::new(None)),
        }
    }

    async fn ensure_browser(&self) -> Result<()> {
        let mut browser_guard = self.browser.lock().await;
        if browser_guard.is_some() {
            return Ok(());
        }

        info!("Launching headless browser");

        let mut config_builder = LaunchConfig::builder()
            .window_size(self.config.viewport_width, self.config.viewport_height)
            .request_timeout(self.config.page_timeout)
            .no_sandbox()
            .disable_default_args()
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-extensions")
            .arg("--disable-sync")
            .arg("--mute-audio")
            .arg("--disable-blink-features=AutomationControlled");

        if let Some(ref chrome_path) = self.config.chrome_path {
            config_builder = config_builder.chrome_executable(chrome_path);
        }

        let launch_config = config_builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(launch_config)
            .await
            .context("Failed to launch browser")?;

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler error: {e}");
                }
            }
        });

        *browser_guard = Some(browser);
        info!("Headless browser ready");

        Ok(())
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn open_page(&self) -> Result<Box<dyn PageSession>> {
        self.ensure_browser().await?;

        let browser_guard = self.browser.lock().await;
        let browser = browser_guard.as_ref().context("Browser not initialized")?;

        let page = browser
            .new_page("about:blank")
            .await
            .context("Failed to create new page")?;
        page.set_user_agent(BROWSER_USER_AGENT)
            .await
            .context("Failed to set user agent")?;

        Ok(Box::new(ChromiumPage {
            page,
            timeout: self.config.page_timeout,
        }))
    }

    async fn shutdown(&self) {
        let mut browser_guard = self.browser.lock().await;
        if let Some(mut browser) = browser_guard.take() {
            if let Err(e) = browser.close().await {
                error!("Failed to close browser: {e}");
            } else {
                info!("Browser shutdown complete");
            }
        }
    }
}

pub struct ChromiumPage {
    page: Page,
    timeout: Duration,
}

/// Request half of an observed exchange, held until its response arrives.
struct PendingRequest {
    method: String,
    headers: HashMap<String, String>,
    body: Option<String>,
}

/// API calls get their bodies captured; everything else is reported bare.
fn wants_body(response: &ObservedResponse) -> bool {
    response.request_headers.contains_key(QUERY_NAME_HEADER)
        || (response.url.contains("/graphql") && response.mime_type.contains("json"))
}

fn header_map(headers: &serde_json::Value) -> HashMap<String, String> {
    headers
        .as_object()
        .map(|object| {
            object
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .as_str()
                        .map(|v| (name.to_ascii_lowercase(), v.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl PageSession for ChromiumPage {
    async fn goto(&self, url: &str) -> Result<()> {
        tokio::time::timeout(self.timeout, self.page.goto(url))
            .await
            .with_context(|| format!("Navigation to {url} timed out"))?
            .with_context(|| format!("Navigation to {url} failed"))?;
        Ok(())
    }

    async fn content(&self) -> Result<String> {
        self.page.content().await.context("Failed to read page content")
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
        let result = self
            .page
            .evaluate(script)
            .await
            .context("Script evaluation failed")?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn observe_network(&self) -> Result<mpsc::UnboundedReceiver<ObservedResponse>> {
        self.page
            .execute(EnableParams::default())
            .await
            .context("Failed to enable network domain")?;

        let mut requests = self.page.event_listener::<EventRequestWillBeSent>().await?;
        let mut responses = self.page.event_listener::<EventResponseReceived>().await?;
        let mut finished = self.page.event_listener::<EventLoadingFinished>().await?;

        let page = self.page.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut pending_requests: HashMap<String, PendingRequest> = HashMap::new();
            let mut awaiting_body: HashMap<String, ObservedResponse> = HashMap::new();

            loop {
                tokio::select! {
                    Some(event) = requests.next() => {
                        pending_requests.insert(
                            event.request_id.inner().clone(),
                            PendingRequest {
                                method: event.request.method.clone(),
                                headers: header_map(event.request.headers.inner()),
                                body: event.request.post_data.clone(),
                            },
                        );
                    }
                    Some(event) = responses.next() => {
                        let id = event.request_id.inner().clone();
                        let request = pending_requests.remove(&id);
                        let observed = ObservedResponse {
                            url: event.response.url.clone(),
                            status: u16::try_from(event.response.status).unwrap_or(0),
                            mime_type: event.response.mime_type.clone(),
                            request_method: request.as_ref().map(|r| r.method.clone()).unwrap_or_default(),
                            request_headers: request.as_ref().map(|r| r.headers.clone()).unwrap_or_default(),
                            request_body: request.and_then(|r| r.body),
                            body: None,
                        };
                        if wants_body(&observed) {
                            awaiting_body.insert(id, observed);
                        } else if tx.send(observed).is_err() {
                            break;
                        }
                    }
                    Some(event) = finished.next() => {
                        let Some(mut observed) = awaiting_body.remove(event.request_id.inner()) else {
                            continue;
                        };
                        match page.execute(GetResponseBodyParams::new(event.request_id.clone())).await {
                            Ok(reply) => {
                                observed.body = if reply.result.base64_encoded {
                                    base64::engine::general_purpose::STANDARD
                                        .decode(&reply.result.body)
                                        .ok()
                                        .and_then(|bytes| String::from_utf8(bytes).ok())
                                } else {
                                    Some(reply.result.body.clone())
                                };
                            }
                            Err(e) => debug!(url = %observed.url, "Response body unavailable: {e}"),
                        }
                        if tx.send(observed).is_err() {
                            break;
                        }
                    }
                    else => break,
                }
            }
        });

        Ok(rx)
    }

    async fn cookie_header(&self) -> Result<String> {
        let cookies = self.page.get_cookies().await.context("Failed to read cookies")?;
        Ok(cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; "))
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        self.page
            .screenshot(ScreenshotParams::builder().full_page(false).build())
            .await
            .context("Failed to capture screenshot")
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.page.clone().close().await {
            warn!("Failed to close page: {e}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_map_lowercases_names() {
        let headers = serde_json::json!({
            "X-FB-Friendly-Name": "BarcelonaPostPageQuery",
            "Content-Length": 12,
        });
        let map = header_map(&headers);
        assert_eq!(
            map.get("x-fb-friendly-name").map(String::as_str),
            Some("BarcelonaPostPageQuery")
        );
        // non-string values are dropped
        assert!(!map.contains_key("content-length"));
    }

    #[test]
    fn test_wants_body_for_api_calls_only() {
        let mut response = ObservedResponse {
            url: "https://www.threads.net/api/graphql".to_string(),
            mime_type: "application/json".to_string(),
            ..ObservedResponse::default()
        };
        assert!(wants_body(&response));

        response.url = "https://scontent.cdninstagram.com/v/a.jpg".to_string();
        response.mime_type = "image/jpeg".to_string();
        assert!(!wants_body(&response));

        response
            .request_headers
            .insert(QUERY_NAME_HEADER.to_string(), "X".to_string());
        assert!(wants_body(&response));
    }
}
