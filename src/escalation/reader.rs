//! Client for text-extraction reader services.
//!
//! A reader takes a page URL appended to its base URL and returns the page as
//! normalized text. The same protocol is served by the self-hosted instance
//! and by the authoritative remote service.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use tracing::debug;

use super::Tier;
use crate::constants::BROWSER_USER_AGENT;
use crate::error::FetchError;

/// Response header values selecting the output shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnFormat {
    Text,
    Markdown,
}

impl ReturnFormat {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Markdown => "markdown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReaderClient {
    name: &'static str,
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl ReaderClient {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        name: &'static str,
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(BROWSER_USER_AGENT)
            .build()
            .context("Failed to build reader HTTP client")?;
        Ok(Self {
            name,
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Fetch `target` through the reader.
    ///
    /// # Errors
    ///
    /// `Transient` for network errors and non-success statuses, `ParseMiss`
    /// for an empty document.
    pub async fn read(
        &self,
        target: &str,
        format: ReturnFormat,
        bypass_cache: bool,
    ) -> Result<String, FetchError> {
        let mut request = self
            .http
            .get(format!("{}/{}", self.base_url, target))
            .header("X-Return-Format", format.as_str());
        if bypass_cache {
            request = request.header("X-No-Cache", "true");
        }
        if let Some(ref key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Transient(format!(
                "{} reader returned HTTP {status}",
                self.name
            )));
        }

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Err(FetchError::ParseMiss(format!("{} reader returned an empty document", self.name)));
        }
        debug!(reader = self.name, url = %target, bytes = text.len(), "Reader document fetched");
        Ok(text)
    }
}

/// The local and remote readers, addressed by tier.
#[derive(Debug, Clone)]
pub struct ReaderTiers {
    pub local: ReaderClient,
    pub remote: ReaderClient,
}

impl ReaderTiers {
    /// # Errors
    ///
    /// Returns an error if either HTTP client cannot be built.
    pub fn new(
        local_url: &str,
        remote_url: &str,
        remote_api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            local: ReaderClient::new("local", local_url, None, timeout)?,
            remote: ReaderClient::new("remote", remote_url, remote_api_key, timeout)?,
        })
    }

    /// Fetch through the reader that serves `tier`.
    ///
    /// # Errors
    ///
    /// See [`ReaderClient::read`].
    pub async fn read(&self, target: &str, tier: Tier, format: ReturnFormat) -> Result<String, FetchError> {
        match tier {
            Tier::LocalCached => self.local.read(target, format, false).await,
            Tier::LocalFresh => self.local.read(target, format, true).await,
            Tier::Remote | Tier::RemoteRetry => self.remote.read(target, format, false).await,
        }
    }
}
