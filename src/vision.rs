//! Last-resort metrics reading from a screenshot via a vision model.
//!
//! Speaks the OpenAI-compatible chat completions protocol with a fixed
//! prompt and a JSON-only reply contract.

use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::Config;
use crate::db::{Metric, Metrics};
use crate::error::FetchError;
use crate::normalize;

const VISION_PROMPT: &str = "You read engagement counts from a screenshot of a single social media post. \
Return only a JSON object with the integer fields likes, comments, reposts, shares and views. \
Expand abbreviations such as 3.9K or 1.2萬 into plain integers. \
Use null for any count that is not visible. Do not add any other text.";

/// Queue payload for a post waiting on the vision tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisionJob {
    pub post_id: String,
    pub account: String,
    pub url: String,
    pub missing: Vec<Metric>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

pub struct VisionClient {
    http: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    model: String,
}

impl VisionClient {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        api_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build vision HTTP client")?;
        Ok(Self {
            http,
            api_url: api_url.into(),
            api_key,
            model: model.into(),
        })
    }

    /// Client for the configured endpoint, or `None` when the tier is disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        if !config.vision_enabled {
            return Ok(None);
        }
        Self::new(
            config.vision_api_url.clone(),
            config.vision_api_key.clone(),
            config.vision_model.clone(),
            config.page_timeout * 2,
        )
        .map(Some)
    }

    /// Ask the model for the counts visible in `png`.
    ///
    /// # Errors
    ///
    /// `Transient` for HTTP failures, `ParseMiss` when the reply is not the
    /// expected JSON.
    pub async fn read_metrics(&self, png: &[u8]) -> Result<Metrics, FetchError> {
        let image = base64::engine::general_purpose::STANDARD.encode(png);
        let request = json!({
            "model": self.model,
            "temperature": 0,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": VISION_PROMPT },
                { "role": "user", "content": [
                    { "type": "text", "text": "Read the counts on this post." },
                    { "type": "image_url", "image_url": { "url": format!("data:image/png;base64,{image}") } }
                ] }
            ]
        });

        let mut builder = self.http.post(&self.api_url).json(&request);
        if let Some(ref key) = self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Transient(format!("vision API returned HTTP {status}")));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| FetchError::ParseMiss(format!("vision API reply is not a chat completion: {e}")))?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| FetchError::ParseMiss("vision API returned no content".to_string()))?;

        debug!(bytes = png.len(), reply = %content, "Vision reply");
        parse_vision_reply(&content)
    }
}

fn reply_count(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().filter(|v| *v >= 0),
        Value::String(s) => normalize::parse_count(s),
        _ => None,
    }
}

/// Parse the model's JSON reply. Code fences are tolerated; anything that is
/// not a readable count becomes unknown.
///
/// # Errors
///
/// `ParseMiss` when the reply is not a JSON object or carries no counts.
pub fn parse_vision_reply(content: &str) -> Result<Metrics, FetchError> {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| FetchError::ParseMiss(format!("vision reply is not JSON: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| FetchError::ParseMiss("vision reply is not an object".to_string()))?;

    let mut metrics = Metrics::default();
    for metric in Metric::ALL {
        let count = object.get(metric.as_str()).and_then(reply_count);
        *metrics.slot(metric) = match metric {
            Metric::Views => count.filter(|v| normalize::is_sane_views(*v)),
            _ => count,
        };
    }

    if metrics.is_empty() {
        return Err(FetchError::ParseMiss("vision reply has no counts".to_string()));
    }
    Ok(metrics)
}
