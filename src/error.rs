//! Failure taxonomy for per-unit fetch and extraction work.
//!
//! These errors stay local to the smallest unit of work (one tier attempt, one
//! post, one scroll round). Crawl-wide failures use `anyhow` instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    /// Network error or timeout; a later tier may succeed.
    #[error("transient fetch failure: {0}")]
    Transient(String),
    /// Payload arrived but the expected field was absent or invalid.
    #[error("parse miss: {0}")]
    ParseMiss(String),
    /// Gate page, login wall, or empty body.
    #[error("page anomaly: {0}")]
    PageAnomaly(String),
    /// Cache or database write failed.
    #[error("store failure: {0}")]
    Store(String),
    /// Scroll-round ceiling or tier list exhausted.
    #[error("budget exhausted: {0}")]
    BudgetExhausted(String),
}

impl FetchError {
    /// Whether the next tier should be attempted after this failure.
    #[must_use]
    pub fn is_escalatable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::ParseMiss(_) | Self::PageAnomaly(_)
        )
    }

    /// Short label used in processing-log rows and progress events.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::ParseMiss(_) => "parse_miss",
            Self::PageAnomaly(_) => "page_anomaly",
            Self::Store(_) => "store",
            Self::BudgetExhausted(_) => "budget_exhausted",
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transient(err.to_string())
    }
}
