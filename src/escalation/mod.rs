//! Tiered retrieval escalation.
//!
//! A fetch is attempted through fixed tiers of increasing cost until one
//! succeeds. Each attempt reports its tier and error explicitly; there is no
//! retry-by-exception.

mod fetchers;
pub mod reader;

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::error::FetchError;

pub use fetchers::{DocumentFetcher, ViewsFetcher};
pub use reader::{ReaderClient, ReaderTiers, ReturnFormat};

/// One retrieval strategy, ordered by increasing cost and reliability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    /// Self-hosted reader, cache allowed.
    LocalCached,
    /// Self-hosted reader, cache bypassed.
    LocalFresh,
    /// Authoritative remote reader.
    Remote,
    /// Remote reader again after a cooldown.
    RemoteRetry,
}

impl Tier {
    pub const ALL: [Self; 4] = [
        Self::LocalCached,
        Self::LocalFresh,
        Self::Remote,
        Self::RemoteRetry,
    ];

    /// 1-based position in the tier order.
    #[must_use]
    pub fn number(&self) -> u8 {
        match self {
            Self::LocalCached => 1,
            Self::LocalFresh => 2,
            Self::Remote => 3,
            Self::RemoteRetry => 4,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalCached => "local_cached",
            Self::LocalFresh => "local_fresh",
            Self::Remote => "remote",
            Self::RemoteRetry => "remote_retry",
        }
    }
}

/// A fetch-and-parse operation that can run at any tier.
#[async_trait]
pub trait TierFetcher: Send + Sync {
    type Output: Send;

    /// `Ok` only for a non-empty, parseable payload with the required field.
    async fn fetch(&self, url: &str, tier: Tier) -> Result<Self::Output, FetchError>;
}

/// Outcome of escalating one item: the first success and the tier that
/// produced it, plus every failed attempt before it.
#[derive(Debug)]
pub struct TierResult<T> {
    pub url: String,
    pub value: Option<T>,
    pub tier: Option<Tier>,
    pub failures: Vec<(Tier, FetchError)>,
}

impl<T> TierResult<T> {
    fn pending(url: &str) -> Self {
        Self {
            url: url.to_string(),
            value: None,
            tier: None,
            failures: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.value.is_some()
    }

    /// Tiers attempted so far, in order.
    #[must_use]
    pub fn attempted(&self) -> Vec<Tier> {
        self.failures
            .iter()
            .map(|(tier, _)| *tier)
            .chain(self.tier)
            .collect()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&FetchError> {
        self.failures.last().map(|(_, e)| e)
    }

    fn can_escalate(&self) -> bool {
        self.value.is_none() && self.last_error().is_none_or(FetchError::is_escalatable)
    }
}

#[derive(Debug, Clone)]
pub struct EscalationSettings {
    /// Parallel tier-1 fetches across a batch.
    pub tier1_concurrency: usize,
    /// Wait before the final remote retry.
    pub remote_cooldown: Duration,
}

impl Default for EscalationSettings {
    fn default() -> Self {
        Self {
            tier1_concurrency: 6,
            remote_cooldown: Duration::from_secs(5),
        }
    }
}

pub struct EscalationPipeline<F> {
    fetcher: F,
    settings: EscalationSettings,
}

impl<F: TierFetcher> EscalationPipeline<F> {
    pub fn new(fetcher: F, settings: EscalationSettings) -> Self {
        Self { fetcher, settings }
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Escalate one item through every tier.
    pub async fn run(&self, url: &str) -> TierResult<F::Output> {
        let mut result = TierResult::pending(url);
        self.escalate(&mut result, &Tier::ALL).await;
        result
    }

    /// Escalate a batch. Tier 1 runs with bounded parallelism over the whole
    /// batch; only its failures go on to the later tiers, one item at a time.
    /// Output order matches input order.
    pub async fn run_batch(&self, urls: &[String]) -> Vec<TierResult<F::Output>> {
        let parallel = self.settings.tier1_concurrency.max(1);
        let mut results: Vec<TierResult<F::Output>> = stream::iter(urls)
            .map(|url| async move {
                let mut result = TierResult::pending(url);
                self.escalate(&mut result, &Tier::ALL[..1]).await;
                result
            })
            .buffered(parallel)
            .collect()
            .await;

        let remaining = results.iter().filter(|r| r.can_escalate()).count();
        if remaining > 0 {
            info!(
                batch = urls.len(),
                escalating = remaining,
                "Escalating tier-1 failures"
            );
        }
        for result in results.iter_mut().filter(|r| r.can_escalate()) {
            self.escalate(result, &Tier::ALL[1..]).await;
        }
        results
    }

    async fn escalate(&self, result: &mut TierResult<F::Output>, tiers: &[Tier]) {
        for &tier in tiers {
            if tier == Tier::RemoteRetry && !self.settings.remote_cooldown.is_zero() {
                tokio::time::sleep(self.settings.remote_cooldown).await;
            }
            match self.fetcher.fetch(&result.url, tier).await {
                Ok(value) => {
                    debug!(url = %result.url, tier = tier.as_str(), "Tier succeeded");
                    result.value = Some(value);
                    result.tier = Some(tier);
                    return;
                }
                Err(e) => {
                    debug!(url = %result.url, tier = tier.as_str(), error = %e, "Tier failed");
                    let stop = !e.is_escalatable();
                    result.failures.push((tier, e));
                    if stop {
                        return;
                    }
                }
            }
        }
        if tiers.last() == Some(&Tier::RemoteRetry) {
            warn!(url = %result.url, attempts = result.failures.len(), "All tiers exhausted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Succeeds at a given tier per URL, records every call.
    struct Scripted {
        succeed_at: HashMap<String, Tier>,
        calls: Mutex<Vec<(String, Tier)>>,
    }

    impl Scripted {
        fn new(pairs: &[(&str, Option<Tier>)]) -> Self {
            Self {
                succeed_at: pairs
                    .iter()
                    .filter_map(|(u, t)| t.map(|t| ((*u).to_string(), t)))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls_for(&self, url: &str) -> Vec<Tier> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(u, _)| u == url)
                .map(|(_, t)| *t)
                .collect()
        }
    }

    #[async_trait]
    impl TierFetcher for Scripted {
        type Output = String;

        async fn fetch(&self, url: &str, tier: Tier) -> Result<String, FetchError> {
            self.calls.lock().unwrap().push((url.to_string(), tier));
            match self.succeed_at.get(url) {
                Some(t) if *t == tier => Ok(format!("{url}@{}", tier.number())),
                _ => Err(FetchError::ParseMiss("no field".to_string())),
            }
        }
    }

    fn settings() -> EscalationSettings {
        EscalationSettings {
            tier1_concurrency: 3,
            remote_cooldown: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_tier_three_success_attempts_each_earlier_tier_once() {
        let pipeline = EscalationPipeline::new(Scripted::new(&[("u", Some(Tier::Remote))]), settings());
        let result = pipeline.run("u").await;

        assert_eq!(result.tier, Some(Tier::Remote));
        assert_eq!(result.value.as_deref(), Some("u@3"));
        assert_eq!(
            pipeline.fetcher().calls_for("u"),
            vec![Tier::LocalCached, Tier::LocalFresh, Tier::Remote]
        );
    }

    #[tokio::test]
    async fn test_exhaustion_reports_all_failures() {
        let pipeline = EscalationPipeline::new(Scripted::new(&[("u", None)]), settings());
        let result = pipeline.run("u").await;

        assert!(!result.is_success());
        assert_eq!(result.attempted(), Tier::ALL.to_vec());
        assert!(matches!(result.last_error(), Some(FetchError::ParseMiss(_))));
    }

    #[tokio::test]
    async fn test_batch_escalates_only_tier_one_failures_in_order() {
        let pipeline = EscalationPipeline::new(
            Scripted::new(&[
                ("a", Some(Tier::LocalCached)),
                ("b", Some(Tier::RemoteRetry)),
                ("c", Some(Tier::LocalCached)),
                ("d", Some(Tier::LocalFresh)),
            ]),
            settings(),
        );
        let urls: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| (*s).to_string()).collect();
        let results = pipeline.run_batch(&urls).await;

        let order: Vec<&str> = results.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
        let tiers: Vec<Option<Tier>> = results.iter().map(|r| r.tier).collect();
        assert_eq!(
            tiers,
            vec![
                Some(Tier::LocalCached),
                Some(Tier::RemoteRetry),
                Some(Tier::LocalCached),
                Some(Tier::LocalFresh),
            ]
        );
        assert_eq!(pipeline.fetcher().calls_for("a"), vec![Tier::LocalCached]);
        assert_eq!(pipeline.fetcher().calls_for("b").len(), 4);
    }

    struct Broken;

    #[async_trait]
    impl TierFetcher for Broken {
        type Output = ();

        async fn fetch(&self, _url: &str, _tier: Tier) -> Result<(), FetchError> {
            Err(FetchError::Store("disk full".to_string()))
        }
    }

    #[tokio::test]
    async fn test_non_escalatable_error_stops() {
        let pipeline = EscalationPipeline::new(Broken, settings());
        let result = pipeline.run("u").await;
        assert_eq!(result.attempted(), vec![Tier::LocalCached]);

        let batch = pipeline.run_batch(&["x".to_string()]).await;
        assert_eq!(batch[0].attempted(), vec![Tier::LocalCached]);
    }
}
