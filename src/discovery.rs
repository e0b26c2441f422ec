//! Feed scrolling and ordered post-URL discovery.
//!
//! The controller reads the rendered permalinks of an account's profile page
//! round by round, keeping DOM order, and decides when to stop: target count
//! reached, anchor encountered, feed exhausted, or round ceiling hit.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::browser::PageSession;
use crate::platform::{self, PostLink};

/// What the caller wants from a discovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// Collect newest posts until the target count or the anchor.
    #[default]
    New,
    /// Scroll past the anchor, then collect older posts.
    HistoricalBackfill,
}

impl DiscoveryMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::HistoricalBackfill => "backfill",
        }
    }
}

/// Scroll and stop tuning.
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    /// Hard ceiling on rounds; guarantees termination.
    pub max_rounds: u32,
    /// Consecutive empty rounds before the final scroll burst.
    pub empty_round_limit: u32,
    pub base_wait: Duration,
    pub max_wait: Duration,
    /// Nominal scroll distance in pixels.
    pub scroll_step: i64,
    /// Random +/- variation applied to every scroll.
    pub jitter: i64,
    /// Every n-th round scrolls three times as far.
    pub aggressive_every: u32,
    /// Every n-th round scrolls half again as far.
    pub medium_every: u32,
    /// Fixed RNG seed for reproducible scroll patterns.
    pub seed: Option<u64>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            max_rounds: 80,
            empty_round_limit: 3,
            base_wait: Duration::from_millis(1500),
            max_wait: Duration::from_secs(6),
            scroll_step: 900,
            jitter: 150,
            aggressive_every: 7,
            medium_every: 3,
            seed: None,
        }
    }
}

/// Inputs of one discovery pass.
#[derive(Debug, Clone, Copy)]
pub struct DiscoveryRequest<'a> {
    pub account: &'a str,
    pub target: usize,
    /// Most recent previously stored post ID.
    pub anchor: Option<&'a str>,
    pub mode: DiscoveryMode,
    /// Post IDs already stored; skipped without fetching.
    pub known_ids: &'a HashSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    TargetReached,
    AnchorReached,
    Exhausted,
    RoundBudget,
}

impl StopReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TargetReached => "target_reached",
            Self::AnchorReached => "anchor_reached",
            Self::Exhausted => "exhausted",
            Self::RoundBudget => "round_budget",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryOutcome {
    /// New posts, newest first, in render order.
    pub links: Vec<PostLink>,
    pub stop: StopReason,
    pub rounds: u32,
    pub anchor_seen: bool,
}

/// Scroll distances and waits with enough variation to avoid a fixed rhythm.
pub struct ScrollPlanner {
    settings: DiscoverySettings,
    rng: StdRng,
}

impl ScrollPlanner {
    #[must_use]
    pub fn new(settings: DiscoverySettings) -> Self {
        let rng = settings
            .seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        Self { settings, rng }
    }

    /// Distance for a regular round (1-based).
    pub fn distance(&mut self, round: u32) -> i64 {
        let jitter = self.settings.jitter.max(0);
        let base = (self.settings.scroll_step + self.rng.gen_range(-jitter..=jitter)).max(100);
        if self.settings.aggressive_every > 0 && round % self.settings.aggressive_every == 0 {
            base * 3
        } else if self.settings.medium_every > 0 && round % self.settings.medium_every == 0 {
            base * 3 / 2
        } else {
            base
        }
    }

    /// Pause between productive rounds: the base wait, +/- 20%.
    pub fn pause(&mut self) -> Duration {
        if self.settings.base_wait.is_zero() {
            return Duration::ZERO;
        }
        let factor: f64 = self.rng.gen_range(0.8..1.2);
        self.settings.base_wait.mul_f64(factor).min(self.settings.max_wait)
    }

    /// Wait after the n-th consecutive empty round; grows linearly, capped.
    #[must_use]
    pub fn empty_wait(&self, consecutive_empty: u32) -> Duration {
        self.settings
            .base_wait
            .saturating_mul(consecutive_empty.saturating_add(1))
            .min(self.settings.max_wait)
    }

    /// Down, slightly up, down again.
    pub fn final_burst(&mut self) -> [i64; 3] {
        let step = self.distance(1);
        [step * 2, -(step / 3), step * 2]
    }
}

struct RoundState<'a> {
    request: &'a DiscoveryRequest<'a>,
    seen: HashSet<String>,
    links: Vec<PostLink>,
    anchor_passed: bool,
    anchor_seen: bool,
}

enum RoundOutcome {
    Progress(usize),
    TargetReached,
    AnchorReached,
}

impl<'a> RoundState<'a> {
    fn new(request: &'a DiscoveryRequest<'a>) -> Self {
        Self {
            request,
            seen: HashSet::new(),
            links: Vec::new(),
            anchor_passed: request.anchor.is_none(),
            anchor_seen: false,
        }
    }

    /// Fold one DOM read into the collection. Progress counts links not seen
    /// earlier in this session, whether or not they were kept.
    fn absorb(&mut self, hrefs: &[String], base_url: &str) -> RoundOutcome {
        let mut progressed = 0;
        for href in hrefs {
            let Some(link) = platform::parse_post_link(href, base_url) else {
                continue;
            };
            let id = link.post_id();
            if !self.seen.insert(id.clone()) {
                continue;
            }
            progressed += 1;

            if !link.belongs_to(self.request.account) {
                debug!(url = %link.url, "Skipping off-account post");
                continue;
            }

            if self.request.anchor == Some(id.as_str()) {
                self.anchor_seen = true;
                match self.request.mode {
                    DiscoveryMode::New => return RoundOutcome::AnchorReached,
                    DiscoveryMode::HistoricalBackfill => {
                        self.anchor_passed = true;
                        continue;
                    }
                }
            }

            if !self.anchor_passed || self.request.known_ids.contains(&id) {
                continue;
            }

            self.links.push(link);
            if self.links.len() >= self.request.target {
                return RoundOutcome::TargetReached;
            }
        }
        RoundOutcome::Progress(progressed)
    }
}

pub struct DiscoveryController {
    settings: DiscoverySettings,
    base_url: String,
}

impl DiscoveryController {
    #[must_use]
    pub fn new(settings: DiscoverySettings, base_url: impl Into<String>) -> Self {
        Self {
            settings,
            base_url: base_url.into(),
        }
    }

    /// Scroll the account's profile and collect up to `request.target` new posts.
    ///
    /// # Errors
    ///
    /// Only a failed navigation to the profile page is an error; unreadable
    /// rounds count as empty.
    pub async fn discover(
        &self,
        page: &dyn PageSession,
        request: &DiscoveryRequest<'_>,
    ) -> Result<DiscoveryOutcome> {
        if request.target == 0 {
            return Ok(DiscoveryOutcome {
                links: Vec::new(),
                stop: StopReason::TargetReached,
                rounds: 0,
                anchor_seen: false,
            });
        }

        let profile = platform::profile_url(&self.base_url, request.account);
        info!(
            account = %request.account,
            target = request.target,
            mode = request.mode.as_str(),
            anchor = ?request.anchor,
            "Starting discovery"
        );
        page.goto(&profile)
            .await
            .with_context(|| format!("Failed to open profile {profile}"))?;

        let mut planner = ScrollPlanner::new(self.settings.clone());
        let mut state = RoundState::new(request);
        let empty_limit = self.settings.empty_round_limit.max(1);
        let mut consecutive_empty = 0u32;
        let mut final_attempted = false;
        let mut rounds = 0u32;

        let stop = loop {
            if rounds >= self.settings.max_rounds {
                break StopReason::RoundBudget;
            }
            rounds += 1;

            let progressed = match page.post_links().await {
                Ok(hrefs) => match state.absorb(&hrefs, &self.base_url) {
                    RoundOutcome::TargetReached => break StopReason::TargetReached,
                    RoundOutcome::AnchorReached => break StopReason::AnchorReached,
                    RoundOutcome::Progress(n) => n,
                },
                Err(e) => {
                    warn!(account = %request.account, round = rounds, error = %e, "Could not read rendered links");
                    0
                }
            };

            debug!(
                account = %request.account,
                round = rounds,
                progressed,
                collected = state.links.len(),
                "Discovery round"
            );

            if progressed > 0 {
                consecutive_empty = 0;
                final_attempted = false;
                scroll(page, planner.distance(rounds)).await;
                sleep(planner.pause()).await;
                continue;
            }

            consecutive_empty += 1;
            if consecutive_empty >= empty_limit {
                if final_attempted {
                    break StopReason::Exhausted;
                }
                debug!(account = %request.account, "Feed looks exhausted, trying a final scroll burst");
                for dy in planner.final_burst() {
                    scroll(page, dy).await;
                    sleep(planner.pause()).await;
                }
                sleep(self.settings.max_wait).await;
                final_attempted = true;
                continue;
            }

            sleep(planner.empty_wait(consecutive_empty)).await;
            scroll(page, planner.distance(rounds)).await;
        };

        info!(
            account = %request.account,
            found = state.links.len(),
            rounds,
            stop = stop.as_str(),
            "Discovery finished"
        );

        Ok(DiscoveryOutcome {
            links: state.links,
            stop,
            rounds,
            anchor_seen: state.anchor_seen,
        })
    }
}

async fn scroll(page: &dyn PageSession, dy: i64) {
    if let Err(e) = page.scroll_by(dy).await {
        debug!(error = %e, "Scroll failed");
    }
}

async fn sleep(duration: Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fixture::{FeedScript, FixtureBrowser, PageScript};
    use crate::browser::BrowserDriver;

    const BASE: &str = "https://www.threads.net";

    fn settings() -> DiscoverySettings {
        DiscoverySettings {
            max_rounds: 20,
            empty_round_limit: 2,
            base_wait: Duration::ZERO,
            max_wait: Duration::ZERO,
            seed: Some(7),
            ..DiscoverySettings::default()
        }
    }

    fn links(user: &str, codes: &[&str]) -> Vec<String> {
        codes
            .iter()
            .map(|c| format!("{BASE}/@{user}/post/{c}"))
            .collect()
    }

    fn codes(outcome: &DiscoveryOutcome) -> Vec<&str> {
        outcome.links.iter().map(|l| l.shortcode.as_str()).collect()
    }

    async fn run(
        feed: FeedScript,
        settings: DiscoverySettings,
        target: usize,
        anchor: Option<&str>,
        mode: DiscoveryMode,
        known: &HashSet<String>,
    ) -> (DiscoveryOutcome, FixtureBrowser) {
        let browser =
            FixtureBrowser::new().with_page(format!("{BASE}/@acme"), PageScript::feed(feed));
        let page = browser.open_page().await.unwrap();
        let controller = DiscoveryController::new(settings, BASE);
        let request = DiscoveryRequest {
            account: "acme",
            target,
            anchor,
            mode,
            known_ids: known,
        };
        let outcome = controller.discover(page.as_ref(), &request).await.unwrap();
        (outcome, browser)
    }

    #[tokio::test]
    async fn test_new_mode_stops_at_anchor() {
        let feed = FeedScript::new(links("acme", &["A", "B", "C", "D", "E"]), 2, 2);
        let (outcome, _) = run(
            feed,
            settings(),
            5,
            Some("acme_C"),
            DiscoveryMode::New,
            &HashSet::new(),
        )
        .await;

        assert_eq!(codes(&outcome), vec!["A", "B"]);
        assert_eq!(outcome.stop, StopReason::AnchorReached);
        assert!(outcome.anchor_seen);
    }

    #[tokio::test]
    async fn test_target_reached_leaves_remaining_links() {
        let feed = FeedScript::new(links("acme", &["A", "B", "C", "D", "E", "F"]), 6, 0);
        let (outcome, browser) = run(
            feed,
            settings(),
            3,
            None,
            DiscoveryMode::New,
            &HashSet::new(),
        )
        .await;

        assert_eq!(codes(&outcome), vec!["A", "B", "C"]);
        assert_eq!(outcome.stop, StopReason::TargetReached);
        assert_eq!(outcome.rounds, 1);
        assert_eq!(browser.scrolls(), 0);
    }

    #[tokio::test]
    async fn test_filters_off_account_and_known_posts() {
        let mut feed_links = links("acme", &["A"]);
        feed_links.extend(links("someone_else", &["X"]));
        feed_links.extend(links("acme", &["B", "C"]));
        let known: HashSet<String> = ["acme_B".to_string()].into();

        let (outcome, _) = run(
            FeedScript::new(feed_links, 4, 0),
            settings(),
            2,
            None,
            DiscoveryMode::New,
            &known,
        )
        .await;

        assert_eq!(codes(&outcome), vec!["A", "C"]);
        assert!(outcome.links.iter().all(|l| l.belongs_to("acme")));
    }

    #[tokio::test]
    async fn test_backfill_collects_only_after_anchor() {
        let feed = FeedScript::new(links("acme", &["A", "B", "C", "D", "E"]), 2, 1);
        let known: HashSet<String> = ["acme_A".to_string(), "acme_B".to_string()].into();
        let (outcome, _) = run(
            feed,
            settings(),
            2,
            Some("acme_B"),
            DiscoveryMode::HistoricalBackfill,
            &known,
        )
        .await;

        assert_eq!(codes(&outcome), vec!["C", "D"]);
        assert_eq!(outcome.stop, StopReason::TargetReached);
        assert!(outcome.anchor_seen);
    }

    #[tokio::test]
    async fn test_exhaustion_after_final_burst() {
        let feed = FeedScript::new(links("acme", &["A", "B", "C", "D"]), 2, 2);
        let (outcome, browser) = run(
            feed,
            settings(),
            10,
            None,
            DiscoveryMode::New,
            &HashSet::new(),
        )
        .await;

        assert_eq!(codes(&outcome), vec!["A", "B", "C", "D"]);
        assert_eq!(outcome.stop, StopReason::Exhausted);
        // two productive rounds, two empty rounds, one read after the burst
        assert_eq!(outcome.rounds, 5);
        // 2 regular + 1 after the first empty round + 3 burst
        assert_eq!(browser.scrolls(), 6);
    }

    #[tokio::test]
    async fn test_tolerates_slow_lazy_loading() {
        let feed = FeedScript::new(links("acme", &["A", "B", "C", "D", "E", "F"]), 2, 2)
            .with_scrolls_per_batch(2);
        let (outcome, _) = run(
            feed,
            settings(),
            6,
            None,
            DiscoveryMode::New,
            &HashSet::new(),
        )
        .await;

        assert_eq!(outcome.links.len(), 6);
        assert_eq!(outcome.stop, StopReason::TargetReached);
    }

    #[tokio::test]
    async fn test_unreadable_round_counts_as_empty() {
        let feed = FeedScript::new(links("acme", &["A", "B", "C"]), 3, 0).with_failing_read(0);
        let (outcome, _) = run(
            feed,
            settings(),
            3,
            None,
            DiscoveryMode::New,
            &HashSet::new(),
        )
        .await;

        assert_eq!(outcome.links.len(), 3);
        assert_eq!(outcome.rounds, 2);
    }

    #[tokio::test]
    async fn test_round_ceiling_forces_stop() {
        let all: Vec<String> = (0..100).map(|i| format!("{BASE}/@acme/post/P{i}")).collect();
        let feed = FeedScript::new(all, 1, 1);
        let capped = DiscoverySettings {
            max_rounds: 3,
            ..settings()
        };
        let (outcome, _) = run(
            feed,
            capped,
            50,
            None,
            DiscoveryMode::New,
            &HashSet::new(),
        )
        .await;

        assert_eq!(outcome.stop, StopReason::RoundBudget);
        assert_eq!(outcome.rounds, 3);
        assert_eq!(outcome.links.len(), 3);
    }

    #[tokio::test]
    async fn test_zero_target_does_not_navigate() {
        let browser = FixtureBrowser::new();
        let page = browser.open_page().await.unwrap();
        let known = HashSet::new();
        let request = DiscoveryRequest {
            account: "acme",
            target: 0,
            anchor: None,
            mode: DiscoveryMode::New,
            known_ids: &known,
        };
        let outcome = DiscoveryController::new(settings(), BASE)
            .discover(page.as_ref(), &request)
            .await
            .unwrap();
        assert!(outcome.links.is_empty());
        assert_eq!(browser.total_visits(), 0);
    }

    #[test]
    fn test_planner_is_reproducible_and_varied() {
        let mut a = ScrollPlanner::new(settings());
        let mut b = ScrollPlanner::new(settings());
        let first: Vec<i64> = (1..=14).map(|r| a.distance(r)).collect();
        let second: Vec<i64> = (1..=14).map(|r| b.distance(r)).collect();
        assert_eq!(first, second);
        assert!(first.iter().all(|d| *d > 0));
        // round 7 is aggressive
        assert!(first[6] >= 3 * (900 - 150));
    }

    #[test]
    fn test_empty_wait_grows_and_caps() {
        let planner = ScrollPlanner::new(DiscoverySettings {
            base_wait: Duration::from_millis(1000),
            max_wait: Duration::from_millis(2500),
            ..DiscoverySettings::default()
        });
        assert_eq!(planner.empty_wait(1), Duration::from_millis(2000));
        assert_eq!(planner.empty_wait(5), Duration::from_millis(2500));
    }
}
