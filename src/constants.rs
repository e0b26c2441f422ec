//! Shared constants used across the application.

/// User agent string used for browser pages and direct HTTP requests.
///
/// A realistic desktop browser user agent, so replayed requests look like the
/// page that captured them.
pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Request header carrying the GraphQL operation name on the platform's internal API.
pub const QUERY_NAME_HEADER: &str = "x-fb-friendly-name";

/// Operation names whose responses carry per-post engagement counts.
pub const COUNTS_QUERY_NAMES: &[&str] = &[
    "BarcelonaPostPageDirectQuery",
    "BarcelonaPostPageContentQuery",
    "BarcelonaPostPageRefetchableDirectQuery",
    "BarcelonaPostPageFeedbackQuery",
];

/// Hosts that serve post media. Anything else (avatars, emoji, ads) is ignored.
pub const MEDIA_CDN_HOSTS: &[&str] = &["cdninstagram.com", "fbcdn.net"];

/// Cache-store queue holding posts that need the vision tier.
pub const VISION_QUEUE: &str = "vision:pending";

/// Prefix for per-URL metrics cache entries.
pub const METRICS_CACHE_PREFIX: &str = "metrics:";

/// Largest count the normalizer will accept.
pub const MAX_COUNT: i64 = 1_000_000_000_000;

/// Largest view count the escalation tiers will accept.
pub const MAX_VIEWS: i64 = 10_000_000_000;

/// Sentinel stored in a metric column when extraction was attempted and failed.
pub const METRIC_FAILED: i64 = -1;
