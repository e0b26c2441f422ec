//! Post URL patterns and identity derivation for the feed platform.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

/// `/@{username}/post/{shortcode}` on either platform host.
static POST_URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://(?:www\.)?threads\.(?:net|com)/@(?P<user>[A-Za-z0-9_.]+)/post/(?P<code>[A-Za-z0-9_-]+)")
        .unwrap()
});

/// Relative form of the same path, as found in `href` attributes.
static POST_PATH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/@(?P<user>[A-Za-z0-9_.]+)/post/(?P<code>[A-Za-z0-9_-]+)").unwrap()
});

/// Identity of a post parsed from its URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostLink {
    /// Lower-cased username embedded in the URL.
    pub username: String,
    pub shortcode: String,
    /// Canonical URL on the configured base host, without query or trailing segments.
    pub url: String,
}

impl PostLink {
    /// Stable post ID for this link under the given account.
    #[must_use]
    pub fn post_id(&self) -> String {
        post_id(&self.username, &self.shortcode)
    }

    /// Whether this post belongs to `account` (reposts from others do not).
    #[must_use]
    pub fn belongs_to(&self, account: &str) -> bool {
        self.username.eq_ignore_ascii_case(account.trim_start_matches('@'))
    }
}

/// Derive the stable post ID from account and shortcode.
#[must_use]
pub fn post_id(account: &str, shortcode: &str) -> String {
    format!(
        "{}_{}",
        account.trim_start_matches('@').to_lowercase(),
        shortcode
    )
}

/// Profile page for an account.
#[must_use]
pub fn profile_url(base_url: &str, account: &str) -> String {
    format!(
        "{}/@{}",
        base_url.trim_end_matches('/'),
        account.trim_start_matches('@')
    )
}

/// Parse a post link from an absolute URL or a site-relative `href`.
///
/// Returns `None` for anything that is not a post permalink (profiles, media
/// sub-pages are accepted and truncated to the post itself).
#[must_use]
pub fn parse_post_link(href: &str, base_url: &str) -> Option<PostLink> {
    let href = href.trim();
    let caps = POST_URL_PATTERN
        .captures(href)
        .or_else(|| POST_PATH_PATTERN.captures(href))?;

    let username = caps["user"].to_lowercase();
    let shortcode = caps["code"].to_string();
    let url = format!(
        "{}/@{}/post/{}",
        base_url.trim_end_matches('/'),
        username,
        shortcode
    );

    Some(PostLink {
        username,
        shortcode,
        url,
    })
}

/// Host of a URL, lower-cased, if it parses.
#[must_use]
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://www.threads.net";

    #[test]
    fn test_parse_absolute_link() {
        let link = parse_post_link("https://www.threads.net/@Acme/post/C9xYz_1-a?xmt=abc", BASE)
            .unwrap();
        assert_eq!(link.username, "acme");
        assert_eq!(link.shortcode, "C9xYz_1-a");
        assert_eq!(link.url, "https://www.threads.net/@acme/post/C9xYz_1-a");
        assert_eq!(link.post_id(), "acme_C9xYz_1-a");
    }

    #[test]
    fn test_parse_relative_and_media_link() {
        let link = parse_post_link("/@acme/post/ABC123/media", BASE).unwrap();
        assert_eq!(link.shortcode, "ABC123");
        assert_eq!(link.url, "https://www.threads.net/@acme/post/ABC123");
    }

    #[test]
    fn test_threads_com_host_normalized() {
        let link = parse_post_link("https://threads.com/@acme/post/XYZ", BASE).unwrap();
        assert_eq!(link.url, "https://www.threads.net/@acme/post/XYZ");
    }

    #[test]
    fn test_non_post_links() {
        assert!(parse_post_link("https://www.threads.net/@acme", BASE).is_none());
        assert!(parse_post_link("https://example.com/@acme/post/X", BASE).is_none());
        assert!(parse_post_link("/search?q=acme", BASE).is_none());
    }

    #[test]
    fn test_belongs_to() {
        let link = parse_post_link("/@other.user/post/AAA", BASE).unwrap();
        assert!(!link.belongs_to("acme"));
        assert!(link.belongs_to("@Other.User"));
    }

    #[test]
    fn test_post_id_is_deterministic() {
        assert_eq!(post_id("@ACME", "abc"), post_id("acme", "abc"));
    }

    #[test]
    fn test_profile_url() {
        assert_eq!(profile_url("https://www.threads.net/", "@acme"), "https://www.threads.net/@acme");
    }
}
