//! DOM-based fallbacks: page classification, heuristic counts, caption and
//! publish time.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};

use crate::db::{Metric, Metrics};
use crate::normalize;

static POST_CONTAINER: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"div[data-pressable-container="true"]"#).unwrap());
static BODY: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").unwrap());
static ARIA_LABELLED: LazyLock<Selector> = LazyLock::new(|| Selector::parse("[aria-label]").unwrap());
static LOGIN_FORM: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"form[action*="login"], input[name="password"]"#).unwrap());
static TIME: LazyLock<Selector> = LazyLock::new(|| Selector::parse("time[datetime]").unwrap());

/// Caption locations, most specific first.
static CAPTION_SELECTORS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    [
        r#"div[data-pressable-container="true"] span[dir="auto"]"#,
        r#"div[data-testid="post-text"]"#,
        "article h1",
    ]
    .iter()
    .map(|css| Selector::parse(css).unwrap())
    .collect()
});
static OG_DESCRIPTION: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"meta[property="og:description"]"#).unwrap());

/// Label words per metric, across the languages the platform renders.
const LABEL_TABLE: &[(Metric, &[&str])] = &[
    (Metric::Likes, &["Like", "讚", "赞", "いいね"]),
    (Metric::Comments, &["Reply", "Comment", "回覆", "回复", "留言"]),
    (Metric::Reposts, &["Repost", "轉發", "转发", "轉貼"]),
    (Metric::Shares, &["Share", "分享"]),
];

/// UI strings that show up next to captions.
const CAPTION_NOISE: &[&str] = &[
    "Translate",
    "See translation",
    "翻譯",
    "翻译",
    "查看翻譯",
    "Author",
    "作者",
    "Follow",
    "追蹤",
];

/// Longest text node still considered a count token.
const MAX_TOKEN_CHARS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Normal page with the hydrated data blob.
    Hydrated,
    /// Stripped page without hydrated data; only DOM parsing applies.
    Gate,
    LoginWall,
    Empty,
}

impl PageKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hydrated => "hydrated",
            Self::Gate => "gate",
            Self::LoginWall => "login_wall",
            Self::Empty => "empty",
        }
    }
}

#[must_use]
pub fn classify_page(html: &str) -> PageKind {
    let document = Html::parse_document(html);
    let body_empty = document
        .select(&BODY)
        .next()
        .is_none_or(|body| body.text().all(|t| t.trim().is_empty()));
    if body_empty {
        return PageKind::Empty;
    }
    if document.select(&LOGIN_FORM).next().is_some() {
        return PageKind::LoginWall;
    }
    if html.contains("data-sjs") || html.contains("thread_items") {
        PageKind::Hydrated
    } else {
        PageKind::Gate
    }
}

fn primary_scope(document: &Html) -> Option<ElementRef<'_>> {
    document
        .select(&POST_CONTAINER)
        .next()
        .or_else(|| document.select(&BODY).next())
}

/// Count-looking text tokens of the primary post, in document order.
#[must_use]
pub fn count_tokens(html: &str) -> Vec<i64> {
    let document = Html::parse_document(html);
    let Some(scope) = primary_scope(&document) else {
        return Vec::new();
    };

    scope
        .descendants()
        .filter(|node| {
            !node.ancestors().any(|a| {
                a.value()
                    .as_element()
                    .is_some_and(|e| matches!(e.name(), "script" | "style" | "noscript" | "time"))
            })
        })
        .filter_map(|node| node.value().as_text().map(|t| normalize::clean_text(t)))
        .filter(|text| !text.is_empty() && text.chars().count() <= MAX_TOKEN_CHARS)
        .filter(|text| !normalize::is_time_ago(text))
        .filter_map(|text| normalize::parse_count_strict(&text))
        .collect()
}

/// Heuristic counts from rendered text.
///
/// The platform renders likes, comments, reposts and shares in descending
/// magnitude on the primary post, so the largest number is taken as likes and
/// so on. With fewer than two numbers the labelled-element table is used.
#[must_use]
pub fn metrics_from_dom(html: &str) -> Metrics {
    let mut numbers = count_tokens(html);
    if numbers.len() < 2 {
        return metrics_from_labels(html);
    }

    numbers.sort_by(|a, b| b.cmp(a));
    let mut metrics = Metrics::default();
    for (metric, value) in Metric::ENGAGEMENT.iter().zip(numbers) {
        *metrics.slot(*metric) = Some(value);
    }
    metrics
}

/// First count appearing anywhere in `text`.
fn count_in(text: &str) -> Option<i64> {
    let cleaned = normalize::clean_text(text);
    let mut prev_digit = false;
    for (i, c) in cleaned.char_indices() {
        let is_digit = c.is_ascii_digit();
        if is_digit && !prev_digit {
            if let Some(v) = normalize::parse_count(&cleaned[i..]) {
                return Some(v);
            }
        }
        prev_digit = is_digit;
    }
    None
}

/// Counts from elements whose `aria-label` names a metric.
#[must_use]
pub fn metrics_from_labels(html: &str) -> Metrics {
    let document = Html::parse_document(html);
    let mut metrics = Metrics::default();

    for element in document.select(&ARIA_LABELLED) {
        let Some(label) = element.value().attr("aria-label") else {
            continue;
        };
        let Some((metric, _)) = LABEL_TABLE
            .iter()
            .find(|(_, words)| words.iter().any(|w| label.contains(w)))
        else {
            continue;
        };
        if metrics.get(*metric).is_some() {
            continue;
        }
        let text: String = element.text().collect();
        if let Some(value) = count_in(label).or_else(|| count_in(&text)) {
            *metrics.slot(*metric) = Some(value);
        }
    }
    metrics
}

fn is_caption(text: &str, account: &str) -> bool {
    let handle = text.trim_start_matches('@');
    text.chars().count() >= 2
        && !handle.eq_ignore_ascii_case(account)
        && !(text.starts_with('@') && !text.contains(' '))
        && !normalize::is_time_ago(text)
        && normalize::parse_count_strict(text).is_none()
        && !CAPTION_NOISE.iter().any(|n| text.eq_ignore_ascii_case(n))
}

/// Main caption of the post, if one can be told apart from metadata.
#[must_use]
pub fn caption_from_dom(html: &str, account: &str) -> Option<String> {
    let document = Html::parse_document(html);

    for selector in CAPTION_SELECTORS.iter() {
        let best = document
            .select(selector)
            .map(|el| normalize::clean_text(&el.text().collect::<String>()))
            .filter(|text| is_caption(text, account))
            .max_by_key(|text| text.chars().count());
        if best.is_some() {
            return best;
        }
    }

    document
        .select(&OG_DESCRIPTION)
        .next()
        .and_then(|meta| meta.value().attr("content"))
        .map(normalize::clean_text)
        .filter(|text| is_caption(text, account))
}

/// Publish time from the first `<time datetime>` element.
#[must_use]
pub fn published_at(html: &str) -> Option<DateTime<Utc>> {
    let document = Html::parse_document(html);
    document
        .select(&TIME)
        .filter_map(|el| el.value().attr("datetime"))
        .find_map(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
