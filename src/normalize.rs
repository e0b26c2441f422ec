//! Parsing of abbreviated, localized and unicode-polluted count strings.
//!
//! The platform renders counts as `"3.9K"`, `"1.2萬"`, `"12,345"` or
//! `"4 萬次瀏覽"`, often with NBSP or zero-width characters mixed in. Every
//! parser here returns `None` for anything it cannot read exactly; a wrong
//! number is worse than no number.

use std::sync::LazyLock;

use regex::Regex;

use crate::constants::{MAX_COUNT, MAX_VIEWS};

/// Leading count token: integer part, optional fraction, optional unit, remainder.
static COUNT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<int>\d{1,3}(?:[,，]\d{3})+|\d+)(?:\.(?P<frac>\d+))?(?:\s?(?P<unit>[KkMmBb])\b|\s?(?P<cjk>[千萬万億亿]))?(?P<rest>.*)$",
    )
    .unwrap()
});

/// A count followed by a views label, in English or Chinese.
static VIEWS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(\d[\d,，.]*(?:\s?[KMB千萬万億亿])?)\s*(?:次瀏覽|次浏览|次觀看|次观看|views?\b|plays?\b)",
    )
    .unwrap()
});

/// Relative timestamps (`"3h"`, `"2 d"`, `"5分鐘"`) that look numeric but are not counts.
static TIME_AGO_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d+\s?(?:[smhdwy]|秒|分鐘|分钟|小時|小时|天|週|周|年)(?:\s?(?:ago|前))?$").unwrap()
});

/// Strip zero-width characters and fold unusual spaces into single ASCII spaces.
#[must_use]
pub fn clean_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}' => {}
            c if c.is_whitespace() => out.push(' '),
            c => out.push(c),
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse a count that may carry trailing label text (`"3.9K likes"`, `"4 萬次瀏覽"`).
#[must_use]
pub fn parse_count(input: &str) -> Option<i64> {
    parse_count_inner(&clean_text(input), false)
}

/// Parse a string that must consist of a count and nothing else.
#[must_use]
pub fn parse_count_strict(input: &str) -> Option<i64> {
    parse_count_inner(&clean_text(input), true)
}

/// Whether a short text token is a relative timestamp rather than a count.
#[must_use]
pub fn is_time_ago(input: &str) -> bool {
    TIME_AGO_PATTERN.is_match(&clean_text(input))
}

/// Find the first well-formed, in-range view count in a block of document text.
#[must_use]
pub fn parse_views_text(text: &str) -> Option<i64> {
    let cleaned = clean_text(text);
    VIEWS_PATTERN
        .captures_iter(&cleaned)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| parse_count_strict(m.as_str()))
        .find(|v| is_sane_views(*v))
}

/// Views must be positive and below a platform-plausible ceiling.
#[must_use]
pub fn is_sane_views(value: i64) -> bool {
    (1..=MAX_VIEWS).contains(&value)
}

fn parse_count_inner(cleaned: &str, strict: bool) -> Option<i64> {
    let caps = COUNT_PATTERN.captures(cleaned.trim())?;

    let rest = caps.name("rest").map_or("", |m| m.as_str());
    if !rest_is_label(rest, strict) {
        return None;
    }

    let int_part: i64 = caps["int"].replace([',', '，'], "").parse().ok()?;
    let multiplier = caps
        .name("unit")
        .or_else(|| caps.name("cjk"))
        .map_or(1, |m| unit_multiplier(m.as_str()));

    let mut value = int_part.checked_mul(multiplier)?;

    if let Some(frac) = caps.name("frac") {
        let digits = frac.as_str();
        if multiplier == 1 {
            // A plain decimal is not a count unless the fraction is zero.
            if digits.chars().any(|c| c != '0') {
                return None;
            }
        } else {
            if digits.len() > 6 {
                return None;
            }
            let frac_value: i64 = digits.parse().ok()?;
            let scale = 10_i64.pow(u32::try_from(digits.len()).ok()?);
            let scaled = frac_value.checked_mul(multiplier)?;
            // "1.2345K" is not a whole number of anything.
            if scaled % scale != 0 {
                return None;
            }
            value = value.checked_add(scaled / scale)?;
        }
    }

    (0..=MAX_COUNT).contains(&value).then_some(value)
}

fn rest_is_label(rest: &str, strict: bool) -> bool {
    if rest.is_empty() {
        return true;
    }
    if strict {
        return false;
    }
    rest.starts_with(' ') || rest.chars().next().is_some_and(|c| !c.is_ascii())
}

fn unit_multiplier(unit: &str) -> i64 {
    match unit {
        "K" | "k" | "千" => 1_000,
        "萬" | "万" => 10_000,
        "M" | "m" => 1_000_000,
        "億" | "亿" => 100_000_000,
        "B" | "b" => 1_000_000_000,
        _ => 1,
    }
}
