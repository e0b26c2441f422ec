//! Parsing of the platform's batched counts API.
//!
//! Payload shapes drift between platform versions, so every logical field is
//! looked up through an ordered list of key paths and the first hit wins.
//! Unrecognized keys are logged and otherwise ignored.

use serde_json::Value;
use tracing::debug;

use crate::browser::ObservedResponse;
use crate::constants::{COUNTS_QUERY_NAMES, QUERY_NAME_HEADER};
use crate::db::{Metric, Metrics};
use crate::error::FetchError;
use crate::normalize;

/// Candidate key paths for one logical field.
#[derive(Debug, Clone, Copy)]
pub struct FieldPaths {
    pub metric: Metric,
    pub paths: &'static [&'static str],
}

/// Counts carried by the API, in lookup order.
pub const COUNT_FIELDS: &[FieldPaths] = &[
    FieldPaths {
        metric: Metric::Likes,
        paths: &["like_count", "feedback_info.like_count"],
    },
    FieldPaths {
        metric: Metric::Comments,
        paths: &[
            "text_post_app_info.direct_reply_count",
            "reply_count",
            "comment_count",
        ],
    },
    FieldPaths {
        metric: Metric::Reposts,
        paths: &["text_post_app_info.repost_count", "repost_count"],
    },
    FieldPaths {
        metric: Metric::Shares,
        paths: &[
            "text_post_app_info.reshare_count",
            "text_post_app_info.quote_count",
            "reshare_count",
        ],
    },
];

const SHORTCODE_PATHS: &[&str] = &["code"];
const CAPTION_PATHS: &[&str] = &["caption.text", "text_post_app_info.text_fragments.fragments.0.plaintext"];
const TAKEN_AT_PATHS: &[&str] = &["taken_at", "device_timestamp"];

/// Top-level keys of a post object that the parser knows about.
const KNOWN_POST_KEYS: &[&str] = &[
    "pk",
    "id",
    "code",
    "user",
    "caption",
    "taken_at",
    "device_timestamp",
    "like_count",
    "feedback_info",
    "reply_count",
    "comment_count",
    "repost_count",
    "reshare_count",
    "text_post_app_info",
    "image_versions2",
    "video_versions",
    "carousel_media",
    "media_type",
    "original_width",
    "original_height",
    "has_liked",
    "like_and_view_counts_disabled",
    "is_paid_partnership",
    "giphy_media_info",
    "audio",
];

/// One post found in a counts payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountsRecord {
    pub shortcode: Option<String>,
    pub metrics: Metrics,
    pub caption: Option<String>,
    /// Unix seconds.
    pub taken_at: Option<i64>,
}

/// Whether a response belongs to one of the counts queries.
#[must_use]
pub fn is_counts_query(response: &ObservedResponse) -> bool {
    response
        .request_header(QUERY_NAME_HEADER)
        .is_some_and(|name| COUNTS_QUERY_NAMES.contains(&name))
}

/// Follow a dotted path; numeric segments index into arrays.
#[must_use]
pub fn resolve_path<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// First path that resolves to a non-null value.
#[must_use]
pub fn first_match<'v>(value: &'v Value, paths: &[&str]) -> Option<&'v Value> {
    paths
        .iter()
        .filter_map(|path| resolve_path(value, path))
        .find(|v| !v.is_null())
}

fn as_count(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().filter(|v| *v >= 0),
        Value::String(s) => normalize::parse_count_strict(s),
        _ => None,
    }
}

fn as_text(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(normalize::clean_text)
        .filter(|s| !s.is_empty())
}

/// Parse one post object.
#[must_use]
pub fn parse_post(post: &Value) -> CountsRecord {
    if let Some(map) = post.as_object() {
        let unknown: Vec<&str> = map
            .keys()
            .map(String::as_str)
            .filter(|k| !KNOWN_POST_KEYS.contains(k))
            .collect();
        if !unknown.is_empty() {
            debug!(keys = ?unknown, "Unrecognized keys on post object");
        }
    }

    let mut metrics = Metrics::default();
    for field in COUNT_FIELDS {
        if let Some(count) = field
            .paths
            .iter()
            .filter_map(|path| resolve_path(post, path))
            .find_map(as_count)
        {
            *metrics.slot(field.metric) = Some(count);
        }
    }

    CountsRecord {
        shortcode: first_match(post, SHORTCODE_PATHS).and_then(as_text),
        metrics,
        caption: first_match(post, CAPTION_PATHS).and_then(as_text),
        taken_at: first_match(post, TAKEN_AT_PATHS).and_then(Value::as_i64),
    }
}

/// Locate post objects in a payload: the known containers first, then any
/// object that carries a shortcode next to a like count.
fn collect_posts<'v>(root: &'v Value, out: &mut Vec<&'v Value>) {
    if let Some(edges) = resolve_path(root, "data.data.edges").and_then(Value::as_array) {
        for edge in edges {
            if let Some(items) = resolve_path(edge, "node.thread_items").and_then(Value::as_array) {
                out.extend(items.iter().filter_map(|item| item.get("post")));
            }
        }
    }
    if let Some(media) = resolve_path(root, "data.media") {
        if media.is_object() {
            out.push(media);
        }
    }
    if out.is_empty() {
        scan_for_posts(root, out);
    }
}

fn scan_for_posts<'v>(value: &'v Value, out: &mut Vec<&'v Value>) {
    match value {
        Value::Object(map) => {
            if map.contains_key("code") && first_match(value, COUNT_FIELDS[0].paths).is_some() {
                out.push(value);
                return;
            }
            for child in map.values() {
                scan_for_posts(child, out);
            }
        }
        Value::Array(items) => {
            for child in items {
                scan_for_posts(child, out);
            }
        }
        _ => {}
    }
}

/// Split a response body into JSON documents. Bodies may carry an
/// anti-hijacking prefix or several newline-separated documents.
fn documents(body: &str) -> Vec<Value> {
    let body = body.trim_start_matches("for (;;);").trim();
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return vec![value];
    }
    body.lines()
        .filter_map(|line| serde_json::from_str::<Value>(line.trim()).ok())
        .collect()
}

/// Parse a counts response body.
///
/// # Errors
///
/// `ParseMiss` when the body is not JSON or contains no post objects.
pub fn parse_counts_payload(body: &str) -> Result<Vec<CountsRecord>, FetchError> {
    let docs = documents(body);
    if docs.is_empty() {
        return Err(FetchError::ParseMiss("counts payload is not JSON".to_string()));
    }

    let mut records = Vec::new();
    for doc in &docs {
        let mut posts = Vec::new();
        collect_posts(doc, &mut posts);
        records.extend(posts.into_iter().map(parse_post));
    }

    if records.is_empty() {
        return Err(FetchError::ParseMiss("no posts in counts payload".to_string()));
    }
    Ok(records)
}

/// The record for `shortcode`. A payload with a single unlabeled post is
/// assumed to be about the requested one; only use this for responses the
/// post's own page issued.
#[must_use]
pub fn record_for<'r>(records: &'r [CountsRecord], shortcode: &str) -> Option<&'r CountsRecord> {
    records
        .iter()
        .find(|r| r.shortcode.as_deref() == Some(shortcode))
        .or_else(|| match records {
            [only] if only.shortcode.is_none() => Some(only),
            _ => None,
        })
        .filter(|r| r.metrics.has_engagement())
}

/// The record explicitly labeled with `shortcode`, for responses that were
/// not issued by the post's own page.
#[must_use]
pub fn labeled_record_for<'r>(records: &'r [CountsRecord], shortcode: &str) -> Option<&'r CountsRecord> {
    records
        .iter()
        .find(|r| r.shortcode.as_deref() == Some(shortcode))
        .filter(|r| r.metrics.has_engagement())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn edges_payload(post: Value) -> String {
        json!({
            "data": { "data": { "edges": [
                { "node": { "thread_items": [ { "post": post } ] } }
            ] } }
        })
        .to_string()
    }

    #[test]
    fn test_parses_nested_edges_with_alternate_paths() {
        let body = edges_payload(json!({
            "code": "ABC",
            "like_count": 120,
            "text_post_app_info": { "direct_reply_count": 8, "repost_count": 3, "reshare_count": 1 },
            "caption": { "text": "hello\u{00A0}world" },
            "taken_at": 1_700_000_000,
        }));
        let records = parse_counts_payload(&body).unwrap();
        let record = record_for(&records, "ABC").unwrap();
        assert_eq!(record.metrics.likes, Some(120));
        assert_eq!(record.metrics.comments, Some(8));
        assert_eq!(record.metrics.reposts, Some(3));
        assert_eq!(record.metrics.shares, Some(1));
        assert_eq!(record.metrics.views, None);
        assert_eq!(record.caption.as_deref(), Some("hello world"));
        assert_eq!(record.taken_at, Some(1_700_000_000));
    }

    #[test]
    fn test_first_match_wins_and_falls_through_nulls() {
        let post = json!({
            "code": "X",
            "like_count": null,
            "feedback_info": { "like_count": 42 },
            "reply_count": 5,
            "comment_count": 99,
        });
        let record = parse_post(&post);
        assert_eq!(record.metrics.likes, Some(42));
        assert_eq!(record.metrics.comments, Some(5));
    }

    #[test]
    fn test_media_container_and_string_counts() {
        let body = json!({ "data": { "media": { "code": "M1", "like_count": "3.9K", "new_field": true } } });
        let records = parse_counts_payload(&body.to_string()).unwrap();
        assert_eq!(record_for(&records, "M1").unwrap().metrics.likes, Some(3900));
    }

    #[test]
    fn test_unknown_shape_found_by_scan() {
        let body = json!({ "payload": { "v2": [ { "code": "Z", "like_count": 7 } ] } });
        let records = parse_counts_payload(&body.to_string()).unwrap();
        assert_eq!(record_for(&records, "Z").unwrap().metrics.likes, Some(7));
    }

    #[test]
    fn test_prefixed_and_multi_document_bodies() {
        let one = json!({ "data": { "media": { "code": "A", "like_count": 1 } } });
        let two = json!({ "data": { "media": { "code": "B", "like_count": 2 } } });
        let body = format!("for (;;);{one}\n{two}");
        let records = parse_counts_payload(&body).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(record_for(&records, "B").unwrap().metrics.likes, Some(2));
    }

    #[test]
    fn test_parse_misses() {
        assert!(matches!(parse_counts_payload("<html>"), Err(FetchError::ParseMiss(_))));
        assert!(matches!(
            parse_counts_payload(r#"{"data":{}}"#),
            Err(FetchError::ParseMiss(_))
        ));
    }

    #[test]
    fn test_record_for_other_post_is_not_used() {
        let records = vec![CountsRecord {
            shortcode: Some("OTHER".to_string()),
            metrics: Metrics {
                likes: Some(5),
                ..Metrics::default()
            },
            ..CountsRecord::default()
        }];
        assert!(record_for(&records, "MINE").is_none());
    }

    #[test]
    fn test_unlabeled_record_only_trusted_from_own_page() {
        let records = vec![CountsRecord {
            metrics: Metrics {
                likes: Some(10),
                ..Metrics::default()
            },
            ..CountsRecord::default()
        }];
        assert_eq!(record_for(&records, "P2").unwrap().metrics.likes, Some(10));
        assert!(labeled_record_for(&records, "P2").is_none());
    }

    #[test]
    fn test_is_counts_query_by_header() {
        let mut response = ObservedResponse::default();
        assert!(!is_counts_query(&response));
        response.request_headers.insert(
            QUERY_NAME_HEADER.to_string(),
            "BarcelonaPostPageDirectQuery".to_string(),
        );
        assert!(is_counts_query(&response));
        response
            .request_headers
            .insert(QUERY_NAME_HEADER.to_string(), "BarcelonaProfileQuery".to_string());
        assert!(!is_counts_query(&response));
    }
}
