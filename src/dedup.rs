//! Near-duplicate detection and main-post selection.
//!
//! A post harvested alongside its own reply or boost shows up as several
//! records whose captions open the same way. Those records are clustered by a
//! normalized content prefix and one canonical record is kept per cluster.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::db::{Metric, PostRecord};
use crate::normalize;

/// Characters of normalized content compared when clustering.
pub const PREFIX_CHARS: usize = 100;

/// Normalized opening of a caption: whitespace collapsed, case folded,
/// punctuation dropped. Empty captions yield an empty prefix.
#[must_use]
pub fn content_prefix(content: &str) -> String {
    let cleaned = normalize::clean_text(content).to_lowercase();
    let mut prefix = String::with_capacity(PREFIX_CHARS);
    let mut taken = 0;
    let mut last_space = true;
    for c in cleaned.chars() {
        if taken >= PREFIX_CHARS {
            break;
        }
        let c = if c.is_alphanumeric() {
            c
        } else if c.is_whitespace() {
            ' '
        } else {
            continue;
        };
        if c == ' ' {
            if last_space {
                continue;
            }
            last_space = true;
        } else {
            last_space = false;
        }
        prefix.push(c);
        taken += 1;
    }
    prefix.trim_end().to_string()
}

/// Indices of records sharing a content prefix, in first-seen order.
///
/// Records without content never cluster; every returned group has at least
/// two members.
#[must_use]
pub fn group_near_duplicates(records: &[PostRecord]) -> Vec<Vec<usize>> {
    let mut by_prefix: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();

    for (index, record) in records.iter().enumerate() {
        let prefix = content_prefix(&record.content);
        if prefix.is_empty() {
            continue;
        }
        match by_prefix.get(&prefix) {
            Some(&group) => groups[group].push(index),
            None => {
                by_prefix.insert(prefix, groups.len());
                groups.push(vec![index]);
            }
        }
    }

    groups.retain(|g| g.len() > 1);
    groups
}

/// Ranking used by [`select_main`]. `Greater` means `a` is the better main post.
///
/// Views first (unknown ranks below any real count), then summed engagement,
/// then caption length, then the earlier timestamp. The post ID is the final
/// tie-break so the winner never depends on input order.
#[must_use]
pub fn rank(a: &PostRecord, b: &PostRecord) -> Ordering {
    let views = |r: &PostRecord| r.metrics.known(Metric::Views).unwrap_or(-1);
    views(a)
        .cmp(&views(b))
        .then_with(|| a.metrics.engagement().cmp(&b.metrics.engagement()))
        .then_with(|| a.content.chars().count().cmp(&b.content.chars().count()))
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| b.post_id.cmp(&a.post_id))
}

/// Canonical record of a cluster. Fully tied records keep list order.
#[must_use]
pub fn select_main(cluster: &[PostRecord]) -> Option<&PostRecord> {
    let mut best: Option<&PostRecord> = None;
    for record in cluster {
        best = match best {
            Some(current) if rank(record, current) != Ordering::Greater => Some(current),
            _ => Some(record),
        };
    }
    best
}

/// Result of collapsing a batch.
#[derive(Debug, Default)]
pub struct Collapsed {
    /// Survivors in their original order.
    pub kept: Vec<PostRecord>,
    /// `(dropped, kept main)` post ID pairs.
    pub dropped: Vec<(String, String)>,
}

/// Keep one main record per near-duplicate cluster. Relative order of the
/// survivors is unchanged.
#[must_use]
pub fn collapse(records: Vec<PostRecord>) -> Collapsed {
    let mut drop_index = vec![false; records.len()];
    let mut dropped = Vec::new();

    for group in group_near_duplicates(&records) {
        let cluster: Vec<PostRecord> = group.iter().map(|&i| records[i].clone()).collect();
        let Some(main) = select_main(&cluster) else {
            continue;
        };
        let main_id = main.post_id.clone();
        let mut kept_main = false;
        for &i in &group {
            if !kept_main && records[i].post_id == main_id {
                kept_main = true;
                continue;
            }
            drop_index[i] = true;
            dropped.push((records[i].post_id.clone(), main_id.clone()));
        }
    }

    let kept = records
        .into_iter()
        .zip(drop_index)
        .filter_map(|(record, drop)| (!drop).then_some(record))
        .collect();
    Collapsed { kept, dropped }
}
