//! Per-account incremental crawl state.
//!
//! Every mutation is an upsert or an atomic increment, so overlapping runs for
//! the same account converge instead of clobbering each other.

use std::collections::HashSet;

use anyhow::Result;
use tracing::{debug, warn};

use crate::db::{self, CrawlState, Database, PostRecord};

#[derive(Debug, Clone)]
pub struct CrawlStateStore {
    db: Database,
}

impl CrawlStateStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// New posts to fetch for `account`: exactly the requested delta, or 0
    /// when nothing was requested.
    #[must_use]
    pub fn needed(&self, account: &str, extra_requested: i64) -> usize {
        if extra_requested <= 0 {
            debug!(account = %account, "Nothing requested, skipping crawl");
            return 0;
        }
        usize::try_from(extra_requested).unwrap_or(usize::MAX)
    }

    /// Every post ID already stored for `account`.
    pub async fn existing_ids(&self, account: &str) -> Result<HashSet<String>> {
        db::get_existing_post_ids(self.db.pool(), account).await
    }

    pub async fn state(&self, account: &str) -> Result<Option<CrawlState>> {
        db::get_crawl_state(self.db.pool(), account).await
    }

    pub async fn states(&self, accounts: &[String]) -> Result<Vec<CrawlState>> {
        db::get_crawl_states(self.db.pool(), accounts).await
    }

    /// Upsert `records` by post ID and return how many were new.
    ///
    /// A failing row is logged and skipped; the others are still written.
    pub async fn persist(&self, records: &[PostRecord]) -> usize {
        let mut inserted = 0;
        for record in records {
            match db::upsert_post(self.db.pool(), record).await {
                Ok(true) => inserted += 1,
                Ok(false) => debug!(post_id = %record.post_id, "Updated existing post"),
                Err(e) => warn!(post_id = %record.post_id, error = %e, "Failed to persist post"),
            }
        }
        inserted
    }

    /// Bump the account's total by `added` and move the cursor to `latest`
    /// when one is given.
    pub async fn advance(&self, account: &str, latest: Option<&str>, added: usize) -> Result<()> {
        let added = i64::try_from(added).unwrap_or(i64::MAX);
        db::advance_crawl_state(self.db.pool(), account, latest, added).await
    }
}
