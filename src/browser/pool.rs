//! Bounded page concurrency.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::{BrowserDriver, PageSession};

/// Hands out at most `limit` live pages at a time.
///
/// A slot is only returned to the pool after its page has been closed, so the
/// number of open pages never exceeds the limit.
pub struct PagePool {
    driver: Arc<dyn BrowserDriver>,
    semaphore: Arc<Semaphore>,
    name: &'static str,
}

impl PagePool {
    #[must_use]
    pub fn new(driver: Arc<dyn BrowserDriver>, limit: usize, name: &'static str) -> Self {
        Self {
            driver,
            semaphore: Arc::new(Semaphore::new(limit.max(1))),
            name,
        }
    }

    /// Wait for a free slot and open a fresh page in it.
    pub async fn acquire(&self) -> Result<PageLease> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .context("Page pool closed")?;
        // On failure the permit drops here and the slot is free again.
        let page = self.driver.open_page().await?;
        debug!(pool = self.name, available = self.available(), "Page leased");
        Ok(PageLease {
            page: Some(page),
            permit: Some(permit),
        })
    }

    /// Number of free slots.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    #[must_use]
    pub fn driver(&self) -> &Arc<dyn BrowserDriver> {
        &self.driver
    }
}

/// A page plus the pool slot it occupies.
///
/// Prefer [`PageLease::release`]; dropping a lease closes the page on a
/// background task and frees the slot once the close completes.
pub struct PageLease {
    page: Option<Box<dyn PageSession>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PageLease {
    #[must_use]
    pub fn page(&self) -> &dyn PageSession {
        // Only `release` and `drop` take the page, and both consume the lease.
        self.page
            .as_deref()
            .unwrap_or_else(|| unreachable!("page taken from a live lease"))
    }

    /// Close the page, then free the slot.
    pub async fn release(mut self) {
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                warn!("Failed to close page: {e}");
            }
        }
        self.permit.take();
    }
}

impl Drop for PageLease {
    fn drop(&mut self) {
        let Some(page) = self.page.take() else {
            return;
        };
        let permit = self.permit.take();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = page.close().await {
                    warn!("Failed to close dropped page: {e}");
                }
                drop(permit);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fixture::FixtureBrowser;

    #[tokio::test]
    async fn test_release_closes_page_before_slot_is_reused() {
        let browser = FixtureBrowser::new();
        let pool = PagePool::new(Arc::new(browser.clone()), 1, "test");

        let lease = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 0);
        lease.release().await;
        assert_eq!(pool.available(), 1);
        assert_eq!(browser.pages_closed(), 1);

        let lease = pool.acquire().await.unwrap();
        lease.release().await;
        assert_eq!(browser.max_open_pages(), 1);
    }

    #[tokio::test]
    async fn test_dropped_lease_still_closes_page() {
        let browser = FixtureBrowser::new();
        let pool = PagePool::new(Arc::new(browser.clone()), 1, "test");

        {
            let _lease = pool.acquire().await.unwrap();
        }
        // The slot frees only after the background close ran.
        let lease = pool.acquire().await.unwrap();
        assert_eq!(browser.pages_closed(), 1);
        lease.release().await;
        assert_eq!(browser.open_pages(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_leases_bounded() {
        let browser = FixtureBrowser::new();
        let pool = Arc::new(PagePool::new(Arc::new(browser.clone()), 2, "test"));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                let lease = pool.acquire().await.unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                lease.release().await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(browser.pages_opened(), 6);
        assert!(browser.max_open_pages() <= 2);
    }
}
