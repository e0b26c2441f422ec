use std::time::Duration;

use anyhow::Result;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::harvester::{CrawlRequest, Harvester};

/// Vision jobs handled per poll cycle.
const VISION_BATCH: usize = 20;

/// Run the harvest loop forever.
pub async fn poll_loop(config: Config, harvester: Harvester) {
    let mut consecutive_empty = 0u32;
    let base_interval = config.poll_interval;
    let max_interval = base_interval * 4;

    loop {
        match poll_once(&config, &harvester).await {
            Ok(new_count) => {
                if new_count > 0 {
                    info!(new_posts = new_count, "Harvested new posts");
                    consecutive_empty = 0;
                } else {
                    consecutive_empty = consecutive_empty.saturating_add(1);
                    debug!(consecutive_empty, "No new posts");
                }
            }
            Err(e) => {
                error!("Harvest error: {e:#}");
                consecutive_empty = consecutive_empty.saturating_add(1);
            }
        }

        // Back off while the feeds are quiet
        let interval = if consecutive_empty > 10 {
            max_interval
        } else if consecutive_empty > 5 {
            base_interval.mul_f32(1.5)
        } else {
            base_interval
        };

        tokio::time::sleep(interval).await;
    }
}

/// Crawl every configured account once, then work off the vision queue.
///
/// An account that fails is logged and skipped; the error of the last failing
/// account is returned only if no account succeeded.
///
/// # Errors
///
/// Returns an error if every account failed.
pub async fn poll_once(config: &Config, harvester: &Harvester) -> Result<usize> {
    let mut new_count = 0;
    let mut last_error = None;
    let mut succeeded = 0;

    for account in &config.accounts {
        let request = CrawlRequest::new(account, config.batch_size as i64)
            .with_mode(config.harvest_mode);
        match harvester.crawl_account(&request).await {
            Ok(report) => {
                succeeded += 1;
                new_count += report.inserted;
            }
            Err(e) => {
                error!(account = %account, "Crawl failed: {e:#}");
                last_error = Some(e);
            }
        }
        // Space accounts out a little
        tokio::time::sleep(Duration::from_secs(2).min(config.poll_interval)).await;
    }

    match harvester.drain_vision_queue(VISION_BATCH).await {
        Ok(report) if report.processed > 0 => {
            debug!(processed = report.processed, filled = report.filled, "Vision queue worked off");
        }
        Ok(_) => {}
        Err(e) => error!("Vision queue error: {e:#}"),
    }

    match last_error {
        Some(e) if succeeded == 0 => Err(e),
        _ => Ok(new_count),
    }
}
