use anyhow::{Context, Result};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::{BrowserError, ListingBrowser};
use crate::cli::config::ListingSettings;
use crate::crawler::cancel::CancelToken;
use crate::crawler::runlog::RunLogger;
use crate::crawler::task::{LogStatus, RunStage, Task};
use crate::crawler::template::ListingTemplate;
use crate::crawler::StageEnd;
use crate::storage::queue::WorkQueue;
use crate::storage::url::{normalize_url, resolve_href};

/// Title fragment of the interstitial shown while a challenge runs
const CHALLENGE_TITLE: &str = "just a moment";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingSummary {
    pub pages_crawled: u32,
    pub links_found: u64,
    pub links_added: u64,
    pub end: StageEnd,
}

/// Harvests item URLs from paginated listing pages into the work queue
pub struct ListingStage {
    queue: Arc<dyn WorkQueue>,
    settings: ListingSettings,
}

impl ListingStage {
    pub fn new(queue: Arc<dyn WorkQueue>, settings: ListingSettings) -> Self {
        Self { queue, settings }
    }

    async fn timed<T>(&self, op: impl Future<Output = Result<T, BrowserError>>) -> Result<T, BrowserError> {
        let limit = Duration::from_secs(self.settings.operation_timeout_secs);
        match tokio::time::timeout(limit, op).await {
            Ok(result) => result,
            Err(_) => Err(BrowserError::Timeout(self.settings.operation_timeout_secs)),
        }
    }

    pub async fn run(
        &self,
        browser: &mut dyn ListingBrowser,
        task: &Task,
        start_url: &str,
        template: &ListingTemplate,
        cancel: &CancelToken,
        log: &RunLogger,
    ) -> Result<ListingSummary> {
        let mut summary = ListingSummary {
            pages_crawled: 0,
            links_found: 0,
            links_added: 0,
            end: StageEnd::Finished,
        };

        self.timed(browser.open(start_url))
            .await
            .context(format!("Failed to open {}", start_url))?;

        if !self.wait_for_challenge(browser, cancel).await {
            summary.end = StageEnd::Cancelled;
            return Ok(summary);
        }

        let max_pages = task.listing.max_pages.max(1);
        let mut seen = HashSet::new();

        for page in 1..=max_pages {
            if cancel.is_cancelled().await {
                summary.end = StageEnd::Cancelled;
                break;
            }

            if !cancel.sleep(task.listing.wait_load.sample()).await {
                summary.end = StageEnd::Cancelled;
                break;
            }

            match self.harvest_page(browser, task, template, &mut seen).await {
                Ok((found, added)) => {
                    summary.pages_crawled += 1;
                    summary.links_found += found;
                    summary.links_added += added;
                    log.log(
                        RunStage::Listing,
                        LogStatus::Info,
                        format!("Page {}: {} links, {} new", page, found, added),
                    )
                    .await;
                }
                Err(e) if e.is_session_lost() => {
                    log.log(RunStage::Listing, LogStatus::Error, format!("Page {}: {}", page, e)).await;
                    break;
                }
                Err(e) => {
                    log.log(RunStage::Listing, LogStatus::Error, format!("Page {}: {}", page, e)).await;
                }
            }

            if page == max_pages {
                break;
            }

            let Some(next_selector) = template.next_selector() else {
                debug!(task_id = task.id, "No next page selector");
                break;
            };

            if !cancel.sleep(task.listing.wait_next.sample()).await {
                summary.end = StageEnd::Cancelled;
                break;
            }

            match self.timed(browser.click_next(next_selector)).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(task_id = task.id, page, "No next page control, listing finished");
                    break;
                }
                Err(e) => {
                    log.log(RunStage::Listing, LogStatus::Error, format!("Next page after {}: {}", page, e))
                        .await;
                    break;
                }
            }
        }

        Ok(summary)
    }

    /// Poll the title until the challenge interstitial clears.
    /// Returns false when cancelled while waiting.
    async fn wait_for_challenge(&self, browser: &dyn ListingBrowser, cancel: &CancelToken) -> bool {
        let pause = Duration::from_secs(self.settings.challenge_poll_secs);

        for attempt in 0..self.settings.challenge_polls {
            let title = match self.timed(browser.title()).await {
                Ok(title) => title,
                Err(e) => {
                    debug!("Could not read page title: {}", e);
                    return true;
                }
            };

            if !title.to_lowercase().contains(CHALLENGE_TITLE) {
                return true;
            }

            debug!(attempt, "Challenge page still showing");
            if !cancel.sleep(pause).await {
                return false;
            }
        }

        warn!("Challenge page did not clear, continuing anyway");
        true
    }

    /// Collect, resolve and enqueue the items of the current page.
    /// Returns (links new to this run, links new to the queue).
    async fn harvest_page(
        &self,
        browser: &dyn ListingBrowser,
        task: &Task,
        template: &ListingTemplate,
        seen: &mut HashSet<String>,
    ) -> Result<(u64, u64), BrowserError> {
        if task.listing.fake_scroll {
            if let Err(e) = self.timed(browser.scroll()).await {
                if e.is_session_lost() {
                    return Err(e);
                }
                debug!("Scroll failed: {}", e);
            }
        }

        let hrefs = self.timed(browser.collect_links(&template.item_selector)).await?;
        let page_url = self.timed(browser.current_url()).await?;
        let base = Url::parse(&page_url)
            .map_err(|e| BrowserError::Other(anyhow::anyhow!("Invalid page URL {}: {}", page_url, e)))?;

        let mut fresh = Vec::new();
        for href in &hrefs {
            let Some(resolved) = resolve_href(&base, href) else {
                continue;
            };
            let Ok(normalized) = normalize_url(resolved.as_str()) else {
                continue;
            };
            if seen.insert(normalized.clone()) {
                fresh.push(normalized);
            }
        }

        let added = if fresh.is_empty() {
            0
        } else {
            self.queue.insert_links(&fresh, &task.partition).await?
        };

        debug!(
            task_id = task.id,
            url = %page_url,
            collected = hrefs.len(),
            fresh = fresh.len(),
            added,
            "Harvested listing page"
        );

        Ok((fresh.len() as u64, added))
    }
}
