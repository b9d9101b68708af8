use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::browser::{FetchOptions, FetchOutcome, PageFetcher};
use crate::cli::config::DetailSettings;
use crate::crawler::block::{BlockClassifier, Verdict};
use crate::crawler::cancel::CancelToken;
use crate::crawler::extract::FieldExtractor;
use crate::crawler::runlog::RunLogger;
use crate::crawler::task::{DetailDraft, LinkStatus, LogStatus, QueuedLink, RunStage, Task, WaitRange};
use crate::crawler::template::DetailTemplate;
use crate::crawler::StageEnd;
use crate::storage::queue::WorkQueue;
use crate::storage::records::RecordStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailSummary {
    pub leased: usize,
    pub crawled: usize,
    pub failed: usize,
    pub end: StageEnd,
}

/// What happened to a single leased link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkOutcome {
    Crawled,
    Failed,
    Blocked,
    Cancelled,
}

/// Leases queued links in batches and scrapes each into a detail record
pub struct DetailStage {
    queue: Arc<dyn WorkQueue>,
    records: Arc<dyn RecordStore>,
    extractor: Arc<dyn FieldExtractor>,
    classifier: BlockClassifier,
    settings: DetailSettings,
    batch_size: usize,
}

impl DetailStage {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        records: Arc<dyn RecordStore>,
        extractor: Arc<dyn FieldExtractor>,
        classifier: BlockClassifier,
        settings: DetailSettings,
        batch_size: usize,
    ) -> Self {
        Self {
            queue,
            records,
            extractor,
            classifier,
            settings,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn run(
        &self,
        fetcher: &mut dyn PageFetcher,
        task: &Task,
        template: &DetailTemplate,
        cancel: &CancelToken,
        log: &RunLogger,
    ) -> Result<DetailSummary> {
        let mut summary = DetailSummary { leased: 0, crawled: 0, failed: 0, end: StageEnd::Finished };

        let options = FetchOptions {
            reveal_selectors: template.reveal_selectors.clone(),
            wait_load: task.detail.wait_load,
            scroll: false,
        };

        'batches: loop {
            if cancel.is_cancelled().await {
                summary.end = StageEnd::Cancelled;
                break;
            }

            let batch = self.queue.acquire_pending(self.batch_size, &task.partition).await?;
            if batch.is_empty() {
                debug!(task_id = task.id, "No pending links left");
                break;
            }

            summary.leased += batch.len();
            debug!(task_id = task.id, leased = batch.len(), "Leased batch");

            for (i, link) in batch.iter().enumerate() {
                let outcome = match self.process_link(fetcher, task, link, template, &options, cancel, log).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        self.release_rest(&batch[i..]).await;
                        return Err(e);
                    }
                };

                match outcome {
                    LinkOutcome::Crawled => summary.crawled += 1,
                    LinkOutcome::Failed => summary.failed += 1,
                    LinkOutcome::Cancelled => {
                        self.release_rest(&batch[i..]).await;
                        summary.end = StageEnd::Cancelled;
                        break 'batches;
                    }
                    LinkOutcome::Blocked => {
                        summary.failed += 1;
                        self.release_rest(&batch[i + 1..]).await;
                        summary.end = StageEnd::Blocked;
                        break 'batches;
                    }
                }
            }
        }

        info!(
            task_id = task.id,
            leased = summary.leased,
            crawled = summary.crawled,
            failed = summary.failed,
            end = ?summary.end,
            "Detail stage finished"
        );

        Ok(summary)
    }

    /// Put unprocessed links back to PENDING
    async fn release_rest(&self, links: &[QueuedLink]) {
        if links.is_empty() {
            return;
        }
        let ids: Vec<i64> = links.iter().map(|l| l.id).collect();
        match self.queue.release(&ids).await {
            Ok(released) => debug!(released, "Released unprocessed links"),
            Err(e) => warn!("Failed to release {} links, stale recovery will reclaim them: {:#}", ids.len(), e),
        }
    }

    async fn fetch(&self, fetcher: &mut dyn PageFetcher, url: &str, options: &FetchOptions) -> FetchOutcome {
        let limit = Duration::from_secs(self.settings.fetch_timeout_secs);
        match tokio::time::timeout(limit, fetcher.fetch(url, options)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => FetchOutcome::failed(format!("{:#}", e), None),
            Err(_) => FetchOutcome::failed(format!("fetch timed out after {}s", self.settings.fetch_timeout_secs), None),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_link(
        &self,
        fetcher: &mut dyn PageFetcher,
        task: &Task,
        link: &QueuedLink,
        template: &DetailTemplate,
        options: &FetchOptions,
        cancel: &CancelToken,
        log: &RunLogger,
    ) -> Result<LinkOutcome> {
        let attempts = task.detail.max_retries.max(1);
        let retry_pause = WaitRange::new(self.settings.retry_pause_min_secs, self.settings.retry_pause_max_secs);

        let mut attempt = 0;
        loop {
            attempt += 1;

            if !cancel.sleep(task.detail.delay.sample()).await {
                return Ok(LinkOutcome::Cancelled);
            }

            let outcome = self.fetch(fetcher, &link.url, options).await;

            // A page that finished loading after cancellation is not recorded
            if cancel.is_cancelled().await {
                return Ok(LinkOutcome::Cancelled);
            }

            let status = outcome.status_code();
            match self.classifier.classify_outcome(&outcome) {
                Verdict::Ok => return self.persist(link, template, &outcome.html, log).await,
                Verdict::Blocked => {
                    self.queue.mark(link.id, LinkStatus::Error).await?;
                    log.log(
                        RunStage::Detail,
                        LogStatus::Error,
                        format!("Anti-bot block at {} (status {})", link.url, status_label(status)),
                    )
                    .await;
                    return Ok(LinkOutcome::Blocked);
                }
                Verdict::Fatal => {
                    self.queue.mark(link.id, LinkStatus::Error).await?;
                    warn!(
                        task_id = task.id,
                        link_id = link.id,
                        url = %link.url,
                        status = %status_label(status),
                        "Detail fetch failed permanently: {}",
                        outcome.error.as_deref().unwrap_or("empty page")
                    );
                    return Ok(LinkOutcome::Failed);
                }
                Verdict::Transient => {
                    let reason = outcome.error.as_deref().unwrap_or("transient failure");
                    if attempt >= attempts {
                        self.queue.mark(link.id, LinkStatus::Error).await?;
                        log.log(
                            RunStage::Detail,
                            LogStatus::Error,
                            format!("{} failed after {} attempts (status {}): {}", link.url, attempts, status_label(status), reason),
                        )
                        .await;
                        return Ok(LinkOutcome::Failed);
                    }

                    debug!(link_id = link.id, attempt, status = %status_label(status), "Retrying: {}", reason);

                    if outcome.is_session_lost() {
                        warn!(task_id = task.id, "Browser session lost, resetting");
                        if let Err(e) = fetcher.reset().await {
                            warn!(task_id = task.id, "Browser reset failed: {:#}", e);
                        }
                    }

                    if !cancel.sleep(retry_pause.sample()).await {
                        return Ok(LinkOutcome::Cancelled);
                    }
                }
            }
        }
    }

    async fn persist(
        &self,
        link: &QueuedLink,
        template: &DetailTemplate,
        html: &str,
        log: &RunLogger,
    ) -> Result<LinkOutcome> {
        let extracted = match self.extractor.extract(html, template, &link.url) {
            Ok(extracted) => extracted,
            Err(e) => {
                self.queue.mark(link.id, LinkStatus::Error).await?;
                log.log(RunStage::Detail, LogStatus::Error, format!("Extraction failed for {}: {}", link.url, e)).await;
                return Ok(LinkOutcome::Failed);
            }
        };

        let draft = DetailDraft {
            link_id: link.id,
            url: link.url.clone(),
            domain: link.domain.clone(),
            fields: Value::Object(extracted.values),
            images: extracted.images,
        };

        match self.records.insert_detail(&draft).await {
            Ok(detail_id) => {
                self.queue.mark(link.id, LinkStatus::Crawled).await?;
                debug!(link_id = link.id, detail_id, images = draft.images.len(), "Stored detail record");
                Ok(LinkOutcome::Crawled)
            }
            Err(e) => {
                self.queue.mark(link.id, LinkStatus::Error).await?;
                log.log(RunStage::Detail, LogStatus::Error, format!("Failed to store {}: {:#}", link.url, e)).await;
                Ok(LinkOutcome::Failed)
            }
        }
    }
}

fn status_label(status: Option<u16>) -> String {
    status.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string())
}
