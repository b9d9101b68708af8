use anyhow::{Result, Context};
use chrono::{DateTime, Local, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::browser::BrowserFactory;
use crate::cli::config::AppConfig;
use crate::crawler::block::BlockClassifier;
use crate::crawler::cancel::{CancelToken, Heartbeat};
use crate::crawler::detail::DetailStage;
use crate::crawler::extract::FieldExtractor;
use crate::crawler::images::ImageStage;
use crate::crawler::listing::ListingStage;
use crate::crawler::runlog::RunLogger;
use crate::crawler::task::{LogStatus, RunStage, Task};
use crate::crawler::template::{DetailTemplate, ListingTemplate};
use crate::crawler::StageEnd;
use crate::storage::{Storage, TaskClaim};
use crate::utils::Notifier;

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Blocked,
}

/// Runs the listing, detail and image stages of one claimed task
pub struct CrawlerController {
    config: AppConfig,
    storage: Storage,
    browsers: Arc<dyn BrowserFactory>,
    extractor: Arc<dyn FieldExtractor>,
    notifier: Arc<Notifier>,
}

impl CrawlerController {
    pub fn new(
        config: AppConfig,
        storage: Storage,
        browsers: Arc<dyn BrowserFactory>,
        extractor: Arc<dyn FieldExtractor>,
    ) -> Self {
        let notifier = Arc::new(Notifier::new(&config.notifications));
        Self { config, storage, browsers, extractor, notifier }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// Execute one run of a claimed task and hand the task back to the schedule
    pub async fn run_task(&self, claim: TaskClaim, shutdown: &CancellationToken) -> Result<RunOutcome> {
        let task_id = claim.task_id();
        let task = match self.storage.tasks.get_task(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                claim.abandon().await?;
                anyhow::bail!("Task {} disappeared before its run started", task_id);
            }
            Err(e) => {
                claim.abandon().await?;
                return Err(e).context(format!("Failed to load task {}", task_id));
            }
        };

        let started_at = Utc::now();
        let log = RunLogger::new(self.storage.tasks.clone(), task_id);
        let cancel = CancelToken::new(
            task_id,
            self.storage.tasks.clone(),
            shutdown,
            self.config.scheduler.cancel_poll_interval(),
        );

        if task.flags.run_now {
            log.log(RunStage::Task, LogStatus::RunNow, "Manual run requested").await;
        }
        log.log(
            RunStage::Task,
            LogStatus::Start,
            format!("Run of '{}' started ({})", task.name, task.schedule.describe()),
        )
        .await;

        let heartbeat = Heartbeat::spawn(
            self.storage.tasks.clone(),
            task_id,
            self.config.scheduler.heartbeat_interval(),
        );
        let end = self.run_stages(&task, &cancel, &log).await;
        heartbeat.stop().await;

        let next_run_at = task.schedule.next_run(started_at);
        claim.finish(started_at, next_run_at).await?;

        let next = format_local(next_run_at);
        let outcome = match end {
            StageEnd::Finished => {
                log.log(RunStage::Task, LogStatus::Done, format!("Run finished, next run at {}", next)).await;
                self.notifier.send(&format!("Task {} done. Next run at {}", task.name, next)).await;
                RunOutcome::Completed
            }
            StageEnd::Cancelled => {
                log.log(RunStage::Task, LogStatus::Cancel, format!("Run cancelled, next run at {}", next)).await;
                RunOutcome::Cancelled
            }
            StageEnd::Blocked => {
                log.log(
                    RunStage::Task,
                    LogStatus::Cancel,
                    format!("Anti-bot block detected, next run at {}", next),
                )
                .await;
                RunOutcome::Blocked
            }
        };

        Ok(outcome)
    }

    /// Listing, detail, image. A stage error is logged and the next stage
    /// still runs; cancellation and blocks end the run.
    async fn run_stages(&self, task: &Task, cancel: &CancelToken, log: &RunLogger) -> StageEnd {
        if cancel.is_cancelled().await {
            return StageEnd::Cancelled;
        }
        if let Some(end) = self.listing(task, cancel, log).await {
            return end;
        }

        if cancel.is_cancelled().await {
            return StageEnd::Cancelled;
        }
        if let Some(end) = self.detail(task, cancel, log).await {
            return end;
        }

        if cancel.is_cancelled().await {
            return StageEnd::Cancelled;
        }
        if let Some(end) = self.images(task, cancel, log).await {
            return end;
        }

        StageEnd::Finished
    }

    /// Returns the end of the run when the stage stopped it
    async fn listing(&self, task: &Task, cancel: &CancelToken, log: &RunLogger) -> Option<StageEnd> {
        if !task.stages.listing {
            log.log(RunStage::Listing, LogStatus::Skip, "Stage disabled").await;
            return None;
        }
        let Some(start_url) = task.listing.start_url.as_deref() else {
            log.log(RunStage::Listing, LogStatus::Skip, "No start URL configured").await;
            return None;
        };
        let Some(path) = task.listing.template_path.as_deref() else {
            log.log(RunStage::Listing, LogStatus::Skip, "No listing template configured").await;
            return None;
        };
        let template = match ListingTemplate::load(path) {
            Ok(template) => template,
            Err(e) => {
                log.log(RunStage::Listing, LogStatus::Skip, format!("Listing template unusable: {}", e)).await;
                return None;
            }
        };

        log.log(RunStage::Listing, LogStatus::Start, format!("Harvesting {}", start_url)).await;

        let stage = ListingStage::new(self.storage.queue.clone(), self.config.listing.clone());
        let result = async {
            let mut browser = self.browsers.listing_browser(task).await?;
            let result = stage.run(browser.as_mut(), task, start_url, &template, cancel, log).await;
            browser.close().await;
            result
        }
        .await;

        match result {
            Ok(summary) => {
                log.log(
                    RunStage::Listing,
                    LogStatus::Ok,
                    format!(
                        "{} pages, {} links found, {} new",
                        summary.pages_crawled, summary.links_found, summary.links_added
                    ),
                )
                .await;
                (summary.end != StageEnd::Finished).then_some(summary.end)
            }
            Err(e) => {
                log.log(RunStage::Listing, LogStatus::Error, format!("{:#}", e)).await;
                None
            }
        }
    }

    async fn detail(&self, task: &Task, cancel: &CancelToken, log: &RunLogger) -> Option<StageEnd> {
        if !task.stages.detail {
            log.log(RunStage::Detail, LogStatus::Skip, "Stage disabled").await;
            return None;
        }
        let Some(path) = task.detail.template_path.as_deref() else {
            log.log(RunStage::Detail, LogStatus::Skip, "No detail template configured").await;
            return None;
        };
        let template = match DetailTemplate::load(path) {
            Ok(template) => template,
            Err(e) => {
                log.log(RunStage::Detail, LogStatus::Skip, format!("Detail template unusable: {}", e)).await;
                return None;
            }
        };

        log.log(RunStage::Detail, LogStatus::Start, "Processing queued links").await;

        let stage = DetailStage::new(
            self.storage.queue.clone(),
            self.storage.records.clone(),
            self.extractor.clone(),
            BlockClassifier::new(self.config.detection.clone()),
            self.config.detail.clone(),
            self.config.queue.batch_size,
        );
        let result = async {
            let mut fetcher = self.browsers.page_fetcher(task).await?;
            let result = stage.run(fetcher.as_mut(), task, &template, cancel, log).await;
            fetcher.close().await;
            result
        }
        .await;

        match result {
            Ok(summary) => {
                log.log(
                    RunStage::Detail,
                    LogStatus::Ok,
                    format!("{} leased, {} crawled, {} failed", summary.leased, summary.crawled, summary.failed),
                )
                .await;
                (summary.end != StageEnd::Finished).then_some(summary.end)
            }
            Err(e) => {
                log.log(RunStage::Detail, LogStatus::Error, format!("{:#}", e)).await;
                None
            }
        }
    }

    async fn images(&self, task: &Task, cancel: &CancelToken, log: &RunLogger) -> Option<StageEnd> {
        if !task.stages.image {
            log.log(RunStage::Image, LogStatus::Skip, "Stage disabled").await;
            return None;
        }
        let Some(dir) = task.image.image_dir.clone() else {
            log.log(RunStage::Image, LogStatus::Skip, "No image directory configured").await;
            return None;
        };

        log.log(RunStage::Image, LogStatus::Start, format!("Downloading into {}", dir.display())).await;

        match self.download_images(task, dir, cancel, log).await {
            Ok(summary) => {
                log.log(
                    RunStage::Image,
                    LogStatus::Ok,
                    format!("{} downloaded, {} failed", summary.downloaded, summary.failed),
                )
                .await;
                (summary.end != StageEnd::Finished).then_some(summary.end)
            }
            Err(e) => {
                log.log(RunStage::Image, LogStatus::Error, format!("{:#}", e)).await;
                None
            }
        }
    }

    async fn download_images(
        &self,
        task: &Task,
        dir: PathBuf,
        cancel: &CancelToken,
        log: &RunLogger,
    ) -> Result<crate::crawler::images::ImageSummary> {
        let stage = ImageStage::new(self.storage.records.clone(), self.config.images.clone())?;
        debug!(task_id = task.id, dir = %dir.display(), "Starting image stage");
        stage.run(task, &dir, cancel, log).await
    }
}

fn format_local(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}
