use anyhow::{Result, Context};
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::cli::config::ImageSettings;
use crate::crawler::cancel::CancelToken;
use crate::crawler::runlog::RunLogger;
use crate::crawler::task::{ImageRecord, ImageStatus, LogStatus, RunStage, Task};
use crate::crawler::StageEnd;
use crate::storage::records::RecordStore;

const DEFAULT_EXTENSION: &str = "jpg";

/// Fetches image bytes and stores them under a content-independent name
pub struct ImageDownloader {
    client: Client,
}

impl ImageDownloader {
    pub fn new(settings: &ImageSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .user_agent(settings.user_agent.clone())
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }

    /// SHA-256 of the source URL plus its extension, so a re-download
    /// overwrites the same file
    pub fn file_name_for(image_url: &str) -> String {
        let digest = hex::encode(Sha256::digest(image_url.as_bytes()));

        let extension = Url::parse(image_url)
            .ok()
            .and_then(|u| {
                u.path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_string))
            })
            .and_then(|name| name.rsplit_once('.').map(|(_, ext)| ext.to_lowercase()))
            .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());

        format!("{}.{}", digest, extension)
    }

    pub async fn download(&self, image_url: &str, dir: &Path) -> Result<PathBuf> {
        let response = self
            .client
            .get(image_url)
            .send()
            .await
            .context(format!("Request for {} failed", image_url))?
            .error_for_status()
            .context(format!("Download of {} failed", image_url))?;

        let bytes = response
            .bytes()
            .await
            .context(format!("Failed to read body of {}", image_url))?;

        tokio::fs::create_dir_all(dir)
            .await
            .context(format!("Failed to create image directory {}", dir.display()))?;

        let path = dir.join(Self::file_name_for(image_url));
        tokio::fs::write(&path, &bytes)
            .await
            .context(format!("Failed to write {}", path.display()))?;

        Ok(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    pub downloaded: usize,
    /// Images still failed at the end of the stage
    pub failed: usize,
    pub end: StageEnd,
}

/// Downloads the images of stored detail records at a fixed rate
pub struct ImageStage {
    records: Arc<dyn RecordStore>,
    downloader: ImageDownloader,
    settings: ImageSettings,
}

impl ImageStage {
    pub fn new(records: Arc<dyn RecordStore>, settings: ImageSettings) -> Result<Self> {
        let downloader = ImageDownloader::new(&settings)?;
        Ok(Self { records, downloader, settings })
    }

    pub async fn run(
        &self,
        task: &Task,
        image_dir: &Path,
        cancel: &CancelToken,
        log: &RunLogger,
    ) -> Result<ImageSummary> {
        let mut summary = ImageSummary { downloaded: 0, failed: 0, end: StageEnd::Finished };
        let interval = Duration::from_secs_f64(60.0 / f64::from(task.image.images_per_minute.max(1)));
        let domain = task.partition.domain.as_deref();
        let mut first = true;
        // Images whose latest attempt in this stage failed
        let mut still_failed = HashSet::new();

        // Pass 1: everything not yet attempted
        loop {
            let pending = self.records.pending_images(self.settings.batch_limit, domain).await?;
            if pending.is_empty() {
                break;
            }
            if !self.download_batch(&pending, image_dir, interval, &mut first, cancel, &mut summary, &mut still_failed).await? {
                summary.failed = still_failed.len();
                summary.end = StageEnd::Cancelled;
                return Ok(summary);
            }
        }

        // Pass 2: earlier failures with attempts left
        for pass in 1..=self.settings.retry_passes {
            let failed = self
                .records
                .failed_images(self.settings.batch_limit, self.settings.max_attempts, domain)
                .await?;
            if failed.is_empty() {
                break;
            }

            debug!(task_id = task.id, pass, images = failed.len(), "Retrying failed images");
            if !self.download_batch(&failed, image_dir, interval, &mut first, cancel, &mut summary, &mut still_failed).await? {
                summary.failed = still_failed.len();
                summary.end = StageEnd::Cancelled;
                return Ok(summary);
            }
        }

        summary.failed = still_failed.len();
        if summary.failed > 0 {
            log.log(
                RunStage::Image,
                LogStatus::Info,
                format!("{} images could not be downloaded", summary.failed),
            )
            .await;
        }

        info!(
            task_id = task.id,
            downloaded = summary.downloaded,
            failed = summary.failed,
            "Image stage finished"
        );

        Ok(summary)
    }

    /// `Ok(false)` when cancelled
    #[allow(clippy::too_many_arguments)]
    async fn download_batch(
        &self,
        images: &[ImageRecord],
        image_dir: &Path,
        interval: Duration,
        first: &mut bool,
        cancel: &CancelToken,
        summary: &mut ImageSummary,
        still_failed: &mut HashSet<i64>,
    ) -> Result<bool> {
        for image in images {
            if cancel.is_cancelled().await {
                return Ok(false);
            }

            if !*first && !cancel.sleep(interval).await {
                return Ok(false);
            }
            *first = false;

            match self.downloader.download(&image.image_url, image_dir).await {
                Ok(path) => {
                    let path = path.to_string_lossy();
                    self.records
                        .record_image(image.id, ImageStatus::Downloaded, Some(path.as_ref()), None)
                        .await?;
                    debug!(image_id = image.id, url = %image.image_url, "Downloaded image");
                    summary.downloaded += 1;
                    still_failed.remove(&image.id);
                }
                Err(e) => {
                    let message = format!("{:#}", e);
                    warn!(image_id = image.id, url = %image.image_url, attempt = image.attempts + 1, "Image download failed: {}", message);
                    self.records
                        .record_image(image.id, ImageStatus::Failed, None, Some(&message))
                        .await?;
                    still_failed.insert(image.id);
                }
            }
        }

        Ok(true)
    }
}
