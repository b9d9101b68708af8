#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use listing_harvester::browser::{
    BrowserError, BrowserFactory, FetchOptions, FetchOutcome, ListingBrowser, PageFetcher,
};
use listing_harvester::cli::config::AppConfig;
use listing_harvester::crawler::extract::CssFieldExtractor;
use listing_harvester::crawler::task::{Partition, Task, TaskDefinition, WaitRange};
use listing_harvester::crawler::CrawlerController;
use listing_harvester::storage::memory::MemoryStore;
use listing_harvester::storage::Storage;

pub const DETAIL_PAGE: &str =
    r#"<html><head><title>Flat</title></head><body><h1>Sunny flat</h1><span class="price">250000</span></body></html>"#;

/// How the fake page fetcher answers
#[derive(Clone)]
pub enum FetchBehavior {
    Succeed,
    /// Small 503 body
    Block,
    /// Ask the store to cancel the task, then succeed
    CancelTask { store: Arc<MemoryStore>, task_id: i64 },
    Panic,
}

/// Listing browser serving one page of canned links
pub struct FakeListingBrowser {
    links: Vec<String>,
}

#[async_trait]
impl ListingBrowser for FakeListingBrowser {
    async fn open(&mut self, _url: &str) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        Ok("https://homes.example.com/sale?page=1".into())
    }

    async fn title(&self) -> Result<String, BrowserError> {
        Ok("Homes for sale".into())
    }

    async fn scroll(&self) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn collect_links(&self, _selector: &str) -> Result<Vec<String>, BrowserError> {
        Ok(self.links.clone())
    }

    async fn click_next(&self, _selector: &str) -> Result<bool, BrowserError> {
        Ok(false)
    }

    async fn close(&mut self) {}
}

pub struct FakePageFetcher {
    behavior: FetchBehavior,
    fetches: Arc<AtomicUsize>,
}

#[async_trait]
impl PageFetcher for FakePageFetcher {
    async fn fetch(&mut self, _url: &str, _options: &FetchOptions) -> Result<FetchOutcome> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            FetchBehavior::Succeed => Ok(FetchOutcome::ok(DETAIL_PAGE, Some(200))),
            FetchBehavior::Block => Ok(FetchOutcome::failed("HTTP 503 Service Unavailable", Some(503))),
            FetchBehavior::CancelTask { store, task_id } => {
                use listing_harvester::storage::tasks::TaskStore;
                store.request_cancel(*task_id).await?;
                Ok(FetchOutcome::ok(DETAIL_PAGE, Some(200)))
            }
            FetchBehavior::Panic => panic!("browser driver exploded"),
        }
    }

    async fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) {}
}

/// Hands out fakes and counts page fetches
pub struct FakeBrowsers {
    pub links: Vec<String>,
    pub behavior: Mutex<FetchBehavior>,
    pub fetches: Arc<AtomicUsize>,
}

impl FakeBrowsers {
    pub fn new(links: Vec<String>, behavior: FetchBehavior) -> Self {
        Self {
            links,
            behavior: Mutex::new(behavior),
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserFactory for FakeBrowsers {
    async fn listing_browser(&self, _task: &Task) -> Result<Box<dyn ListingBrowser>> {
        Ok(Box::new(FakeListingBrowser { links: self.links.clone() }))
    }

    async fn page_fetcher(&self, _task: &Task) -> Result<Box<dyn PageFetcher>> {
        let behavior = self
            .behavior
            .lock()
            .map_err(|_| anyhow::anyhow!("behavior lock poisoned"))?
            .clone();
        Ok(Box::new(FakePageFetcher { behavior, fetches: self.fetches.clone() }))
    }
}

/// Configuration with every wait shortened for tests
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.database.storage_type = "memory".into();
    config.scheduler.launch_spacing_secs = 0;
    config.scheduler.cancel_poll_interval_ms = 0;
    config.scheduler.poll_interval_secs = 1;
    config.scheduler.shutdown_grace_secs = 5;
    config.listing.challenge_poll_secs = 0;
    config.detail.retry_pause_min_secs = 0.0;
    config.detail.retry_pause_max_secs = 0.0;
    config
}

/// Listing and detail templates written into `dir`
pub fn write_templates(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let listing = dir.join("listing.json");
    std::fs::write(&listing, r#"{"itemSelector": "a.card", "nextPageSelector": "a.next"}"#).unwrap();

    let detail = dir.join("detail.json");
    std::fs::write(
        &detail,
        r#"{"fields": [{"name": "title", "selector": "h1"}, {"name": "price", "selector": ".price"}]}"#,
    )
    .unwrap();

    (listing, detail)
}

/// A task that harvests the fake listing and scrapes its details without waiting
pub fn pipeline_definition(name: &str, listing: &Path, detail: &Path) -> TaskDefinition {
    let mut def = TaskDefinition::from_yaml(&format!("name: {}\n", name)).unwrap();
    def.partition = Partition::new(Some("homes.example.com".into()), Some("sale".into()));
    def.listing.start_url = Some("https://homes.example.com/sale".into());
    def.listing.template_path = Some(listing.to_path_buf());
    def.listing.wait_load = WaitRange::zero();
    def.listing.wait_next = WaitRange::zero();
    def.listing.fake_scroll = false;
    def.detail.template_path = Some(detail.to_path_buf());
    def.detail.wait_load = WaitRange::zero();
    def.detail.delay = WaitRange::zero();
    def
}

pub fn partition() -> Partition {
    Partition::new(Some("homes.example.com".into()), Some("sale".into()))
}

pub fn item_links(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("/sale/flat-{}", i)).collect()
}

pub fn controller(store: &Arc<MemoryStore>, browsers: Arc<FakeBrowsers>) -> Arc<CrawlerController> {
    Arc::new(CrawlerController::new(
        test_config(),
        Storage::in_memory(store.clone()),
        browsers,
        Arc::new(CssFieldExtractor),
    ))
}
