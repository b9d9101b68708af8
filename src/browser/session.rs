use anyhow::{Result, Context};
use async_trait::async_trait;
use thirtyfour::prelude::*;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::browser::behavior::BehaviorSimulator;
use crate::browser::{
    looks_like_session_loss, BrowserError, FetchOptions, FetchOutcome, ListingBrowser, PageFetcher,
};
use crate::cli::config::BrowserSettings;

/// WebDriver-backed browser session
pub struct BrowserSession {
    config: BrowserSettings,

    behavior_simulator: BehaviorSimulator,

    /// `None` until initialized, and again after quit
    driver: Option<WebDriver>,
}

/// Map a WebDriver failure onto the errors the stages branch on
fn driver_error(err: WebDriverError, url: Option<&str>) -> BrowserError {
    let message = err.to_string();
    if looks_like_session_loss(&message) {
        return BrowserError::SessionLost(message);
    }

    match url {
        Some(url) => BrowserError::Navigation { url: url.to_string(), message },
        None => BrowserError::Other(anyhow::Error::new(err)),
    }
}

impl BrowserSession {
    pub fn new(config: BrowserSettings) -> Self {
        let behavior_simulator = BehaviorSimulator::new(config.behavior.clone());

        Self {
            config,
            behavior_simulator,
            driver: None,
        }
    }

    /// Start a fresh WebDriver session, closing any previous one
    pub async fn initialize(&mut self) -> Result<()> {
        self.quit().await;

        let mut caps = DesiredCapabilities::chrome();

        caps.add_chrome_arg(&format!(
            "--window-size={},{}",
            self.config.viewport.width, self.config.viewport.height
        ))?;
        caps.add_chrome_arg("--disable-dev-shm-usage")?;
        caps.add_chrome_arg("--no-first-run")?;

        if self.config.headless {
            caps.set_headless()?;
        }

        let driver = WebDriver::new(&self.config.webdriver_url, caps).await
            .context(format!("Failed to connect to WebDriver at {}", self.config.webdriver_url))?;

        driver.set_page_load_timeout(Duration::from_secs(self.config.page_load_timeout_secs)).await?;

        debug!("Browser session initialized");

        self.driver = Some(driver);

        Ok(())
    }

    fn driver(&self) -> Result<&WebDriver, BrowserError> {
        self.driver
            .as_ref()
            .ok_or_else(|| BrowserError::SessionLost("browser session not initialized".to_string()))
    }

    /// Close the browser session
    pub async fn quit(&mut self) {
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.quit().await {
                error!("Error closing browser session: {}", e);
            }
            debug!("Browser session closed");
        }
    }

    /// Click every element matching `selector`, ignoring the ones that refuse
    async fn reveal(&self, driver: &WebDriver, selector: &str) {
        let elements = match driver.find_all(By::Css(selector)).await {
            Ok(elements) => elements,
            Err(e) => {
                debug!(selector, "Reveal selector lookup failed: {}", e);
                return;
            }
        };

        for element in elements {
            if let Err(e) = self.behavior_simulator.click(&element).await {
                debug!(selector, "Reveal click failed: {}", e);
            }
        }
    }

    async fn load_detail(&self, url: &str, options: &FetchOptions) -> Result<FetchOutcome, BrowserError> {
        let driver = self.driver()?;

        driver.goto(url).await.map_err(|e| driver_error(e, Some(url)))?;

        let wait = options.wait_load.sample();
        if !wait.is_zero() {
            sleep(wait).await;
        }

        if options.scroll {
            if let Err(e) = self.behavior_simulator.scroll(driver).await {
                debug!(url, "Scroll failed: {}", e);
            }
        }

        for selector in &options.reveal_selectors {
            self.reveal(driver, selector).await;
        }

        let html = driver.source().await.map_err(|e| driver_error(e, Some(url)))?;
        let title = driver.title().await.ok();

        Ok(FetchOutcome { success: true, html, title, status: None, error: None })
    }
}

#[async_trait]
impl ListingBrowser for BrowserSession {
    async fn open(&mut self, url: &str) -> Result<(), BrowserError> {
        if self.driver.is_none() {
            self.initialize().await?;
        }

        debug!("Navigating to: {}", url);
        self.driver()?.goto(url).await.map_err(|e| driver_error(e, Some(url)))
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        let url = self.driver()?.current_url().await.map_err(|e| driver_error(e, None))?;
        Ok(url.to_string())
    }

    async fn title(&self) -> Result<String, BrowserError> {
        self.driver()?.title().await.map_err(|e| driver_error(e, None))
    }

    async fn scroll(&self) -> Result<(), BrowserError> {
        let driver = self.driver()?;
        self.behavior_simulator.scroll(driver).await.map_err(BrowserError::Other)
    }

    async fn collect_links(&self, selector: &str) -> Result<Vec<String>, BrowserError> {
        let driver = self.driver()?;

        let elements = driver.find_all(By::Css(selector)).await
            .map_err(|e| driver_error(e, None))?;

        let mut links = Vec::new();
        for element in elements {
            let href = match element.attr("href").await {
                Ok(Some(href)) => Some(href),
                Ok(None) => match element.find(By::Tag("a")).await {
                    Ok(anchor) => anchor.attr("href").await.ok().flatten(),
                    Err(_) => None,
                },
                Err(e) => {
                    let e = driver_error(e, None);
                    if e.is_session_lost() {
                        return Err(e);
                    }
                    None
                }
            };

            if let Some(href) = href {
                links.push(href);
            }
        }

        Ok(links)
    }

    async fn click_next(&self, selector: &str) -> Result<bool, BrowserError> {
        let driver = self.driver()?;

        let elements = driver.find_all(By::Css(selector)).await
            .map_err(|e| driver_error(e, None))?;

        let Some(next) = elements.into_iter().next() else {
            return Ok(false);
        };

        self.behavior_simulator.click(&next).await.map_err(|e| {
            if looks_like_session_loss(&e.to_string()) {
                BrowserError::SessionLost(e.to_string())
            } else {
                BrowserError::ElementNotFound(format!("{selector}: {e}"))
            }
        })?;

        Ok(true)
    }

    async fn close(&mut self) {
        self.quit().await;
    }
}

#[async_trait]
impl PageFetcher for BrowserSession {
    async fn fetch(&mut self, url: &str, options: &FetchOptions) -> Result<FetchOutcome> {
        if self.driver.is_none() {
            if let Err(e) = self.initialize().await {
                return Ok(FetchOutcome::failed(format!("browser session unavailable: {e:#}"), None));
            }
        }

        match self.load_detail(url, options).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(url, "Detail fetch failed: {}", e);
                Ok(FetchOutcome::failed(e.to_string(), None))
            }
        }
    }

    async fn reset(&mut self) -> Result<()> {
        warn!("Resetting browser session");
        self.initialize().await
    }

    async fn close(&mut self) {
        self.quit().await;
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            // Quitting needs the runtime; skip when dropped outside of one
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = driver.quit().await {
                        error!("Error closing browser session during drop: {}", e);
                    }
                });
            }
        }
    }
}
