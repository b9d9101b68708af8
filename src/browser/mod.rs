pub mod behavior;
pub mod remote;
pub mod session;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::debug;

use crate::cli::config::{BrowserServiceSettings, BrowserSettings};
use crate::crawler::task::{Task, WaitRange};
use remote::RemoteBrowserService;
use session::BrowserSession;

/// Errors callers need to branch on
#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser session lost: {0}")]
    SessionLost(String),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },

    #[error("browser operation timed out after {0}s")]
    Timeout(u64),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BrowserError {
    pub fn is_session_lost(&self) -> bool {
        matches!(self, BrowserError::SessionLost(_))
    }
}

/// Fragments WebDriver and browser services use when the window or session is gone
const SESSION_LOST_MARKERS: &[&str] = &[
    "invalid session id",
    "no such window",
    "session deleted",
    "target window already closed",
    "target closed",
    "chrome not reachable",
    "disconnected",
    "browser has been closed",
];

pub fn looks_like_session_loss(message: &str) -> bool {
    let lowered = message.to_lowercase();
    SESSION_LOST_MARKERS.iter().any(|m| lowered.contains(m))
}

/// Options passed to a page fetch
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOptions {
    /// Elements clicked after load to reveal hidden content
    pub reveal_selectors: Vec<String>,
    pub wait_load: WaitRange,
    pub scroll: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self { reveal_selectors: Vec::new(), wait_load: WaitRange::zero(), scroll: false }
    }
}

/// Result of fetching one detail page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOutcome {
    pub success: bool,
    pub html: String,
    pub title: Option<String>,
    pub status: Option<u16>,
    pub error: Option<String>,
}

impl FetchOutcome {
    pub fn ok(html: impl Into<String>, status: Option<u16>) -> Self {
        Self { success: true, html: html.into(), status, ..Self::default() }
    }

    pub fn failed(error: impl Into<String>, status: Option<u16>) -> Self {
        Self { success: false, error: Some(error.into()), status, ..Self::default() }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Status reported by the fetcher, or parsed out of the error text
    pub fn status_code(&self) -> Option<u16> {
        self.status.or_else(|| self.error.as_deref().and_then(status_from_text))
    }

    pub fn is_session_lost(&self) -> bool {
        self.error.as_deref().map(looks_like_session_loss).unwrap_or(false)
    }
}

/// Pull an HTTP status code out of free-form error text
pub fn status_from_text(text: &str) -> Option<u16> {
    static STATUS_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = STATUS_RE
        .get_or_init(|| Regex::new(r"\b([45]\d{2})\b").ok())
        .as_ref()?;

    re.captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Fetches detail pages
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch a page. Failures the caller should classify come back as an
    /// unsuccessful outcome; `Err` is reserved for broken plumbing.
    async fn fetch(&mut self, url: &str, options: &FetchOptions) -> Result<FetchOutcome>;

    /// Drop and recreate the underlying session
    async fn reset(&mut self) -> Result<()>;

    async fn close(&mut self);
}

/// Drives a listing page in a real browser
#[async_trait]
pub trait ListingBrowser: Send + Sync {
    async fn open(&mut self, url: &str) -> Result<(), BrowserError>;

    async fn current_url(&self) -> Result<String, BrowserError>;

    async fn title(&self) -> Result<String, BrowserError>;

    async fn scroll(&self) -> Result<(), BrowserError>;

    /// `href`s of the elements matching `selector` (or of their first anchor)
    async fn collect_links(&self, selector: &str) -> Result<Vec<String>, BrowserError>;

    /// Click the next-page control. `Ok(false)` when there is none.
    async fn click_next(&self, selector: &str) -> Result<bool, BrowserError>;

    async fn close(&mut self);
}

/// Creates browser collaborators for a run
#[async_trait]
pub trait BrowserFactory: Send + Sync {
    async fn listing_browser(&self, task: &Task) -> Result<Box<dyn ListingBrowser>>;

    async fn page_fetcher(&self, task: &Task) -> Result<Box<dyn PageFetcher>>;
}

/// WebDriver for listings; the remote browser service for details when enabled
pub struct DefaultBrowserFactory {
    browser: BrowserSettings,
    service: BrowserServiceSettings,
}

impl DefaultBrowserFactory {
    pub fn new(browser: BrowserSettings, service: BrowserServiceSettings) -> Self {
        Self { browser, service }
    }
}

#[async_trait]
impl BrowserFactory for DefaultBrowserFactory {
    async fn listing_browser(&self, task: &Task) -> Result<Box<dyn ListingBrowser>> {
        debug!(task_id = task.id, "Opening WebDriver session for listing stage");
        let mut session = BrowserSession::new(self.browser.clone());
        session.initialize().await?;
        Ok(Box::new(session))
    }

    async fn page_fetcher(&self, task: &Task) -> Result<Box<dyn PageFetcher>> {
        if self.service.enabled {
            debug!(task_id = task.id, url = %self.service.url, "Using remote browser service for detail stage");
            return Ok(Box::new(RemoteBrowserService::new(&self.service)?));
        }

        debug!(task_id = task.id, "Opening WebDriver session for detail stage");
        let mut session = BrowserSession::new(self.browser.clone());
        session.initialize().await?;
        Ok(Box::new(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_text() {
        assert_eq!(status_from_text("HTTP 503 Service Unavailable"), Some(503));
        assert_eq!(status_from_text("server answered 404"), Some(404));
        assert_eq!(status_from_text("timeout after 30s"), None);
        assert_eq!(status_from_text("port 5000 refused"), None);
    }

    #[test]
    fn test_outcome_status_prefers_reported_code() {
        let outcome = FetchOutcome::failed("gateway said 502", Some(429));
        assert_eq!(outcome.status_code(), Some(429));

        let outcome = FetchOutcome::failed("gateway said 502", None);
        assert_eq!(outcome.status_code(), Some(502));
    }

    #[test]
    fn test_session_loss_detection() {
        assert!(FetchOutcome::failed("invalid session id: session deleted", None).is_session_lost());
        assert!(FetchOutcome::failed("Target closed", None).is_session_lost());
        assert!(!FetchOutcome::failed("net::ERR_TIMED_OUT", None).is_session_lost());
    }
}
