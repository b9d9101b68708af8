use anyhow::{Result, Context};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Serialize, Deserialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::browser::{FetchOptions, FetchOutcome, PageFetcher};
use crate::cli::config::BrowserServiceSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserServiceRequest {
    pub url: String,
    pub reveal_selectors: Vec<String>,
    pub wait_load_min: f64,
    pub wait_load_max: f64,
    pub scroll: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserServiceResponse {
    pub success: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub error: Option<String>,
}

impl From<BrowserServiceResponse> for FetchOutcome {
    fn from(response: BrowserServiceResponse) -> Self {
        FetchOutcome {
            success: response.success,
            html: response.content,
            title: response.title,
            status: response.status_code,
            error: response.error,
        }
    }
}

/// Detail fetcher backed by an HTTP browser service (`POST {url}/crawl`)
pub struct RemoteBrowserService {
    client: Client,
    base_url: String,
}

impl RemoteBrowserService {
    pub fn new(settings: &BrowserServiceSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: settings.url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn crawl_url(&self, url: &str, options: &FetchOptions) -> Result<BrowserServiceResponse> {
        let endpoint = format!("{}/crawl", self.base_url);

        let request = BrowserServiceRequest {
            url: url.to_string(),
            reveal_selectors: options.reveal_selectors.clone(),
            wait_load_min: options.wait_load.min,
            wait_load_max: options.wait_load.max,
            scroll: options.scroll,
        };

        debug!("Sending request to browser service: {}", url);

        let response = self.client.post(&endpoint)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to browser service")?;

        let http_status = response.status();
        let body = response.text()
            .await
            .context("Failed to read browser service response")?;

        match serde_json::from_str::<BrowserServiceResponse>(&body) {
            Ok(parsed) => Ok(parsed),
            Err(_) if !http_status.is_success() => {
                anyhow::bail!("Browser service returned HTTP {}", http_status.as_u16())
            }
            Err(e) => Err(e).context("Failed to parse browser service response"),
        }
    }
}

#[async_trait]
impl PageFetcher for RemoteBrowserService {
    async fn fetch(&mut self, url: &str, options: &FetchOptions) -> Result<FetchOutcome> {
        match self.crawl_url(url, options).await {
            Ok(response) => {
                if !response.success {
                    warn!(url, status = ?response.status_code, "Browser service error: {}", response.error.as_deref().unwrap_or("unknown error"));
                }
                Ok(response.into())
            }
            // Transport failures are transient; let the classifier decide
            Err(e) => Ok(FetchOutcome::failed(format!("{e:#}"), None)),
        }
    }

    async fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn service(url: &str) -> RemoteBrowserService {
        RemoteBrowserService::new(&BrowserServiceSettings {
            enabled: true,
            url: url.to_string(),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_maps_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/crawl"))
            .and(body_partial_json(serde_json::json!({ "url": "https://example.com/flat/1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "url": "https://example.com/flat/1",
                "title": "Flat 1",
                "content": "<html><body><h1>Flat 1</h1></body></html>",
                "status_code": 200
            })))
            .mount(&server)
            .await;

        let mut fetcher = service(&server.uri());
        let outcome = fetcher
            .fetch("https://example.com/flat/1", &FetchOptions::default())
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.status, Some(200));
        assert_eq!(outcome.title.as_deref(), Some("Flat 1"));
        assert!(outcome.html.contains("<h1>Flat 1</h1>"));
    }

    #[tokio::test]
    async fn test_service_failure_becomes_unsuccessful_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/crawl"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let mut fetcher = service(&server.uri());
        let outcome = fetcher
            .fetch("https://example.com/flat/2", &FetchOptions::default())
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.status_code(), Some(502));
    }
}
