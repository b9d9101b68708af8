use anyhow::Result;
use rand::{thread_rng, Rng};
use std::time::Duration;
use tokio::time::sleep;
use thirtyfour::prelude::*;
use tracing::debug;

use crate::cli::config::BrowserBehavior;

/// Human-like pacing for listing pages
pub struct BehaviorSimulator {
    config: BrowserBehavior,
}

impl BehaviorSimulator {
    pub fn new(config: BrowserBehavior) -> Self {
        Self { config }
    }

    /// Scroll down the page in a few random chunks, pausing between them
    pub async fn scroll(&self, driver: &WebDriver) -> Result<()> {
        if self.config.scroll_behavior == "none" {
            return Ok(());
        }

        // Draw everything up front; ThreadRng is not Send across awaits
        let plan: Vec<(u32, &'static str, u64)> = {
            let mut rng = thread_rng();
            let (lo, hi) = self.config.scroll_steps;
            let steps = if hi > lo { rng.gen_range(lo..=hi) } else { lo.max(1) };

            (0..steps)
                .map(|_| {
                    let behavior = match self.config.scroll_behavior.as_str() {
                        "smooth" => "smooth",
                        _ => if rng.gen_bool(0.7) { "smooth" } else { "auto" },
                    };
                    (rng.gen_range(250..900), behavior, rng.gen_range(300..800))
                })
                .collect()
        };

        let mut scrolled = 0;
        for (chunk, behavior, pause_ms) in plan {
            let script = format!(
                "window.scrollBy({{ top: {}, left: 0, behavior: '{}' }});",
                chunk, behavior
            );
            driver.execute(&script, Vec::new()).await?;
            scrolled += chunk;

            sleep(Duration::from_millis(pause_ms)).await;
        }

        debug!("Scrolled {} pixels", scrolled);

        Ok(())
    }

    /// Scroll an element into view and click it after a short random delay
    pub async fn click(&self, element: &WebElement) -> Result<()> {
        let delay_ms = {
            let (lo, hi) = self.config.click_delay;
            if hi > lo { thread_rng().gen_range(lo..hi) } else { lo }
        };

        element.scroll_into_view().await?;
        sleep(Duration::from_millis(delay_ms)).await;
        element.click().await?;

        debug!("Clicked element after {} ms", delay_ms);

        Ok(())
    }
}
