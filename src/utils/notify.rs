use anyhow::{Result, Context};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cli::config::NotificationSettings;

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

struct TelegramTarget {
    client: Client,
    endpoint: String,
    chat_id: String,
}

/// Best-effort Telegram messages. Delivery failures are logged, never returned.
pub struct Notifier {
    telegram: Option<TelegramTarget>,
}

impl Notifier {
    pub fn new(settings: &NotificationSettings) -> Self {
        let (Some(token), Some(chat_id)) = (
            settings.telegram_bot_token.as_deref(),
            settings.telegram_chat_id.as_deref(),
        ) else {
            return Self::disabled();
        };

        let client = match Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                warn!("Failed to create notification client, notifications disabled: {}", e);
                return Self::disabled();
            }
        };

        Self {
            telegram: Some(TelegramTarget {
                client,
                endpoint: format!("{}/bot{}/sendMessage", settings.api_url.trim_end_matches('/'), token),
                chat_id: chat_id.to_string(),
            }),
        }
    }

    pub fn disabled() -> Self {
        Self { telegram: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.telegram.is_some()
    }

    pub async fn send(&self, text: &str) {
        let Some(target) = &self.telegram else {
            return;
        };

        match Self::post(target, text).await {
            Ok(()) => debug!("Sent notification"),
            Err(e) => warn!("Failed to send notification: {:#}", e),
        }
    }

    async fn post(target: &TelegramTarget, text: &str) -> Result<()> {
        target
            .client
            .post(&target.endpoint)
            .json(&SendMessage { chat_id: &target.chat_id, text })
            .send()
            .await
            .context("Failed to reach Telegram")?
            .error_for_status()
            .context("Telegram rejected the message")?;

        Ok(())
    }
}
