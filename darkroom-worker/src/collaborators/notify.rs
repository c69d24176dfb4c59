//! Alert notifiers

use anyhow::{Context, Result};
use async_trait::async_trait;
use darkroom_core::domain::alert::Alert;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::error;

use crate::pool::AlertHandler;

/// Posts alerts to a chat webhook as `{"text": message}`
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build webhook client")?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertHandler for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn handle(&self, alert: &Alert) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "text": alert.message() }))
            .send()
            .await
            .context("Failed to reach alert webhook")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Alert webhook returned {}", status);
        }
        Ok(())
    }
}

/// Writes alerts to the log at error level
pub struct LogNotifier;

#[async_trait]
impl AlertHandler for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn handle(&self, alert: &Alert) -> Result<()> {
        error!(
            job_id = %alert.job_id,
            owner_id = alert.owner_id,
            "{}: {}", alert.subject(), alert.message()
        );
        Ok(())
    }
}
