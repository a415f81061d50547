//! Notification channel for cycle results
//!
//! New records are delivered as a JSON document, failures as plain text.
//! Telegram is used when configured; otherwise messages only go to the log.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{NotifyConfig, TelegramConfig};
use crate::record::Record;

/// Receives cycle outcomes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, text: &str) -> Result<()>;

    async fn send_document(&self, name: &str, bytes: Vec<u8>) -> Result<()>;
}

/// Build the notifier described by the configuration
pub fn from_config(config: &NotifyConfig, cancel: CancellationToken) -> Result<Box<dyn Notifier>> {
    match &config.telegram {
        Some(telegram) => Ok(Box::new(
            TelegramNotifier::new(telegram.clone())?.with_cancellation(cancel),
        )),
        None => Ok(Box::new(LogNotifier)),
    }
}

/// Serialize records as indented JSON and send them as one document
pub async fn send_json_document(
    notifier: &dyn Notifier,
    name: &str,
    records: &[Record],
) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(records).context("Failed to encode records as JSON")?;
    notifier.send_document(name, bytes).await
}

/// Run `operation` until it succeeds, at most `max_retries + 1` times
pub async fn retry_with_delay<T, F, Fut>(
    mut operation: F,
    max_retries: u32,
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = max_retries + 1;
    let mut last_error = None;

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            bail!("Operation cancelled");
        }

        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!("Attempt {}/{} failed: {:#}", attempt, attempts, e);
                last_error = Some(e);
            }
        }

        if attempt < attempts {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => bail!("Operation cancelled"),
            }
        }
    }

    let error = last_error.unwrap_or_else(|| anyhow!("no attempts were made"));
    Err(error.context(format!("Operation failed after {} attempts", attempts)))
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Telegram Bot API notifier
pub struct TelegramNotifier {
    client: Client,
    config: TelegramConfig,
    cancel: CancellationToken,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> Result<Self> {
        if config.bot_token.is_empty() {
            bail!("Telegram bot token is empty");
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build Telegram HTTP client")?;

        Ok(Self {
            client,
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Abort pending retries when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.bot_token,
            method
        )
    }

    async fn check_response(response: reqwest::Response) -> Result<()> {
        let status = response.status();
        let body = response.text().await.context("Failed to read Telegram response")?;

        let parsed: Option<TelegramResponse> = serde_json::from_str(&body).ok();
        match parsed {
            Some(TelegramResponse { ok: true, .. }) if status.is_success() => Ok(()),
            Some(TelegramResponse { description, .. }) => bail!(
                "Telegram API error ({}): {}",
                status,
                description.unwrap_or(body)
            ),
            None => bail!("Telegram API error ({}): {}", status, body),
        }
    }

    async fn send_message_once(&self, text: &str) -> Result<()> {
        let body = serde_json::json!({
            "chat_id": self.config.chat_id,
            "text": text,
        });

        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .context("Failed to reach Telegram")?;

        Self::check_response(response).await
    }

    async fn send_document_once(&self, name: &str, bytes: Vec<u8>) -> Result<()> {
        let document = Part::bytes(bytes)
            .file_name(name.to_string())
            .mime_str("application/json")
            .context("Invalid document mime type")?;
        let form = Form::new()
            .text("chat_id", self.config.chat_id.to_string())
            .part("document", document);

        let response = self
            .client
            .post(self.method_url("sendDocument"))
            .multipart(form)
            .send()
            .await
            .context("Failed to reach Telegram")?;

        Self::check_response(response).await
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, text: &str) -> Result<()> {
        retry_with_delay(
            || self.send_message_once(text),
            self.config.max_retries,
            self.config.retry_delay(),
            &self.cancel,
        )
        .await
        .context("Failed to send Telegram message")?;

        debug!("Telegram message sent to chat {}", self.config.chat_id);
        Ok(())
    }

    async fn send_document(&self, name: &str, bytes: Vec<u8>) -> Result<()> {
        let size = bytes.len();
        retry_with_delay(
            || self.send_document_once(name, bytes.clone()),
            self.config.max_retries,
            self.config.retry_delay(),
            &self.cancel,
        )
        .await
        .with_context(|| format!("Failed to send Telegram document {}", name))?;

        info!("Sent {} ({} bytes) to Telegram chat {}", name, size, self.config.chat_id);
        Ok(())
    }
}

/// Notifier that only writes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, text: &str) -> Result<()> {
        info!("Notification: {}", text);
        Ok(())
    }

    async fn send_document(&self, name: &str, bytes: Vec<u8>) -> Result<()> {
        info!("Document {} ({} bytes) not delivered, no channel configured", name, bytes.len());
        Ok(())
    }
}
