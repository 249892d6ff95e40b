//! Webhook notification channel
//!
//! POSTs `{ "subject": ..., "message": ... }` to the configured endpoint.
//! The async reqwest client is driven by a private current-thread runtime so
//! the pipeline can stay synchronous.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;

use crate::config::NotificationConfig;
use crate::error::{Error, Result};

use super::notifier::Notifier;

/// Request body for the webhook
#[derive(Serialize)]
struct PublishRequest<'a> {
    subject: &'a str,
    message: &'a str,
}

/// One failed delivery attempt
struct SendFailure {
    retryable: bool,
    error: Error,
}

impl SendFailure {
    fn transient(error: Error) -> Self {
        Self {
            retryable: true,
            error,
        }
    }

    fn fatal(error: Error) -> Self {
        Self {
            retryable: false,
            error,
        }
    }
}

pub struct WebhookNotifier {
    http_client: reqwest::Client,
    url: String,
    max_retries: usize,
    runtime: tokio::runtime::Runtime,
}

impl WebhookNotifier {
    /// Create a notifier from configuration
    ///
    /// Returns an error if the configuration is invalid or missing the endpoint.
    pub fn new(config: &NotificationConfig) -> Result<Self> {
        config.validate()?;

        let url = config
            .webhook_url
            .clone()
            .ok_or_else(|| Error::Config("notifications.webhook_url is required".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(api_key) = &config.api_key {
            let auth_value = format!("Bearer {}", api_key);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value)
                    .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?,
            );
        }

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Notification(format!("failed to create runtime: {}", e)))?;

        Ok(Self {
            http_client,
            url,
            max_retries: config.max_retries,
            runtime,
        })
    }

    async fn send(&self, subject: &str, message: &str) -> std::result::Result<(), SendFailure> {
        let response = self
            .http_client
            .post(&self.url)
            .json(&PublishRequest { subject, message })
            .send()
            .await
            .map_err(|e| {
                let error = Error::Notification(format!("HTTP request failed: {}", e));
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    SendFailure::transient(error)
                } else {
                    SendFailure::fatal(error)
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown".to_string());
        let error = Error::Notification(format!("webhook error ({}): {}", status, error_text));
        if is_retryable_status(status) {
            Err(SendFailure::transient(error))
        } else {
            Err(SendFailure::fatal(error))
        }
    }

    /// Deliver with exponential backoff on transient failures
    async fn send_with_retry(&self, subject: &str, message: &str) -> Result<()> {
        let mut last_error = None;
        let mut delay = Duration::from_millis(250);

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tracing::debug!(
                    attempt = attempt + 1,
                    max_attempts = self.max_retries + 1,
                    ?delay,
                    "Retrying webhook delivery"
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_secs(5));
            }

            match self.send(subject, message).await {
                Ok(()) => return Ok(()),
                Err(failure) if failure.retryable => {
                    tracing::warn!(subject, error = %failure.error, "Transient webhook failure");
                    last_error = Some(failure.error);
                }
                Err(failure) => return Err(failure.error),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Notification("max retries exceeded".to_string())))
    }
}

impl Notifier for WebhookNotifier {
    fn publish(&self, subject: &str, message: &str) -> Result<()> {
        self.runtime.block_on(self.send_with_retry(subject, message))
    }
}

/// 5xx and 429 are worth another attempt
fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}
