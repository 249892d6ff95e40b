//! Notification channel abstraction

use std::sync::Arc;

use crate::config::NotificationConfig;
use crate::error::Result;

use super::webhook::WebhookNotifier;

/// Publish-only notification channel.
pub trait Notifier: Send + Sync {
    fn publish(&self, subject: &str, message: &str) -> Result<()>;
}

/// Writes alerts to the log instead of delivering them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn publish(&self, subject: &str, message: &str) -> Result<()> {
        tracing::info!(subject, message, "Alert (notifications disabled)");
        Ok(())
    }
}

/// Build the notifier described by `config`.
///
/// A webhook notifier when notifications are enabled and configured,
/// otherwise a [`LogNotifier`].
pub fn build_notifier(config: &NotificationConfig) -> Result<Arc<dyn Notifier>> {
    config.validate()?;
    if config.is_ready() {
        Ok(Arc::new(WebhookNotifier::new(config)?))
    } else {
        Ok(Arc::new(LogNotifier))
    }
}
