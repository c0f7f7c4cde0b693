//! Notification dispatch.
//!
//! The pipeline composes one [`Message`] per run and hands it to a
//! [`Notifier`] through [`send_with_retry`].

mod log;
mod smtp;
mod webhook;

pub use self::log::*;
pub use smtp::*;
pub use webhook::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Notification error types.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rejected by receiver: {0}")]
    Rejected(String),
    #[error("no recipients")]
    NoRecipients,
}

impl NotifyError {
    /// Only transport failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, NotifyError::Transport(_))
    }
}

/// A composed notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub subject: String,
    pub body: String,
    pub recipients: Vec<String>,
}

/// Dispatches composed messages.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &Message) -> Result<(), NotifyError>;

    /// Short transport name for logs.
    fn name(&self) -> &str;
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Send `message`, retrying transport failures per `policy`.
///
/// Returns the number of attempts used, or the last error once the attempts
/// are exhausted. A rejection by the receiver is returned at once.
pub async fn send_with_retry(
    notifier: &dyn Notifier,
    message: &Message,
    policy: &RetryPolicy,
) -> Result<u32, NotifyError> {
    if message.recipients.is_empty() {
        return Err(NotifyError::NoRecipients);
    }

    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match notifier.send(message).await {
            Ok(()) => {
                tracing::info!(
                    "Notifier {}: sent {:?} on attempt {}",
                    notifier.name(),
                    message.subject,
                    attempt
                );
                return Ok(attempt);
            }
            Err(e) if !e.is_transient() => {
                tracing::error!(
                    "Notifier {}: attempt {} rejected, not retrying: {}",
                    notifier.name(),
                    attempt,
                    e
                );
                return Err(e);
            }
            Err(e) if attempt >= attempts => {
                tracing::error!(
                    "Notifier {}: giving up after {} attempts: {}",
                    notifier.name(),
                    attempt,
                    e
                );
                return Err(e);
            }
            Err(e) => {
                let backoff = policy.backoff(attempt);
                let jitter = Duration::from_millis(rand::random::<u64>() % 50);
                tracing::warn!(
                    "Notifier {}: attempt {} failed: {}, retrying in {:?}",
                    notifier.name(),
                    attempt,
                    e,
                    backoff
                );
                tokio::time::sleep(backoff + jitter).await;
                attempt += 1;
            }
        }
    }
}
