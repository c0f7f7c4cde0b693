//! Notifier that writes messages to the log.

use super::{Message, Notifier, NotifyError};

use async_trait::async_trait;

/// Emits each message as an `info` event. Never fails.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &Message) -> Result<(), NotifyError> {
        tracing::info!(
            recipients = %message.recipients.join(", "),
            "{}\n{}",
            message.subject,
            message.body
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}
