//! Webhook notifier: POSTs the message as JSON.

use super::{Message, Notifier, NotifyError};

use async_trait::async_trait;
use reqwest::{Client, Url};
use std::time::Duration;

/// Delivers messages to an HTTP endpoint.
///
/// The payload carries `subject`, `body` and `recipients`, plus a `text`
/// field (subject and body joined) for chat-style receivers.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: Url,
}

impl WebhookNotifier {
    pub fn new(url: Url, timeout: Duration) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, message: &Message) -> Result<(), NotifyError> {
        let payload = serde_json::json!({
            "subject": message.subject,
            "body": message.body,
            "recipients": message.recipients,
            "text": format!("{}\n\n{}", message.subject, message.body),
        });

        let response = self
            .client
            .post(self.url.clone())
            .json(&payload)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected(format!("{} {}", status, body.trim())));
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "webhook"
    }
}
