//! SMTP notifier: one plain-text email per message.

use super::{Message, Notifier, NotifyError};

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use std::time::Duration;

/// Relay connection details.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub starttls: bool,
    /// Username and password for AUTH, if the relay needs it.
    pub credentials: Option<(String, String)>,
    pub from: Mailbox,
    pub timeout: Duration,
}

/// Sends each message as an email to its recipients.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpNotifier {
    pub fn new(settings: SmtpSettings) -> Result<Self, NotifyError> {
        let builder = if settings.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
                .map_err(|e| NotifyError::Transport(e.to_string()))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host)
        };

        let mut builder = builder
            .port(settings.port)
            .timeout(Some(settings.timeout));
        if let Some((user, password)) = settings.credentials {
            builder = builder.credentials(Credentials::new(user, password));
        }

        Ok(Self {
            transport: builder.build(),
            from: settings.from,
        })
    }

    fn email(&self, message: &Message) -> Result<lettre::Message, NotifyError> {
        let mut builder = lettre::Message::builder()
            .from(self.from.clone())
            .subject(message.subject.as_str())
            .header(ContentType::TEXT_PLAIN);
        for recipient in &message.recipients {
            let mailbox: Mailbox = recipient.parse().map_err(|e| {
                NotifyError::Rejected(format!("invalid recipient {:?}: {}", recipient, e))
            })?;
            builder = builder.to(mailbox);
        }
        builder
            .body(message.body.clone())
            .map_err(|e| NotifyError::Rejected(e.to_string()))
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, message: &Message) -> Result<(), NotifyError> {
        let email = self.email(message)?;
        match self.transport.send(email).await {
            Ok(_) => Ok(()),
            // 5xx replies will not change on retry
            Err(e) if e.is_permanent() => Err(NotifyError::Rejected(e.to_string())),
            Err(e) => Err(NotifyError::Transport(e.to_string())),
        }
    }

    fn name(&self) -> &str {
        "smtp"
    }
}
