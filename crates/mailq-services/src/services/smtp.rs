//! SMTP relay delivery.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Arc;
use std::time::Duration;

use mailq_core::{MailError, MailSender, SmtpConfig, SmtpTls};

/// Delivers plain-text mail through one authenticated relay.
#[derive(Clone)]
pub struct SmtpMailer {
    transport: Arc<AsyncSmtpTransport<Tokio1Executor>>,
    from: Mailbox,
}

impl SmtpMailer {
    /// Build the relay transport. No connection is opened until the first send.
    pub fn from_config(config: &SmtpConfig) -> Result<Self, MailError> {
        let from: Mailbox = config.from.parse().map_err(|e| MailError::InvalidAddress {
            address: config.from.clone(),
            reason: format!("{}", e),
        })?;

        let builder = match config.tls {
            SmtpTls::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| MailError::Transport(e.to_string()))?,
            SmtpTls::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| MailError::Transport(e.to_string()))?,
            SmtpTls::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host),
        };

        let transport = builder
            .port(config.port)
            .credentials(Credentials::new(
                config.user.clone(),
                config.password.clone(),
            ))
            .timeout(Some(Duration::from_secs(config.timeout_secs)))
            .build();

        tracing::info!(
            host = %config.host,
            port = config.port,
            tls = ?config.tls,
            "SMTP mailer initialized"
        );

        Ok(Self {
            transport: Arc::new(transport),
            from,
        })
    }

    fn build_message(&self, recipient: &str, subject: &str, body: &str) -> Result<Message, MailError> {
        let to: Mailbox = recipient.parse().map_err(|e| MailError::InvalidAddress {
            address: recipient.to_string(),
            reason: format!("{}", e),
        })?;

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| MailError::InvalidMessage(e.to_string()))
    }
}

#[async_trait]
impl MailSender for SmtpMailer {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), MailError> {
        let message = self.build_message(recipient, subject, body)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?;
        tracing::debug!(recipient = %recipient, "Mail handed to relay");
        Ok(())
    }
}
