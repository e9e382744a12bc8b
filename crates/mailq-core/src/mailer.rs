//! Mail delivery capability used by the dispatcher.

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Sends one message to one recipient. Any error is treated as retryable by
/// the dispatcher.
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), MailError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSender(AtomicUsize);

    #[async_trait]
    impl MailSender for CountingSender {
        async fn send(&self, recipient: &str, _subject: &str, _body: &str) -> Result<(), MailError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            if recipient.contains('@') {
                Ok(())
            } else {
                Err(MailError::InvalidAddress {
                    address: recipient.to_string(),
                    reason: "missing domain".to_string(),
                })
            }
        }
    }

    #[tokio::test]
    async fn test_sender_is_object_safe() {
        let sender: Box<dyn MailSender> = Box::new(CountingSender(AtomicUsize::new(0)));
        sender.send("a@x.com", "Hi", "Hello").await.unwrap();
        let err = sender.send("nobody", "Hi", "Hello").await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid address nobody: missing domain");
    }
}
