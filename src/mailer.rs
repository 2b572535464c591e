use async_trait::async_trait;

/// Mail delivery failure. Transport problems are the norm here, so the worker
/// treats every mailer error as retryable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailError(pub String);

impl std::fmt::Display for MailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mail delivery failed: {}", self.0)
    }
}

impl std::error::Error for MailError {}

/// Outbound mail transport. The notification worker only depends on this
/// trait, so tests swap in recording or failing transports.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError>;
}

/// Default transport: logs the message instead of speaking SMTP. Useful for
/// development and as a stand-in until a real relay is configured.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        tracing::info!(to, subject, body, "mail out");
        Ok(())
    }
}
