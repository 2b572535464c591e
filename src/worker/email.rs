use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::engine::{BookingEngine, BookingError};
use crate::mailer::Mailer;
use crate::queue::{Job, JobError, JobHandler, JobPayload};

/// Notification consumer. Delivery is at-least-once, so both payloads are
/// written to tolerate redelivery: sending the same mail twice is accepted,
/// and the status transition is idempotent.
pub struct EmailWorker {
    engine: Arc<BookingEngine>,
    mailer: Arc<dyn Mailer>,
}

impl EmailWorker {
    pub fn new(engine: Arc<BookingEngine>, mailer: Arc<dyn Mailer>) -> Self {
        Self { engine, mailer }
    }

    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), JobError> {
        self.mailer
            .send(to, subject, body)
            .await
            .map_err(|e| JobError::Retry(e.to_string()))?;
        metrics::counter!(crate::observability::EMAILS_SENT_TOTAL).increment(1);
        Ok(())
    }
}

#[async_trait]
impl JobHandler for EmailWorker {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        match &job.payload {
            JobPayload::VerifyEmail {
                email,
                subject,
                message,
            } => self.send(email, subject, message).await,
            JobPayload::SendConfirmation {
                email,
                subject,
                message,
                appointment_id,
            } => {
                self.send(email, subject, message).await?;
                match self.engine.mark_completed(*appointment_id).await {
                    Ok(_) => Ok(()),
                    Err(BookingError::NotFound(id)) => {
                        // Cancelled between booking and delivery. The mail is
                        // out; nothing left to record.
                        warn!("confirmation sent for missing appointment {id}");
                        Ok(())
                    }
                    Err(BookingError::WalError(msg)) => Err(JobError::Retry(msg)),
                    Err(other) => Err(JobError::Fatal(other.to_string())),
                }
            }
            other => Err(JobError::Fatal(format!(
                "unexpected payload {} on email queue",
                other.kind()
            ))),
        }
    }
}
