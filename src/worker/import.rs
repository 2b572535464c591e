use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use crate::engine::{BatchBooking, BookingEngine, BookingError};
use crate::limits::IMPORT_BATCH_SIZE;
use crate::model::{Span, datetime_ms, parse_date, parse_time};
use crate::queue::{EMAIL_QUEUE, Job, JobError, JobHandler, JobOptions, JobPayload, JobQueue};

/// One CSV row as written by the upstream export. Everything arrives as a
/// string; resolution happens per row so one bad cell never kills the file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CsvRow {
    customer_name: String,
    #[serde(default)]
    email: String,
    date: String,
    start_time: String,
    service_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Data rows read from the file, good or bad.
    pub processed: usize,
    pub inserted: usize,
    pub skipped: usize,
}

/// Streaming CSV import consumer. Rows accumulate into fixed-size batches
/// handed to the engine, so a million-row file never holds a million rows in
/// memory. Re-running a partially imported file is safe: rows inserted by an
/// earlier run conflict with themselves and are skipped.
pub struct ImportWorker {
    engine: Arc<BookingEngine>,
    queue: Arc<JobQueue>,
}

impl ImportWorker {
    pub fn new(engine: Arc<BookingEngine>, queue: Arc<JobQueue>) -> Self {
        Self { engine, queue }
    }

    pub async fn import_file(&self, path: &Path) -> Result<ImportSummary, JobError> {
        let reader = match csv::Reader::from_path(path) {
            Ok(r) => r,
            Err(e) => {
                if let csv::ErrorKind::Io(io) = e.kind()
                    && io.kind() == std::io::ErrorKind::NotFound
                {
                    // Redelivery after the file was already imported and
                    // deleted. Nothing left to do.
                    warn!("import file {} missing, treating as done", path.display());
                    return Ok(ImportSummary::default());
                }
                return Err(JobError::Retry(format!(
                    "cannot open {}: {e}",
                    path.display()
                )));
            }
        };

        let mut summary = ImportSummary::default();
        let mut batch: Vec<BatchBooking> = Vec::with_capacity(IMPORT_BATCH_SIZE);

        for record in reader.into_deserialize::<CsvRow>() {
            summary.processed += 1;
            let row = match record {
                Ok(row) => row,
                Err(e) => {
                    if matches!(e.kind(), csv::ErrorKind::Io(_)) {
                        return Err(JobError::Retry(format!("read error: {e}")));
                    }
                    warn!("skipping malformed row {}: {e}", summary.processed);
                    summary.skipped += 1;
                    continue;
                }
            };
            match self.resolve_row(&row) {
                Some(resolved) => batch.push(resolved),
                None => {
                    warn!("skipping invalid row {}", summary.processed);
                    summary.skipped += 1;
                }
            }
            if batch.len() >= IMPORT_BATCH_SIZE {
                self.flush_batch(std::mem::take(&mut batch), &mut summary)
                    .await?;
            }
        }
        if !batch.is_empty() {
            self.flush_batch(batch, &mut summary).await?;
        }

        if let Err(e) = std::fs::remove_file(path) {
            warn!("could not delete imported file {}: {e}", path.display());
        }
        info!(
            "imported {}: {} rows read, {} inserted, {} skipped",
            path.display(),
            summary.processed,
            summary.inserted,
            summary.skipped,
        );
        Ok(summary)
    }

    /// Turn a raw row into a batch entry, or None when a required column is
    /// blank or unresolvable.
    fn resolve_row(&self, row: &CsvRow) -> Option<BatchBooking> {
        if row.customer_name.trim().is_empty()
            || row.date.trim().is_empty()
            || row.start_time.trim().is_empty()
        {
            return None;
        }
        let service_id: u32 = row.service_id.trim().parse().ok()?;
        let service = self.engine.service(service_id)?;
        let day = parse_date(row.date.trim())?;
        let time = parse_time(row.start_time.trim())?;
        let start = datetime_ms(day, time);
        let email = Some(row.email.trim().to_string()).filter(|e| !e.is_empty());
        Some(BatchBooking {
            customer_name: row.customer_name.trim().to_string(),
            email,
            span: Span::new(start, start + service.duration_ms()),
            service_id,
        })
    }

    async fn flush_batch(
        &self,
        rows: Vec<BatchBooking>,
        summary: &mut ImportSummary,
    ) -> Result<(), JobError> {
        let outcome = self.engine.batch_book(rows).await.map_err(|e| match e {
            BookingError::WalError(msg) => JobError::Retry(msg),
            other => JobError::Fatal(other.to_string()),
        })?;
        summary.inserted += outcome.inserted.len();
        summary.skipped += outcome.skipped;
        metrics::counter!(crate::observability::APPOINTMENTS_IMPORTED_TOTAL)
            .increment(outcome.inserted.len() as u64);
        metrics::counter!(crate::observability::IMPORT_ROWS_SKIPPED_TOTAL)
            .increment(outcome.skipped as u64);

        for appt in &outcome.inserted {
            let Some(email) = &appt.email else { continue };
            let result = self
                .queue
                .enqueue(
                    EMAIL_QUEUE,
                    JobPayload::SendConfirmation {
                        email: email.clone(),
                        subject: "Appointment Confirmation".into(),
                        message: "Your appointment is confirmed.".into(),
                        appointment_id: appt.id,
                    },
                    JobOptions::with_dedupe_key(format!("confirm:{}", appt.id)),
                )
                .await;
            if let Err(e) = result {
                warn!(
                    "failed to enqueue confirmation for appointment {}: {e}",
                    appt.id
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for ImportWorker {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        match &job.payload {
            JobPayload::ImportCsv { path } => {
                self.import_file(path).await?;
                Ok(())
            }
            other => Err(JobError::Fatal(format!(
                "unexpected payload {} on import queue",
                other.kind()
            ))),
        }
    }
}

/// Scan a drop directory and enqueue an import job per CSV file. The file
/// path doubles as the dedupe key, so rescanning before a file is consumed
/// never enqueues it twice.
pub async fn enqueue_pending(queue: &JobQueue, dir: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("cannot scan import dir {}: {e}", dir.display());
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("csv") {
            continue;
        }
        let key = format!("import:{}", path.display());
        if let Err(e) = queue
            .enqueue(
                crate::queue::IMPORT_QUEUE,
                JobPayload::ImportCsv { path: path.clone() },
                JobOptions::with_dedupe_key(key),
            )
            .await
        {
            warn!("failed to enqueue import of {}: {e}", path.display());
        }
    }
}
