use std::net::SocketAddr;

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: appointments committed (direct bookings and batch rows).
pub const BOOKINGS_TOTAL: &str = "slotd_bookings_total";

/// Counter: booking attempts rejected for slot overlap.
pub const BOOKING_CONFLICTS_TOTAL: &str = "slotd_booking_conflicts_total";

// ── Import metrics ──────────────────────────────────────────────

/// Counter: appointments inserted by the CSV import worker.
pub const APPOINTMENTS_IMPORTED_TOTAL: &str = "slotd_appointments_imported_total";

/// Counter: CSV rows dropped (malformed, blank fields, or conflicting).
pub const IMPORT_ROWS_SKIPPED_TOTAL: &str = "slotd_import_rows_skipped_total";

// ── Queue metrics ───────────────────────────────────────────────

/// Counter: jobs accepted onto a queue. Labels: queue.
pub const JOBS_ENQUEUED_TOTAL: &str = "slotd_jobs_enqueued_total";

/// Counter: jobs that ran to completion. Labels: queue.
pub const JOBS_COMPLETED_TOTAL: &str = "slotd_jobs_completed_total";

/// Counter: retry deliveries scheduled. Labels: queue.
pub const JOB_RETRIES_TOTAL: &str = "slotd_job_retries_total";

/// Counter: jobs moved to the dead-letter list. Labels: queue.
pub const JOBS_DEAD_LETTERED_TOTAL: &str = "slotd_jobs_dead_lettered_total";

/// Counter: notification emails handed to the mailer.
pub const EMAILS_SENT_TOTAL: &str = "slotd_emails_sent_total";

// ── WAL metrics ─────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotd_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
