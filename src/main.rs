use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use slotd::engine::BookingEngine;
use slotd::mailer::LogMailer;
use slotd::queue::{EMAIL_QUEUE, IMPORT_QUEUE, JobQueue};
use slotd::worker::{EmailWorker, ImportWorker, import};

/// Services seeded on an empty store.
const DEFAULT_SERVICES: &[(u32, &str, u32, i64)] = &[
    (1, "Haircut", 30, 2_500),
    (2, "Coloring", 90, 8_000),
    (3, "Styling", 45, 4_000),
    (4, "Manicure", 30, 3_000),
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("SLOTD_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    slotd::observability::init(metrics_port);

    let data_dir = std::env::var("SLOTD_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let import_dir = std::env::var("SLOTD_IMPORT_QUEUE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(&data_dir).join("import"));
    let compact_threshold: u64 = std::env::var("SLOTD_COMPACT_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);
    let import_scan_secs: u64 = std::env::var("SLOTD_IMPORT_SCAN_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);

    std::fs::create_dir_all(&data_dir)?;
    std::fs::create_dir_all(&import_dir)?;

    let queue = Arc::new(JobQueue::open(&PathBuf::from(&data_dir).join("jobs.wal"))?);
    let engine = Arc::new(BookingEngine::open(
        &PathBuf::from(&data_dir).join("bookings.wal"),
        Some(queue.clone()),
    )?);

    if !engine.has_services() {
        for &(id, name, duration_minutes, price_cents) in DEFAULT_SERVICES {
            engine
                .add_service(id, name, duration_minutes, price_cents)
                .await?;
        }
        info!("seeded {} default services", DEFAULT_SERVICES.len());
    }

    info!("slotd starting");
    info!("  data_dir: {data_dir}");
    info!("  import_dir: {}", import_dir.display());
    info!("  services: {}", engine.services().len());
    info!(
        "  metrics: {}",
        metrics_port.map_or("disabled".to_string(), |p| format!(
            "http://0.0.0.0:{p}/metrics"
        ))
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut consumers = Vec::new();

    let email_worker = Arc::new(EmailWorker::new(engine.clone(), Arc::new(LogMailer)));
    consumers.push(tokio::spawn(queue.clone().run_consumer(
        EMAIL_QUEUE.into(),
        email_worker,
        shutdown_rx.clone(),
    )));

    let import_worker = Arc::new(ImportWorker::new(engine.clone(), queue.clone()));
    consumers.push(tokio::spawn(queue.clone().run_consumer(
        IMPORT_QUEUE.into(),
        import_worker,
        shutdown_rx.clone(),
    )));

    // Import intake: enqueue any CSV dropped into the import directory.
    {
        let queue = queue.clone();
        let import_dir = import_dir.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(Duration::from_secs(import_scan_secs)) => {
                        import::enqueue_pending(&queue, &import_dir).await;
                    }
                }
            }
        });
    }

    // Periodic WAL compaction once enough appends have accumulated.
    {
        let engine = engine.clone();
        let queue = queue.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(Duration::from_secs(30)) => {
                        if engine.wal_appends_since_compact().await >= compact_threshold {
                            info!("compacting booking WAL");
                            if let Err(e) = engine.compact_wal().await {
                                error!("booking WAL compaction failed: {e}");
                            }
                        }
                        if queue.wal_appends_since_compact().await >= compact_threshold {
                            info!("compacting job WAL");
                            if let Err(e) = queue.compact_wal().await {
                                error!("job WAL compaction failed: {e}");
                            }
                        }
                    }
                }
            }
        });
    }

    // Graceful shutdown: flip the watch on SIGTERM/ctrl-c, then drain the
    // consumers with a bounded deadline.
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("shutdown signal received, stopping consumers");
    let _ = shutdown_tx.send(true);

    let drain = async {
        for consumer in consumers {
            let _ = consumer.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        warn!("drain timeout, consumers still busy");
    }

    info!("slotd stopped");
    Ok(())
}
