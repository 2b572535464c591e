mod job;

pub use job::*;

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::model::now_ms;
use crate::wal::{self, Wal, WalCommand};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    LimitExceeded(&'static str),
    /// Transient store failure — safe to retry.
    WalError(String),
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            QueueError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for QueueError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueDepth {
    pub waiting: usize,
    pub active: usize,
    pub failed: usize,
}

impl QueueDepth {
    pub fn pending(&self) -> usize {
        self.waiting + self.active
    }
}

#[derive(Default)]
struct QueueState {
    /// FIFO of deliverable jobs. Retried jobs re-enter at the back with a
    /// future `run_at`, so a retry may be delivered after newer jobs.
    waiting: VecDeque<Job>,
    active: HashMap<String, Job>,
    /// Dead letters — kept for operator inspection, never silently dropped.
    failed: Vec<Job>,
    /// dedupe_key → job id, maintained only while that job is WAITING/ACTIVE.
    dedupe: HashMap<String, String>,
}

/// Durable at-least-once job queue, FIFO per queue name, backed by its own
/// WAL behind the shared group-commit writer.
pub struct JobQueue {
    queues: DashMap<String, Arc<Mutex<QueueState>>>,
    wakers: DashMap<String, Arc<Notify>>,
    wal_tx: mpsc::Sender<WalCommand<JobEvent>>,
}

impl JobQueue {
    /// Open the queue, replaying its WAL. Jobs that were ACTIVE at crash go
    /// back to WAITING — delivery is at-least-once, handlers must tolerate
    /// re-execution.
    pub fn open(path: &Path) -> io::Result<Self> {
        let events = Wal::<JobEvent>::replay(path)?;
        let wal = Wal::open(path)?;
        let wal_tx = wal::spawn_writer(wal);

        let queue = Self {
            queues: DashMap::new(),
            wakers: DashMap::new(),
            wal_tx,
        };

        let mut jobs: HashMap<String, Job> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for event in events {
            match event {
                JobEvent::Enqueued {
                    id,
                    queue: queue_name,
                    payload,
                    attempts,
                    max_attempts,
                    backoff_base_ms,
                    dedupe_key,
                    run_at,
                } => {
                    order.push(id.clone());
                    jobs.insert(
                        id.clone(),
                        Job {
                            id,
                            queue: queue_name,
                            payload,
                            attempts,
                            max_attempts,
                            backoff_base_ms,
                            dedupe_key,
                            state: JobState::Waiting,
                            run_at,
                        },
                    );
                }
                JobEvent::Started { id } => {
                    if let Some(job) = jobs.get_mut(&id) {
                        job.state = JobState::Active;
                    }
                }
                JobEvent::Completed { id } => {
                    jobs.remove(&id);
                }
                JobEvent::Retried { id, attempts, run_at } => {
                    if let Some(job) = jobs.get_mut(&id) {
                        job.state = JobState::Waiting;
                        job.attempts = attempts;
                        job.run_at = run_at;
                    }
                }
                JobEvent::Failed { id, attempts } => {
                    if let Some(job) = jobs.get_mut(&id) {
                        job.state = JobState::Failed;
                        job.attempts = attempts;
                    }
                }
            }
        }

        for id in order {
            let Some(mut job) = jobs.remove(&id) else {
                continue; // completed
            };
            let qs_arc = queue.queue_state(&job.queue);
            let mut qs = qs_arc
                .try_lock()
                .expect("replay: uncontended lock");
            match job.state {
                JobState::Failed => qs.failed.push(job),
                _ => {
                    // ACTIVE at crash → redeliver
                    job.state = JobState::Waiting;
                    if let Some(key) = &job.dedupe_key {
                        qs.dedupe.insert(key.clone(), job.id.clone());
                    }
                    qs.waiting.push_back(job);
                }
            }
        }

        Ok(queue)
    }

    fn queue_state(&self, name: &str) -> Arc<Mutex<QueueState>> {
        self.queues
            .entry(name.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn waker(&self, name: &str) -> Arc<Notify> {
        self.wakers
            .entry(name.to_string())
            .or_default()
            .value()
            .clone()
    }

    async fn wal_append(&self, event: JobEvent) -> Result<(), QueueError> {
        wal::append_via(&self.wal_tx, event)
            .await
            .map_err(|e| QueueError::WalError(e.to_string()))
    }

    /// Append a Job in WAITING state. If `dedupe_key` matches a job that is
    /// already WAITING/ACTIVE the enqueue is a no-op returning the existing id.
    pub async fn enqueue(
        &self,
        queue: &str,
        payload: JobPayload,
        opts: JobOptions,
    ) -> Result<String, QueueError> {
        let qs_arc = self.queue_state(queue);
        let mut qs = qs_arc.lock().await;

        if let Some(key) = &opts.dedupe_key
            && let Some(existing) = qs.dedupe.get(key)
        {
            debug!("dedupe hit for key {key} on queue {queue}, keeping job {existing}");
            return Ok(existing.clone());
        }
        if qs.waiting.len() + qs.active.len() >= crate::limits::MAX_QUEUE_DEPTH {
            return Err(QueueError::LimitExceeded("queue depth"));
        }

        let job = Job {
            id: Ulid::new().to_string(),
            queue: queue.to_string(),
            payload,
            attempts: 0,
            max_attempts: opts.max_attempts,
            backoff_base_ms: opts.backoff_base_ms,
            dedupe_key: opts.dedupe_key,
            state: JobState::Waiting,
            run_at: now_ms(),
        };

        self.wal_append(JobEvent::Enqueued {
            id: job.id.clone(),
            queue: job.queue.clone(),
            payload: job.payload.clone(),
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            backoff_base_ms: job.backoff_base_ms,
            dedupe_key: job.dedupe_key.clone(),
            run_at: job.run_at,
        })
        .await?;

        if let Some(key) = &job.dedupe_key {
            qs.dedupe.insert(key.clone(), job.id.clone());
        }
        let id = job.id.clone();
        let kind = job.payload.kind();
        qs.waiting.push_back(job);
        drop(qs);

        metrics::counter!(crate::observability::JOBS_ENQUEUED_TOTAL, "queue" => queue.to_string())
            .increment(1);
        debug!("enqueued {kind} job {id} on queue {queue}");
        self.waker(queue).notify_one();
        Ok(id)
    }

    /// Pull the next deliverable job, marking it ACTIVE. Parks until one is
    /// ready. The ACTIVE transition is persisted before the handler runs so a
    /// crash mid-handler redelivers the job on restart.
    async fn next_job(&self, queue: &str) -> Job {
        let qs_arc = self.queue_state(queue);
        let waker = self.waker(queue);
        loop {
            let sleep_ms = {
                let mut qs = qs_arc.lock().await;
                let now = now_ms();
                if let Some(pos) = qs.waiting.iter().position(|j| j.run_at <= now) {
                    let mut job = qs.waiting.remove(pos).expect("position is in range");
                    job.state = JobState::Active;
                    // A lost Started record only widens the at-least-once
                    // window, so a WAL error here is logged, not fatal.
                    if let Err(e) = self.wal_append(JobEvent::Started { id: job.id.clone() }).await {
                        warn!("failed to persist ACTIVE for job {}: {e}", job.id);
                    }
                    qs.active.insert(job.id.clone(), job.clone());
                    return job;
                }
                qs.waiting.iter().map(|j| (j.run_at - now).max(1)).min()
            };

            match sleep_ms {
                Some(ms) => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(ms as u64)) => {}
                        _ = waker.notified() => {}
                    }
                }
                None => waker.notified().await,
            }
        }
    }

    async fn finish(&self, queue: &str, job: Job, result: Result<(), JobError>) {
        match result {
            Ok(()) => {
                if let Err(e) = self.wal_append(JobEvent::Completed { id: job.id.clone() }).await {
                    warn!("failed to persist COMPLETED for job {}: {e}", job.id);
                }
                let qs_arc = self.queue_state(queue);
                let mut qs = qs_arc.lock().await;
                qs.active.remove(&job.id);
                if let Some(key) = &job.dedupe_key {
                    qs.dedupe.remove(key);
                }
                drop(qs);
                metrics::counter!(crate::observability::JOBS_COMPLETED_TOTAL, "queue" => queue.to_string())
                    .increment(1);
                debug!("job {} ({}) completed", job.id, job.payload.kind());
            }
            Err(JobError::Retry(msg)) => {
                let mut job = job;
                job.attempts += 1;
                if job.attempts < job.max_attempts {
                    let delay = job.backoff_delay_ms();
                    job.run_at = now_ms() + delay as i64;
                    job.state = JobState::Waiting;
                    if let Err(e) = self
                        .wal_append(JobEvent::Retried {
                            id: job.id.clone(),
                            attempts: job.attempts,
                            run_at: job.run_at,
                        })
                        .await
                    {
                        warn!("failed to persist retry for job {}: {e}", job.id);
                    }
                    warn!(
                        "job {} ({}) failed attempt {}/{}, retrying in {delay}ms: {msg}",
                        job.id,
                        job.payload.kind(),
                        job.attempts,
                        job.max_attempts,
                    );
                    let qs_arc = self.queue_state(queue);
                    let mut qs = qs_arc.lock().await;
                    qs.active.remove(&job.id);
                    qs.waiting.push_back(job);
                    drop(qs);
                    metrics::counter!(crate::observability::JOB_RETRIES_TOTAL, "queue" => queue.to_string())
                        .increment(1);
                    self.waker(queue).notify_one();
                } else {
                    self.dead_letter(queue, job, &msg).await;
                }
            }
            Err(JobError::Fatal(msg)) => {
                let mut job = job;
                job.attempts += 1;
                self.dead_letter(queue, job, &msg).await;
            }
        }
    }

    async fn dead_letter(&self, queue: &str, mut job: Job, reason: &str) {
        job.state = JobState::Failed;
        if let Err(e) = self
            .wal_append(JobEvent::Failed {
                id: job.id.clone(),
                attempts: job.attempts,
            })
            .await
        {
            warn!("failed to persist FAILED for job {}: {e}", job.id);
        }
        error!(
            "job {} ({}) dead-lettered after {} attempt(s): {reason}",
            job.id,
            job.payload.kind(),
            job.attempts,
        );
        let qs_arc = self.queue_state(queue);
        let mut qs = qs_arc.lock().await;
        qs.active.remove(&job.id);
        if let Some(key) = &job.dedupe_key {
            qs.dedupe.remove(key);
        }
        qs.failed.push(job);
        drop(qs);
        metrics::counter!(crate::observability::JOBS_DEAD_LETTERED_TOTAL, "queue" => queue.to_string())
            .increment(1);
    }

    /// Consume jobs one at a time until shutdown flips. Outcomes surface as
    /// logs and metrics; dead letters stay queryable via `dead_letters`.
    pub async fn run_consumer(
        self: Arc<Self>,
        queue: String,
        handler: Arc<dyn JobHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("consumer started on queue {queue}");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                job = self.next_job(&queue) => {
                    let result = handler.handle(&job).await;
                    self.finish(&queue, job, result).await;
                }
            }
        }
        info!("consumer stopped on queue {queue}");
    }

    pub async fn depth(&self, queue: &str) -> QueueDepth {
        let qs_arc = self.queue_state(queue);
        let qs = qs_arc.lock().await;
        QueueDepth {
            waiting: qs.waiting.len(),
            active: qs.active.len(),
            failed: qs.failed.len(),
        }
    }

    /// Terminal FAILED jobs, oldest first.
    pub async fn dead_letters(&self, queue: &str) -> Vec<Job> {
        let qs_arc = self.queue_state(queue);
        let qs = qs_arc.lock().await;
        qs.failed.clone()
    }

    /// Rewrite the WAL with one Enqueued record per surviving job (plus a
    /// Failed marker for dead letters).
    pub async fn compact_wal(&self) -> Result<(), QueueError> {
        let mut records = Vec::new();
        for entry in self.queues.iter() {
            let qs = entry.value().lock().await;
            for job in qs.waiting.iter().chain(qs.active.values()).chain(qs.failed.iter()) {
                records.push(JobEvent::Enqueued {
                    id: job.id.clone(),
                    queue: job.queue.clone(),
                    payload: job.payload.clone(),
                    attempts: job.attempts,
                    max_attempts: job.max_attempts,
                    backoff_base_ms: job.backoff_base_ms,
                    dedupe_key: job.dedupe_key.clone(),
                    run_at: job.run_at,
                });
                if job.state == JobState::Failed {
                    records.push(JobEvent::Failed {
                        id: job.id.clone(),
                        attempts: job.attempts,
                    });
                }
            }
        }
        wal::compact_via(&self.wal_tx, records)
            .await
            .map_err(|e| QueueError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        wal::appends_since_compact_via(&self.wal_tx).await
    }
}
