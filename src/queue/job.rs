use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::Ms;

/// Queue names. Bulk imports and notification emails run on separate queues
/// with independent consumers.
pub const IMPORT_QUEUE: &str = "appointments";
pub const EMAIL_QUEUE: &str = "email";

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 5_000;

/// Typed job payloads. Only primitive identifiers cross the queue boundary —
/// payloads are serialized copies, never shared objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobPayload {
    VerifyEmail {
        email: String,
        subject: String,
        message: String,
    },
    SendConfirmation {
        email: String,
        subject: String,
        message: String,
        appointment_id: i64,
    },
    ImportCsv {
        path: PathBuf,
    },
}

impl JobPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::VerifyEmail { .. } => "verify-email",
            JobPayload::SendConfirmation { .. } => "send-confirmation",
            JobPayload::ImportCsv { .. } => "import-csv",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub payload: JobPayload,
    /// Completed executions that ended in failure.
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub dedupe_key: Option<String>,
    pub state: JobState,
    /// Earliest time this job may be delivered (moves forward on retry).
    pub run_at: Ms,
}

impl Job {
    /// Exponential backoff: `base * 2^(attempts-1)` after the attempt counter
    /// has been incremented for the failure being retried.
    pub fn backoff_delay_ms(&self) -> u64 {
        self.backoff_base_ms
            .saturating_mul(1u64 << self.attempts.saturating_sub(1).min(32))
    }
}

#[derive(Debug, Clone)]
pub struct JobOptions {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    /// Jobs with the same key are not re-enqueued while one is WAITING/ACTIVE.
    pub dedupe_key: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            dedupe_key: None,
        }
    }
}

impl JobOptions {
    pub fn with_dedupe_key(key: impl Into<String>) -> Self {
        Self {
            dedupe_key: Some(key.into()),
            ..Self::default()
        }
    }
}

/// Handler-side failure split. The queue owns all retry policy; handlers only
/// say whether the failure is worth retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Transient failure (store or mail connectivity) — retried with backoff.
    Retry(String),
    /// Programmer or data error — dead-lettered immediately, never retried.
    Fatal(String),
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobError::Retry(msg) => write!(f, "retryable: {msg}"),
            JobError::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

impl std::error::Error for JobError {}

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Invoked at least once per job. Must tolerate re-execution: a crash
    /// between completion and state commit causes redelivery.
    async fn handle(&self, job: &Job) -> Result<(), JobError>;
}

/// The queue WAL record format — flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobEvent {
    Enqueued {
        id: String,
        queue: String,
        payload: JobPayload,
        attempts: u32,
        max_attempts: u32,
        backoff_base_ms: u64,
        dedupe_key: Option<String>,
        run_at: Ms,
    },
    Started {
        id: String,
    },
    Completed {
        id: String,
    },
    Retried {
        id: String,
        attempts: u32,
        run_at: Ms,
    },
    Failed {
        id: String,
        attempts: u32,
    },
}
