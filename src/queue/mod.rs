//! Bounded-concurrency download queue
//!
//! Architecture:
//! 1. Callers `enqueue` identifiers; each becomes a Pending [`Job`] at the
//!    back of a FIFO backlog
//! 2. A fixed set of worker tasks (one per concurrency slot) claims jobs
//!    from the front, runs the [`Fetcher`] and retries retryable failures
//!    with backoff inside the slot
//! 3. Each job ends Succeeded or Failed and is handed to exactly one
//!    callback before the slot takes the next job
//! 4. `close` stops intake and waits for the backlog and in-flight jobs
//!    to drain
//!
//! [`Fetcher`]: crate::fetcher::Fetcher

mod job;
mod pool;
mod retry;

pub use job::{Job, JobId, JobState};
pub use pool::{DownloadQueue, QueueHandle};
pub use retry::RetryPolicy;

use crate::config::QueueSettings;
use crate::identifier::IdentifierError;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Invalid identifier {input:?}: {source}")]
    InvalidIdentifier {
        input: String,
        #[source]
        source: IdentifierError,
    },

    #[error("Queue is full ({capacity} jobs pending)")]
    QueueFull { capacity: usize },

    #[error("Queue is closed")]
    Closed,

    #[error("Invalid queue configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Queue sizing and retry behaviour
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub concurrency: usize,
    /// Pending jobs allowed before `enqueue` reports `QueueFull`
    pub max_backlog: usize,
    pub retry: RetryPolicy,
}

impl QueueConfig {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Self::from_settings(&QueueSettings::default())
        }
    }

    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self {
            concurrency: settings.concurrency,
            max_backlog: settings.max_backlog,
            retry: RetryPolicy::new(settings),
        }
    }

    pub fn with_max_backlog(mut self, max_backlog: usize) -> Self {
        self.max_backlog = max_backlog;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(QueueError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.max_backlog == 0 {
            return Err(QueueError::InvalidConfig(
                "max_backlog must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(QueueError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

pub type JobCallback = Arc<dyn Fn(Job) + Send + Sync>;

/// Success and failure hooks, run on worker tasks.
///
/// They may run concurrently with each other and must not block for long:
/// a slot is busy until its callback returns.
#[derive(Clone)]
pub struct Callbacks {
    on_success: JobCallback,
    on_failure: JobCallback,
}

impl Callbacks {
    pub fn new<S, F>(on_success: S, on_failure: F) -> Self
    where
        S: Fn(Job) + Send + Sync + 'static,
        F: Fn(Job) + Send + Sync + 'static,
    {
        Self {
            on_success: Arc::new(on_success),
            on_failure: Arc::new(on_failure),
        }
    }

    pub(crate) fn callback_for(&self, state: JobState) -> &JobCallback {
        match state {
            JobState::Succeeded => &self.on_success,
            _ => &self.on_failure,
        }
    }
}

impl Default for Callbacks {
    /// Log every outcome
    fn default() -> Self {
        Self::new(
            |job| {
                tracing::info!(
                    identifier = %job.identifier,
                    attempts = job.attempts,
                    path = ?job.result_path,
                    "Download succeeded"
                )
            },
            |job| {
                tracing::warn!(
                    identifier = %job.identifier,
                    attempts = job.attempts,
                    error = ?job.last_error,
                    "Download failed"
                )
            },
        )
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks").finish_non_exhaustive()
    }
}

/// Point-in-time view of a queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub succeeded: u64,
    pub failed: u64,
    /// Fetch attempts that were retried so far
    pub retries: u64,
    /// Enqueue calls refused so far
    pub rejected: u64,
    pub closed: bool,
}

/// Totals reported once a queue has drained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSummary {
    pub succeeded: u64,
    pub failed: u64,
    pub retries: u64,
    /// Enqueue calls refused (bad identifier, full or closed)
    pub rejected: u64,
}

impl QueueSummary {
    pub fn total(&self) -> u64 {
        self.succeeded + self.failed
    }
}
