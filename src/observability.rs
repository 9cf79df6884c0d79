//! Queue counters and logging setup

use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber, honouring `RUST_LOG`
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Counters recorded by a download queue over its lifetime
#[derive(Debug, Default)]
pub struct QueueMetrics {
    jobs_enqueued: AtomicU64,
    jobs_rejected: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    fetch_retries: AtomicU64,
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_enqueued(&self) {
        self.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "jobs_enqueued", "Metric incremented");
    }

    /// Enqueue refused (bad identifier, full backlog or closed queue)
    pub fn job_rejected(&self) {
        self.jobs_rejected.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "jobs_rejected", "Metric incremented");
    }

    pub fn job_succeeded(&self) {
        self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "jobs_succeeded", "Metric incremented");
    }

    pub fn job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "jobs_failed", "Metric incremented");
    }

    pub fn fetch_retried(&self) {
        self.fetch_retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "fetch_retries", "Metric incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_enqueued: self.jobs_enqueued.load(Ordering::Relaxed),
            jobs_rejected: self.jobs_rejected.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            fetch_retries: self.fetch_retries.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub jobs_enqueued: u64,
    pub jobs_rejected: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub fetch_retries: u64,
}

impl MetricsSnapshot {
    /// Jobs that reached a terminal state
    pub fn jobs_finished(&self) -> u64 {
        self.jobs_succeeded + self.jobs_failed
    }
}
