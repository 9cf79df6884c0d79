//! Worker slots and the shared queue state they pull from

use super::{Callbacks, Job, JobId, JobState, QueueConfig, QueueError, QueueStats, QueueSummary, Result, RetryPolicy};
use crate::fetcher::{FetchError, Fetcher};
use crate::identifier::Identifier;
use crate::observability::QueueMetrics;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Everything guarded by the single queue lock
#[derive(Default)]
struct State {
    backlog: VecDeque<Job>,
    in_flight: HashMap<JobId, Identifier>,
    succeeded: u64,
    failed: u64,
    closed: bool,
}

struct Shared {
    state: Mutex<State>,
    work_available: Notify,
    fetcher: Arc<dyn Fetcher>,
    callbacks: Callbacks,
    retry: RetryPolicy,
    max_backlog: usize,
    metrics: QueueMetrics,
}

impl Shared {
    /// Never held across an await
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, identifier: Identifier) -> Result<JobId> {
        let job = Job::new(identifier);
        let id = job.id;

        {
            let mut state = self.state();
            if state.closed {
                drop(state);
                self.metrics.job_rejected();
                return Err(QueueError::Closed);
            }
            if state.backlog.len() >= self.max_backlog {
                drop(state);
                self.metrics.job_rejected();
                return Err(QueueError::QueueFull {
                    capacity: self.max_backlog,
                });
            }
            debug!(job_id = %id, identifier = %job.identifier, "Job enqueued");
            state.backlog.push_back(job);
        }

        self.metrics.job_enqueued();
        self.work_available.notify_one();
        Ok(id)
    }

    /// Next job for a worker: `Some(job)` claimed, `None` when closed and drained
    async fn next_job(&self) -> Option<Job> {
        loop {
            let notified = self.work_available.notified();
            tokio::pin!(notified);
            // Register before looking, so an enqueue between the check and
            // the await still wakes us
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(mut job) = state.backlog.pop_front() {
                    job.claim();
                    state.in_flight.insert(job.id, job.identifier.clone());
                    return Some(job);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    fn close(&self) {
        let mut state = self.state();
        if !state.closed {
            state.closed = true;
            debug!(pending = state.backlog.len(), in_flight = state.in_flight.len(), "Queue closing");
        }
        drop(state);
        self.work_available.notify_waiters();
    }

    fn stats(&self) -> QueueStats {
        let metrics = self.metrics.snapshot();
        let state = self.state();
        QueueStats {
            pending: state.backlog.len(),
            in_flight: state.in_flight.len(),
            succeeded: state.succeeded,
            failed: state.failed,
            retries: metrics.fetch_retries,
            rejected: metrics.jobs_rejected,
            closed: state.closed,
        }
    }
}

/// Run one claimed job to its terminal state and deliver it
async fn process(shared: &Shared, slot: usize, mut job: Job) {
    let identifier = job.identifier.clone();

    loop {
        let attempt = job.begin_attempt();
        debug!(slot, identifier = %identifier, attempt, "Fetching");

        let outcome = AssertUnwindSafe(shared.fetcher.fetch(&identifier))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(FetchError::Internal(panic_message(panic.as_ref()))));

        match outcome {
            Ok(path) => {
                job.succeed(path);
                break;
            }
            Err(err) if shared.retry.should_retry(&err, attempt) => {
                let delay = shared.retry.backoff(attempt);
                warn!(
                    identifier = %identifier,
                    attempt,
                    max_attempts = shared.retry.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Fetch failed, retrying"
                );
                shared.metrics.fetch_retried();
                job.last_error = Some(err);
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                job.fail(err);
                break;
            }
        }
    }

    let state = job.state;
    let id = job.id;
    match state {
        JobState::Succeeded => shared.metrics.job_succeeded(),
        _ => shared.metrics.job_failed(),
    }

    deliver(&shared.callbacks, job);

    // The slot is released only after the callback has returned
    let mut guard = shared.state();
    guard.in_flight.remove(&id);
    match state {
        JobState::Succeeded => guard.succeeded += 1,
        _ => guard.failed += 1,
    }
}

/// Exactly one callback per job; a panicking callback is logged, not propagated
fn deliver(callbacks: &Callbacks, job: Job) {
    let callback = callbacks.callback_for(job.state).clone();
    let identifier = job.identifier.clone();

    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(move || callback(job))) {
        error!(
            identifier = %identifier,
            panic = %panic_message(panic.as_ref()),
            "Job callback panicked"
        );
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn run_worker(shared: Arc<Shared>, slot: usize) {
    debug!(slot, "Worker started");
    while let Some(job) = shared.next_job().await {
        process(&shared, slot, job).await;
    }
    debug!(slot, "Worker stopped");
}

/// Cloneable enqueue side of a queue, safe to share between tasks and threads
#[derive(Clone)]
pub struct QueueHandle {
    shared: Arc<Shared>,
}

impl QueueHandle {
    /// Validate `identifier` and append it to the backlog. Never blocks.
    pub fn enqueue(&self, identifier: &str) -> Result<JobId> {
        match Identifier::parse(identifier) {
            Ok(identifier) => self.shared.enqueue(identifier),
            Err(source) => {
                self.shared.metrics.job_rejected();
                Err(QueueError::InvalidIdentifier {
                    input: identifier.to_string(),
                    source,
                })
            }
        }
    }

    /// Enqueue an already validated identifier
    pub fn enqueue_identifier(&self, identifier: Identifier) -> Result<JobId> {
        self.shared.enqueue(identifier)
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.stats()
    }
}

/// Download queue owning its worker slots.
///
/// Dropping it without [`close`](Self::close) stops intake; the detached
/// workers still drain what was already accepted.
pub struct DownloadQueue {
    handle: QueueHandle,
    workers: Vec<JoinHandle<()>>,
}

impl DownloadQueue {
    /// Spawn `config.concurrency` workers on the current tokio runtime
    pub fn open(config: QueueConfig, fetcher: Arc<dyn Fetcher>, callbacks: Callbacks) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            work_available: Notify::new(),
            fetcher,
            callbacks,
            retry: config.retry,
            max_backlog: config.max_backlog,
            metrics: QueueMetrics::new(),
        });

        let workers = (0..config.concurrency)
            .map(|slot| tokio::spawn(run_worker(shared.clone(), slot)))
            .collect();

        info!(
            concurrency = config.concurrency,
            max_backlog = config.max_backlog,
            "Download queue opened"
        );

        Ok(Self {
            handle: QueueHandle { shared },
            workers,
        })
    }

    /// Open a queue, run `body` with a handle to it, then drain and close
    /// whether `body` succeeded, failed or panicked. A panic in `body` is
    /// resumed once the queue has drained.
    pub async fn scope<F, Fut, T, E>(
        config: QueueConfig,
        fetcher: Arc<dyn Fetcher>,
        callbacks: Callbacks,
        body: F,
    ) -> std::result::Result<(T, QueueSummary), E>
    where
        F: FnOnce(QueueHandle) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<QueueError>,
    {
        let queue = Self::open(config, fetcher, callbacks)?;
        let outcome = AssertUnwindSafe(body(queue.handle())).catch_unwind().await;
        let summary = queue.close().await;

        match outcome {
            Ok(result) => result.map(|value| (value, summary)),
            Err(panic) => {
                error!(
                    panic = %panic_message(panic.as_ref()),
                    "Queue scope body panicked after draining"
                );
                std::panic::resume_unwind(panic)
            }
        }
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    pub fn enqueue(&self, identifier: &str) -> Result<JobId> {
        self.handle.enqueue(identifier)
    }

    pub fn enqueue_identifier(&self, identifier: Identifier) -> Result<JobId> {
        self.handle.enqueue_identifier(identifier)
    }

    pub fn stats(&self) -> QueueStats {
        self.handle.stats()
    }

    /// Stop accepting jobs and wait until every accepted job was delivered
    pub async fn close(mut self) -> QueueSummary {
        let shared = self.handle.shared.clone();
        shared.close();

        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker task ended abnormally");
            }
        }

        let snapshot = shared.metrics.snapshot();
        let summary = QueueSummary {
            succeeded: snapshot.jobs_succeeded,
            failed: snapshot.jobs_failed,
            retries: snapshot.fetch_retries,
            rejected: snapshot.jobs_rejected,
        };

        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            retries = summary.retries,
            "Download queue drained"
        );
        summary
    }
}

impl Drop for DownloadQueue {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            warn!("Download queue dropped without close; draining in background");
            self.handle.shared.close();
        }
    }
}
