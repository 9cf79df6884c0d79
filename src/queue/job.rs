//! Job lifecycle types

use crate::fetcher::FetchError;
use crate::identifier::Identifier;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use time::OffsetDateTime;
use uuid::Uuid;

/// Unique id of one enqueued job (UUID v7, so ids sort by enqueue time)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// One download request and where it ended up
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub identifier: Identifier,
    pub state: JobState,
    /// Fetch attempts started so far
    pub attempts: u32,
    pub last_error: Option<FetchError>,
    pub result_path: Option<PathBuf>,
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
}

impl Job {
    pub(crate) fn new(identifier: Identifier) -> Self {
        Self {
            id: JobId::new(),
            identifier,
            state: JobState::Pending,
            attempts: 0,
            last_error: None,
            result_path: None,
            enqueued_at: OffsetDateTime::now_utc(),
            finished_at: None,
        }
    }

    pub(crate) fn claim(&mut self) {
        debug_assert_eq!(self.state, JobState::Pending);
        self.state = JobState::InFlight;
    }

    pub(crate) fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub(crate) fn succeed(&mut self, path: PathBuf) {
        self.state = JobState::Succeeded;
        self.result_path = Some(path);
        self.finished_at = Some(OffsetDateTime::now_utc());
    }

    pub(crate) fn fail(&mut self, error: FetchError) {
        self.state = JobState::Failed;
        self.last_error = Some(error);
        self.finished_at = Some(OffsetDateTime::now_utc());
    }

    /// Time between enqueue and the terminal transition
    pub fn elapsed(&self) -> Option<time::Duration> {
        self.finished_at.map(|end| end - self.enqueued_at)
    }
}
