//! Durable persistence of [`SyncJob`]s.
//!
//! The [`JobStore`] is the single source of truth for the engine: every state transition of a
//! job is committed through it before and after the job's handler runs, so the queue survives
//! process death.
//!
//! Two implementations are provided:
//!
//! - [`memory::InMemoryJobStore`], for tests and embedding;
//! - `fieldsync_sqlx::SqliteJobStore`, the durable store used on devices.
//!
//! Implementors can run the shared conformance suite against their store with
//! [`store_test_suite!`](crate::store_test_suite) (requires the `testing` feature).
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::job::{query::Query, JobId, NewJob, ParseError, SyncJob};

pub mod memory;
mod queryable;
#[cfg(any(test, feature = "testing"))]
#[doc(hidden)]
pub mod testing;

/// What happens to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Retry automatically once the wall clock passes the given instant.
    At(DateTime<Utc>),
    /// No automatic retry. Used when a retryable failure happens on the final attempt.
    Never,
    /// The failure is terminal: record `discarded_at` and never retry automatically.
    Discard,
}

/// Per-status aggregate counts of the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    /// Jobs with no automatic retries left, regardless of status.
    pub exhausted: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("Error decoding stored value: {0}")]
    Decode(#[from] ParseError),
    #[error("Job not found: {0}")]
    JobNotFound(JobId),
    #[error("System in bad state")]
    BadState,
    #[error("Database error: {0}")]
    Database(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Durable, crash-safe persistence of [`SyncJob`]s.
///
/// Every transition must be durable when the returned future resolves.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a new job with status `Pending` and zero attempts.
    async fn enqueue(&self, job: NewJob) -> Result<JobId, StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<SyncJob>, StoreError>;

    /// Jobs with status `Pending` or `Failed`, ordered by priority (highest first), then
    /// creation time, then insertion order.
    ///
    /// Jobs still in backoff and exhausted jobs are included; deciding whether to run them is
    /// the scheduler's job. A stored job that can no longer be decoded must not fail the
    /// listing: it is left out and discarded.
    async fn list_actionable(&self) -> Result<Vec<SyncJob>, StoreError>;

    /// Moves the job to `Processing`, increments its attempts and stamps `last_attempt_at`.
    /// Returns the updated job.
    async fn mark_processing(&self, id: JobId) -> Result<SyncJob, StoreError>;

    /// Moves the job to `Completed`, clearing its error and backoff.
    async fn mark_completed(&self, id: JobId) -> Result<(), StoreError>;

    /// Moves the job to `Failed`, recording `error` and scheduling according to `retry`.
    async fn mark_failed(&self, id: JobId, error: &str, retry: Retry) -> Result<(), StoreError>;

    /// Returns the given jobs to `Pending` with zero attempts, bypassing backoff.
    ///
    /// Jobs currently `Processing` are left untouched. Returns the number of jobs reset.
    async fn reset_for_retry(&self, ids: &[JobId]) -> Result<u64, StoreError>;

    /// Deletes every job matching `query`, returning how many were removed.
    async fn prune(&self, query: &Query<'_>) -> Result<u64, StoreError>;

    /// Jobs matching `query`, in the same order as [`JobStore::list_actionable`].
    async fn query(&self, query: &Query<'_>) -> Result<Vec<SyncJob>, StoreError>;

    async fn counts(&self) -> Result<StatusCounts, StoreError>;

    /// Returns every `Processing` job last attempted before `cutoff` to `Pending`.
    ///
    /// These are jobs whose process died mid-execution. Their attempt counts are kept.
    async fn recover_abandoned(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>, StoreError>;
}

/// Error recorded on jobs returned to `Pending` by [`JobStore::recover_abandoned`].
pub const INTERRUPTED_ERROR: &str = "interrupted: the process stopped while the job was processing";
