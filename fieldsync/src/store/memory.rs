//! Provides an in memory implementation of [`JobStore`].
//!
//! Jobs are lost when the process exits, so this store suits tests and hosts that embed the
//! engine for short-lived work. Devices should use the SQLite store.
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::job::{query::Query, JobId, JobStatus, NewJob, SyncJob};

use super::{queryable::Queryable, JobStore, Retry, StatusCounts, StoreError, INTERRUPTED_ERROR};

/// An in memory implementation of [`JobStore`].
///
/// Cloning is cheap and every clone shares the same jobs.
#[derive(Clone, Default, Debug)]
pub struct InMemoryJobStore {
    jobs: Arc<RwLock<Vec<SyncJob>>>,
}

impl InMemoryJobStore {
    /// Creates a new instance of [`InMemoryJobStore`].
    pub fn new() -> Self {
        Self::default()
    }

    fn update<T>(&self, id: JobId, f: impl FnOnce(&mut SyncJob) -> T) -> Result<T, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        match jobs.iter_mut().find(|job| job.id == id) {
            None => Err(StoreError::JobNotFound(id)),
            Some(job) => Ok(f(job)),
        }
    }

    fn matching_jobs(&self, queryable: &impl Queryable) -> Result<Vec<SyncJob>, StoreError> {
        let mut jobs: Vec<_> = self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .filter(|job| queryable.matches(job))
            .cloned()
            .collect();
        // Stable sort: jobs with equal priority and creation time keep insertion order.
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(jobs)
    }
}

impl SyncJob {
    fn mark_processing(&mut self) {
        self.last_attempt_at = Some(Utc::now());
        self.attempts += 1;
        self.status = JobStatus::Processing;
    }

    fn mark_completed(&mut self) {
        self.completed_at = Some(Utc::now());
        self.error = None;
        self.next_attempt_at = None;
        self.status = JobStatus::Completed;
    }

    fn mark_failed(&mut self, error: &str, retry: Retry) {
        self.error = Some(error.to_owned());
        self.status = JobStatus::Failed;
        match retry {
            Retry::At(next_attempt_at) => self.next_attempt_at = Some(next_attempt_at),
            Retry::Never => self.next_attempt_at = None,
            Retry::Discard => {
                self.next_attempt_at = None;
                self.discarded_at = Some(Utc::now());
            }
        }
    }

    fn reset_for_retry(&mut self) {
        self.status = JobStatus::Pending;
        self.attempts = 0;
        self.error = None;
        self.next_attempt_at = None;
        self.discarded_at = None;
    }

    fn mark_interrupted(&mut self) {
        self.status = JobStatus::Pending;
        self.error = Some(INTERRUPTED_ERROR.to_owned());
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, StoreError> {
        let job = SyncJob::new(job, Utc::now());
        let id = job.id;
        self.jobs
            .write()
            .map_err(|_| StoreError::BadState)?
            .push(job);
        Ok(id)
    }

    async fn get(&self, id: JobId) -> Result<Option<SyncJob>, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .find(|job| job.id == id)
            .cloned())
    }

    async fn list_actionable(&self) -> Result<Vec<SyncJob>, StoreError> {
        self.matching_jobs(&Query::Or(vec![
            Query::StatusEqual(JobStatus::Pending),
            Query::StatusEqual(JobStatus::Failed),
        ]))
    }

    async fn mark_processing(&self, id: JobId) -> Result<SyncJob, StoreError> {
        self.update(id, |job| {
            job.mark_processing();
            job.clone()
        })
    }

    async fn mark_completed(&self, id: JobId) -> Result<(), StoreError> {
        self.update(id, SyncJob::mark_completed)
    }

    async fn mark_failed(&self, id: JobId, error: &str, retry: Retry) -> Result<(), StoreError> {
        self.update(id, |job| job.mark_failed(error, retry))
    }

    async fn reset_for_retry(&self, ids: &[JobId]) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let mut count = 0;
        for job in jobs
            .iter_mut()
            .filter(|job| ids.contains(&job.id) && job.status != JobStatus::Processing)
        {
            job.reset_for_retry();
            count += 1;
        }
        Ok(count)
    }

    async fn prune(&self, query: &Query<'_>) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let before = jobs.len();
        jobs.retain(|job| !query.matches(job));
        Ok((before - jobs.len()) as u64)
    }

    async fn query(&self, query: &Query<'_>) -> Result<Vec<SyncJob>, StoreError> {
        self.matching_jobs(query)
    }

    async fn counts(&self) -> Result<StatusCounts, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::BadState)?;
        Ok(jobs.iter().fold(StatusCounts::default(), |mut counts, job| {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
            if Query::Exhausted.matches(job) {
                counts.exhausted += 1;
            }
            counts
        }))
    }

    async fn recover_abandoned(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        Ok(jobs
            .iter_mut()
            .filter(|job| {
                job.status == JobStatus::Processing
                    && job.last_attempt_at.map_or(true, |attempted| attempted < cutoff)
            })
            .map(|job| {
                job.mark_interrupted();
                job.id
            })
            .collect())
    }
}
