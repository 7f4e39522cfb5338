use crate::store::{JobStore, StoreError};

use super::{
    JobId, JobPayload, MetadataPatch, NewJob, PhotoSnapshot, Priority, ProjectSnapshot,
    DEFAULT_MAX_ATTEMPTS,
};

/// Builder for [`NewJob`].
///
/// # Example
///
/// ```
/// # use fieldsync::prelude::*;
/// let job = JobBuilder::project(ProjectSnapshot {
///     id: "project-1".into(),
///     body: serde_json::json!({ "name": "North ridge" }),
/// })
/// .with_priority(Priority::High)
/// .with_max_attempts(5)
/// .build();
///
/// assert_eq!(job.priority, Priority::High);
/// assert_eq!(job.max_attempts, 5);
/// ```
#[derive(Debug, Clone)]
pub struct JobBuilder {
    payload: JobPayload,
    priority: Priority,
    max_attempts: Option<u16>,
}

impl JobBuilder {
    pub fn new(payload: JobPayload) -> Self {
        Self {
            payload,
            priority: Priority::default(),
            max_attempts: None,
        }
    }

    pub fn photo(snapshot: PhotoSnapshot) -> Self {
        Self::new(JobPayload::Photo(snapshot))
    }

    pub fn project(snapshot: ProjectSnapshot) -> Self {
        Self::new(JobPayload::Project(snapshot))
    }

    pub fn metadata(patch: MetadataPatch) -> Self {
        Self::new(JobPayload::Metadata(patch))
    }

    pub fn with_priority(self, priority: Priority) -> Self {
        Self { priority, ..self }
    }

    pub fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..self
        }
    }

    pub(crate) fn max_attempts_or(self, default: u16) -> Self {
        Self {
            max_attempts: self.max_attempts.or(Some(default)),
            ..self
        }
    }

    pub fn build(self) -> NewJob {
        NewJob {
            payload: self.payload,
            priority: self.priority,
            max_attempts: self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
        }
    }

    /// Builds the job and writes it straight to `store`.
    ///
    /// This does not wake the scheduler; prefer [`crate::SyncEngine::enqueue`] when an engine
    /// is running.
    pub async fn enqueue_to_store<S: JobStore + ?Sized>(
        self,
        store: &S,
    ) -> Result<JobId, StoreError> {
        store.enqueue(self.build()).await
    }
}
