use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldsync::{
    job::{query::Query, JobId, JobStatus, NewJob, ParseError, SyncJob},
    store::{JobStore, Retry, StatusCounts, StoreError},
};
use sqlx::{sqlite::SqliteRow, FromRow, Row};
use tracing::instrument;

use crate::{map_err, types::JobRow, SqliteJobStore};

impl SqliteJobStore {
    fn handle_update(result: sqlx::Result<u64>, job_id: JobId) -> Result<(), StoreError> {
        match result {
            Ok(0) => Err(StoreError::JobNotFound(job_id)),
            Ok(1) => Ok(()),
            Ok(_) => Err(StoreError::BadState),
            Err(error) => Err(map_err(error)),
        }
    }

    fn decode(row: &SqliteRow) -> Result<SyncJob, StoreError> {
        JobRow::from_row(row).map_err(map_err)?.try_into()
    }

    /// Takes an undecodable row out of the queue so it cannot hold back the jobs around it.
    async fn quarantine(&self, row: &SqliteRow, err: StoreError) {
        let Ok(job_id) = row.try_get::<String, _>("id") else {
            tracing::error!(?err, "Skipping undecodable job without a readable id: {err}");
            return;
        };
        let discarded = row
            .try_get::<Option<i64>, _>("discarded_at")
            .ok()
            .flatten()
            .is_some();
        if discarded {
            tracing::debug!(%job_id, "Skipping discarded undecodable job {job_id}");
            return;
        }

        tracing::error!(%job_id, ?err, "Discarding undecodable job {job_id}, error: {err}");
        let message = format!("undecodable job: {err}");
        let _ = self
            .discard_undecodable(&job_id, &message)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to discard undecodable job {job_id}, error: {err:?}",
                )
            });
    }
}

fn count(value: Option<i64>) -> u64 {
    value.map_or(0, |value| value.max(0) as u64)
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job), fields(kind = %job.payload.kind()))]
    async fn enqueue(&self, job: NewJob) -> Result<JobId, StoreError> {
        self.insert_job(job).await
    }

    async fn get(&self, id: JobId) -> Result<Option<SyncJob>, StoreError> {
        self.load_job(id)
            .await
            .map_err(map_err)?
            .map(TryFrom::try_from)
            .transpose()
    }

    /// Rows that fail to decode are discarded and left out instead of failing the listing.
    async fn list_actionable(&self) -> Result<Vec<SyncJob>, StoreError> {
        let rows = self
            .run_query_raw(&Query::Or(vec![
                Query::StatusEqual(JobStatus::Pending),
                Query::StatusEqual(JobStatus::Failed),
            ]))
            .await
            .map_err(map_err)?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            match Self::decode(row) {
                Ok(job) => jobs.push(job),
                Err(err) => self.quarantine(row, err).await,
            }
        }
        Ok(jobs)
    }

    async fn mark_processing(&self, id: JobId) -> Result<SyncJob, StoreError> {
        self._mark_processing(id)
            .await
            .map_err(map_err)?
            .ok_or(StoreError::JobNotFound(id))?
            .try_into()
    }

    async fn mark_completed(&self, id: JobId) -> Result<(), StoreError> {
        let result = self._mark_completed(id).await;
        Self::handle_update(result, id)
    }

    async fn mark_failed(&self, id: JobId, error: &str, retry: Retry) -> Result<(), StoreError> {
        let result = self._mark_failed(id, error, retry).await;
        Self::handle_update(result, id)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn reset_for_retry(&self, ids: &[JobId]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.reset(ids).await.map_err(map_err)
    }

    #[instrument(skip(self))]
    async fn prune(&self, query: &Query<'_>) -> Result<u64, StoreError> {
        self.delete_matching(query).await.map_err(map_err)
    }

    async fn query(&self, query: &Query<'_>) -> Result<Vec<SyncJob>, StoreError> {
        self.run_query(query)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(TryFrom::try_from)
            .collect()
    }

    async fn counts(&self) -> Result<StatusCounts, StoreError> {
        let row = self.count_by_status().await.map_err(map_err)?;
        Ok(StatusCounts {
            pending: count(row.pending),
            processing: count(row.processing),
            completed: count(row.completed),
            failed: count(row.failed),
            exhausted: count(row.exhausted),
        })
    }

    #[instrument(skip(self))]
    async fn recover_abandoned(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>, StoreError> {
        self.recover(cutoff)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(|(id,)| {
                id.parse()
                    .map_err(|_| StoreError::Decode(ParseError::new("job id", id)))
            })
            .collect()
    }
}
