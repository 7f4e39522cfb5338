//! SQLite persistence for the `fieldsync` engine.
//!
//! [`SqliteJobStore`] is the durable [`JobStore`](fieldsync::store::JobStore) used on devices:
//! it runs in WAL mode with `synchronous = FULL`, so every committed transition survives power
//! loss. The schema is created by embedded migrations when the store is opened.
//!
//! [`SqliteEntityStateTracker`] mirrors sync status onto the host's own domain tables.
//!
//! # Example
//!
//! ```no_run
//! # use fieldsync_sqlx::SqliteJobStore;
//! # async fn open() -> Result<(), fieldsync::store::StoreError> {
//! let store = SqliteJobStore::connect("/data/fieldsync.db").await?;
//! # Ok(())
//! # }
//! ```
use std::{ops::Deref, path::Path, time::Duration};

use chrono::{DateTime, Utc};
use fieldsync::{
    job::{query::Query, JobId, NewJob, SyncJob},
    store::{Retry, StoreError, INTERRUPTED_ERROR},
};
use sqlx::{
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
    },
    QueryBuilder, SqlitePool,
};

use query::{push_id_list, ToQuery};
use types::{id_text, millis, CountsRow, JobRow, JOB_COLUMNS};

mod query;
mod store;
pub mod tracker;
mod types;

pub use tracker::{SqliteEntityStateTracker, TrackedTable};

/// A [`JobStore`](fieldsync::store::JobStore) backed by a SQLite database.
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Clone, Debug)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl Deref for SqliteJobStore {
    type Target = SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

fn map_err(error: impl std::error::Error + Send + Sync + 'static) -> StoreError {
    StoreError::Database(Box::new(error))
}

impl SqliteJobStore {
    /// Opens (creating if needed) the database at `path` and applies pending migrations.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(map_err)?;
        Self::from_pool(pool).await
    }

    /// Wraps an existing pool, applying pending migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::migrate!().run(&pool).await.map_err(map_err)?;
        Ok(Self { pool })
    }

    /// A private in-memory database. Every connection to `sqlite::memory:` is a separate
    /// database, so the pool holds exactly one connection and never recycles it.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(map_err)?;
        Self::from_pool(pool).await
    }

    async fn insert_job(&self, job: NewJob) -> Result<JobId, StoreError> {
        let job = SyncJob::new(job, Utc::now());
        let payload = serde_json::to_string(&job.payload)?;
        sqlx::query(
            "INSERT INTO sync_jobs (
                id, kind, entity_id, priority, payload, status, attempts, max_attempts, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(id_text(job.id))
        .bind(job.kind.as_str())
        .bind(job.entity_id.as_str())
        .bind(job.priority.rank())
        .bind(payload)
        .bind(job.status.as_str())
        .bind(i64::from(job.max_attempts))
        .bind(millis(job.created_at))
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(job.id)
    }

    async fn load_job(&self, id: JobId) -> sqlx::Result<Option<JobRow>> {
        let mut builder = Query::IdEquals(id).select();
        builder
            .build_query_as::<JobRow>()
            .fetch_optional(&self.pool)
            .await
    }

    async fn run_query(&self, query: &Query<'_>) -> sqlx::Result<Vec<JobRow>> {
        let mut builder = query.select();
        builder.build_query_as::<JobRow>().fetch_all(&self.pool).await
    }

    /// Like `run_query`, leaving each row to be decoded by the caller.
    async fn run_query_raw(&self, query: &Query<'_>) -> sqlx::Result<Vec<SqliteRow>> {
        let mut builder = query.select();
        builder.build().fetch_all(&self.pool).await
    }

    async fn _mark_processing(&self, id: JobId) -> sqlx::Result<Option<JobRow>> {
        let sql = format!(
            "UPDATE sync_jobs
            SET status = 'processing', attempts = attempts + 1, last_attempt_at = ?
            WHERE id = ?
            RETURNING {JOB_COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(millis(Utc::now()))
            .bind(id_text(id))
            .fetch_optional(&self.pool)
            .await
    }

    async fn _mark_completed(&self, id: JobId) -> sqlx::Result<u64> {
        sqlx::query(
            "UPDATE sync_jobs
            SET status = 'completed', completed_at = ?, error = NULL, next_attempt_at = NULL
            WHERE id = ?",
        )
        .bind(millis(Utc::now()))
        .bind(id_text(id))
        .execute(&self.pool)
        .await
        .map(|result| result.rows_affected())
    }

    async fn _mark_failed(&self, id: JobId, error: &str, retry: Retry) -> sqlx::Result<u64> {
        let (next_attempt_at, discarded_at) = match retry {
            Retry::At(at) => (Some(millis(at)), None),
            Retry::Never => (None, None),
            Retry::Discard => (None, Some(millis(Utc::now()))),
        };
        sqlx::query(
            "UPDATE sync_jobs
            SET status = 'failed',
                error = ?,
                next_attempt_at = ?,
                discarded_at = COALESCE(?, discarded_at)
            WHERE id = ?",
        )
        .bind(error)
        .bind(next_attempt_at)
        .bind(discarded_at)
        .bind(id_text(id))
        .execute(&self.pool)
        .await
        .map(|result| result.rows_affected())
    }

    /// Fails a row that can no longer be decoded for good. The id is taken verbatim, since
    /// it may itself be the corrupt column.
    async fn discard_undecodable(&self, id: &str, error: &str) -> sqlx::Result<u64> {
        sqlx::query(
            "UPDATE sync_jobs
            SET status = 'failed',
                error = ?,
                next_attempt_at = NULL,
                discarded_at = COALESCE(discarded_at, ?)
            WHERE id = ?",
        )
        .bind(error)
        .bind(millis(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await
        .map(|result| result.rows_affected())
    }

    async fn reset(&self, ids: &[JobId]) -> sqlx::Result<u64> {
        let mut builder = QueryBuilder::new(
            "UPDATE sync_jobs
            SET status = 'pending',
                attempts = 0,
                error = NULL,
                next_attempt_at = NULL,
                discarded_at = NULL
            WHERE status != 'processing' AND ",
        );
        push_id_list(&mut builder, ids);
        builder
            .build()
            .execute(&self.pool)
            .await
            .map(|result| result.rows_affected())
    }

    async fn delete_matching(&self, query: &Query<'_>) -> sqlx::Result<u64> {
        let mut builder = query.delete();
        builder
            .build()
            .execute(&self.pool)
            .await
            .map(|result| result.rows_affected())
    }

    async fn count_by_status(&self) -> sqlx::Result<CountsRow> {
        sqlx::query_as::<_, CountsRow>(
            "SELECT
                SUM(status = 'pending') AS pending,
                SUM(status = 'processing') AS processing,
                SUM(status = 'completed') AS completed,
                SUM(status = 'failed') AS failed,
                SUM(attempts >= max_attempts OR discarded_at IS NOT NULL) AS exhausted
            FROM sync_jobs",
        )
        .fetch_one(&self.pool)
        .await
    }

    async fn recover(&self, cutoff: DateTime<Utc>) -> sqlx::Result<Vec<(String,)>> {
        sqlx::query_as(
            "UPDATE sync_jobs
            SET status = 'pending', error = ?
            WHERE status = 'processing' AND (last_attempt_at IS NULL OR last_attempt_at < ?)
            RETURNING id",
        )
        .bind(INTERRUPTED_ERROR)
        .bind(millis(cutoff))
        .fetch_all(&self.pool)
        .await
    }
}
