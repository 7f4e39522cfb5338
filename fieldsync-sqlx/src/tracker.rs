//! Mirrors sync status onto host-owned domain tables.
//!
//! Each entity type is mapped to a table with a [`TrackedTable`]. The tracker only ever writes
//! the status and remote url columns; rows are created by the host.
//!
//! ```no_run
//! # use fieldsync_sqlx::{SqliteEntityStateTracker, TrackedTable};
//! # async fn open(pool: sqlx::SqlitePool) -> Result<(), fieldsync::tracker::TrackerError> {
//! let tracker = SqliteEntityStateTracker::new(
//!     pool,
//!     [
//!         TrackedTable::new("photo", "photos")
//!             .with_local_path_column("local_path")
//!             .with_sha256_column("sha256"),
//!         TrackedTable::new("project", "projects").without_remote_url(),
//!     ],
//! )?;
//! # Ok(())
//! # }
//! ```
use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use fieldsync::tracker::{EntityRef, EntityState, EntityStateTracker, SyncState, TrackerError};
use fxhash::FxHashMap;
use sqlx::{prelude::FromRow, SqlitePool};
use tracing::instrument;

/// Where the mirror of one entity type lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedTable {
    entity_type: String,
    table: String,
    id_column: String,
    status_column: String,
    remote_url_column: Option<String>,
    local_path_column: Option<String>,
    sha256_column: Option<String>,
}

impl TrackedTable {
    /// Maps `entity_type` to `table`, keyed by `id`, with the status in `sync_status` and the
    /// remote location in `remote_url`.
    pub fn new(entity_type: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            table: table.into(),
            id_column: "id".to_owned(),
            status_column: "sync_status".to_owned(),
            remote_url_column: Some("remote_url".to_owned()),
            local_path_column: None,
            sha256_column: None,
        }
    }

    pub fn with_id_column(mut self, column: impl Into<String>) -> Self {
        self.id_column = column.into();
        self
    }

    pub fn with_status_column(mut self, column: impl Into<String>) -> Self {
        self.status_column = column.into();
        self
    }

    pub fn with_remote_url_column(mut self, column: impl Into<String>) -> Self {
        self.remote_url_column = Some(column.into());
        self
    }

    /// For tables with nowhere to record a remote location. Remote urls are then dropped.
    pub fn without_remote_url(mut self) -> Self {
        self.remote_url_column = None;
        self
    }

    pub fn with_local_path_column(mut self, column: impl Into<String>) -> Self {
        self.local_path_column = Some(column.into());
        self
    }

    pub fn with_sha256_column(mut self, column: impl Into<String>) -> Self {
        self.sha256_column = Some(column.into());
        self
    }

    fn identifiers(&self) -> impl Iterator<Item = &str> {
        [&self.table, &self.id_column, &self.status_column]
            .into_iter()
            .chain(self.remote_url_column.iter())
            .chain(self.local_path_column.iter())
            .chain(self.sha256_column.iter())
            .map(String::as_str)
    }

    fn validate(&self) -> Result<(), TrackerError> {
        match self.identifiers().find(|name| !is_identifier(name)) {
            Some(name) => Err(TrackerError::Configuration(format!(
                "invalid SQL identifier {name:?} for {} entities",
                self.entity_type
            ))),
            None => Ok(()),
        }
    }

    fn update_sql(&self) -> String {
        let Self {
            table,
            id_column,
            status_column,
            ..
        } = self;
        match &self.remote_url_column {
            Some(remote_url) => format!(
                r#"UPDATE "{table}" SET "{status_column}" = ?, "{remote_url}" = COALESCE(?, "{remote_url}") WHERE "{id_column}" = ?"#
            ),
            None => format!(r#"UPDATE "{table}" SET "{status_column}" = ? WHERE "{id_column}" = ?"#),
        }
    }

    fn select_sql(&self) -> String {
        let column = |column: &Option<String>| {
            column
                .as_ref()
                .map_or_else(|| "NULL".to_owned(), |column| format!(r#""{column}""#))
        };
        format!(
            r#"SELECT "{}" AS status, {} AS remote_url, {} AS local_path, {} AS sha256 FROM "{}" WHERE "{}" = ?"#,
            self.status_column,
            column(&self.remote_url_column),
            column(&self.local_path_column),
            column(&self.sha256_column),
            self.table,
            self.id_column,
        )
    }
}

/// Only plain identifiers are accepted, since they are interpolated into statements.
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|char| char.is_ascii_alphanumeric() || char == '_')
}

#[derive(Debug, FromRow)]
struct EntityRow {
    status: Option<String>,
    remote_url: Option<String>,
    local_path: Option<String>,
    sha256: Option<String>,
}

impl TryFrom<EntityRow> for EntityState {
    type Error = TrackerError;

    fn try_from(value: EntityRow) -> Result<Self, Self::Error> {
        Ok(Self {
            local_path: value.local_path.map(PathBuf::from),
            sha256: value.sha256,
            remote_url: value.remote_url,
            // Rows the producer has not marked yet have not been synced either.
            status: value
                .status
                .map_or(Ok(SyncState::Pending), |status| status.parse())?,
        })
    }
}

fn map_err(error: sqlx::Error) -> TrackerError {
    TrackerError::Database(Box::new(error))
}

/// An [`EntityStateTracker`] writing to SQLite tables owned by the host.
#[derive(Clone, Debug)]
pub struct SqliteEntityStateTracker {
    pool: SqlitePool,
    tables: Arc<FxHashMap<String, TrackedTable>>,
}

impl SqliteEntityStateTracker {
    /// Fails with [`TrackerError::Configuration`] if any mapping names an invalid identifier.
    pub fn new(
        pool: SqlitePool,
        tables: impl IntoIterator<Item = TrackedTable>,
    ) -> Result<Self, TrackerError> {
        let tables = tables
            .into_iter()
            .map(|table| {
                table.validate()?;
                Ok((table.entity_type.clone(), table))
            })
            .collect::<Result<FxHashMap<_, _>, TrackerError>>()?;
        Ok(Self {
            pool,
            tables: Arc::new(tables),
        })
    }
}

#[async_trait]
impl EntityStateTracker for SqliteEntityStateTracker {
    #[instrument(skip(self, entity), fields(entity = %entity))]
    async fn set_state(
        &self,
        entity: &EntityRef,
        state: SyncState,
        remote_url: Option<&str>,
    ) -> Result<(), TrackerError> {
        let Some(table) = self.tables.get(&entity.entity_type) else {
            tracing::debug!("Ignoring state change of untracked entity type");
            return Ok(());
        };
        let sql = table.update_sql();
        let mut query = sqlx::query(&sql).bind(state.as_str());
        if table.remote_url_column.is_some() {
            query = query.bind(remote_url);
        }
        let result = query
            .bind(entity.entity_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        if result.rows_affected() == 0 {
            tracing::debug!("Ignoring state change of unknown entity");
        }
        Ok(())
    }

    async fn state(&self, entity: &EntityRef) -> Result<Option<EntityState>, TrackerError> {
        let Some(table) = self.tables.get(&entity.entity_type) else {
            return Ok(None);
        };
        let sql = table.select_sql();
        sqlx::query_as::<_, EntityRow>(&sql)
            .bind(entity.entity_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .map(TryFrom::try_from)
            .transpose()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use fieldsync::{
        handler::{HandlerError, Handlers, SyncHandler},
        job::{builder::JobBuilder, JobKind, JobStatus, MetadataPatch, SyncJob},
        network::{Connectivity, ManualNetworkMonitor},
        scheduler::{PassOutcome, Scheduler},
        store::JobStore,
        trigger::TriggerSource,
    };
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;
    use crate::SqliteJobStore;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE photos (
                id TEXT PRIMARY KEY,
                local_path TEXT NOT NULL,
                sha256 TEXT NOT NULL,
                sync_status TEXT,
                remote_url TEXT
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO photos (id, local_path, sha256, sync_status)
            VALUES ('ph-1', '/data/photos/ph-1.jpg', 'abc123', 'pending')",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    fn photos() -> TrackedTable {
        TrackedTable::new("photo", "photos")
            .with_local_path_column("local_path")
            .with_sha256_column("sha256")
    }

    #[tokio::test]
    async fn reads_and_writes_the_mirror() {
        let tracker = SqliteEntityStateTracker::new(pool().await, [photos()]).unwrap();
        let entity = EntityRef::new("photo", "ph-1");

        let state = tracker.state(&entity).await.unwrap().unwrap();
        assert_eq!(
            state,
            EntityState {
                local_path: Some(PathBuf::from("/data/photos/ph-1.jpg")),
                sha256: Some("abc123".to_owned()),
                remote_url: None,
                status: SyncState::Pending,
            }
        );

        tracker
            .set_state(&entity, SyncState::Uploading, None)
            .await
            .unwrap();
        assert_eq!(
            tracker.state(&entity).await.unwrap().unwrap().status,
            SyncState::Uploading
        );

        tracker
            .set_state(&entity, SyncState::Uploaded, Some("https://files/ph-1"))
            .await
            .unwrap();
        tracker
            .set_state(&entity, SyncState::Uploaded, None)
            .await
            .unwrap();
        let state = tracker.state(&entity).await.unwrap().unwrap();
        assert_eq!(state.status, SyncState::Uploaded);
        assert_eq!(state.remote_url.as_deref(), Some("https://files/ph-1"));
    }

    #[tokio::test]
    async fn unknown_entities_are_ignored() {
        let tracker = SqliteEntityStateTracker::new(pool().await, [photos()]).unwrap();

        let missing_row = EntityRef::new("photo", "ph-404");
        tracker
            .set_state(&missing_row, SyncState::Failed, None)
            .await
            .unwrap();
        assert_eq!(tracker.state(&missing_row).await.unwrap(), None);

        let untracked = EntityRef::new("polygon", "pg-1");
        tracker
            .set_state(&untracked, SyncState::Failed, None)
            .await
            .unwrap();
        assert_eq!(tracker.state(&untracked).await.unwrap(), None);
    }

    #[tokio::test]
    async fn tables_without_optional_columns() {
        let pool = pool().await;
        let tracker = SqliteEntityStateTracker::new(
            pool.clone(),
            [TrackedTable::new("photo", "photos").without_remote_url()],
        )
        .unwrap();
        let entity = EntityRef::new("photo", "ph-1");

        tracker
            .set_state(&entity, SyncState::Uploaded, Some("https://files/ph-1"))
            .await
            .unwrap();

        let state = tracker.state(&entity).await.unwrap().unwrap();
        assert_eq!(state.status, SyncState::Uploaded);
        assert_eq!(state.remote_url, None);
        assert_eq!(state.local_path, None);
    }

    #[tokio::test]
    async fn rejects_invalid_identifiers() {
        let result = SqliteEntityStateTracker::new(
            pool().await,
            [TrackedTable::new("photo", "photos; DROP TABLE photos")],
        );
        assert_matches!(result, Err(TrackerError::Configuration(_)));

        let result = SqliteEntityStateTracker::new(
            pool().await,
            [TrackedTable::new("photo", "photos").with_status_column("1status")],
        );
        assert_matches!(result, Err(TrackerError::Configuration(_)));
    }

    #[test]
    fn identifiers() {
        assert!(is_identifier("sync_status"));
        assert!(is_identifier("_photos2"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("2photos"));
        assert!(!is_identifier("photos\""));
    }

    struct AcceptAll;

    #[async_trait]
    impl SyncHandler for AcceptAll {
        fn kind(&self) -> JobKind {
            JobKind::Metadata
        }

        async fn execute(&self, _job: &SyncJob) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn pass_over_sqlite_updates_job_and_mirror() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        sqlx::query(
            "CREATE TABLE photos (
                id TEXT PRIMARY KEY,
                sync_status TEXT,
                remote_url TEXT
            )",
        )
        .execute(&*store)
        .await
        .unwrap();
        sqlx::query("INSERT INTO photos (id, sync_status) VALUES ('ph-1', 'pending')")
            .execute(&*store)
            .await
            .unwrap();
        let tracker =
            SqliteEntityStateTracker::new((*store).clone(), [TrackedTable::new("photo", "photos")])
                .unwrap();

        let id = store
            .enqueue(
                JobBuilder::metadata(MetadataPatch {
                    entity_type: "photo".to_owned(),
                    entity_id: "ph-1".to_owned(),
                    changes: serde_json::json!({ "notes": "re-measured" }),
                })
                .build(),
            )
            .await
            .unwrap();

        let scheduler = Scheduler::new(
            store.clone(),
            Arc::new(ManualNetworkMonitor::new(Connectivity::Reachable)),
            Arc::new(tracker.clone()),
            Handlers::new().with(AcceptAll),
        );
        let report = assert_matches!(
            scheduler.run_pass(TriggerSource::Manual).await,
            Ok(PassOutcome::Completed(report)) => report
        );
        assert_eq!(report.synced, 1);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 1);
        let state = tracker
            .state(&EntityRef::new("photo", "ph-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, SyncState::Uploaded);
    }
}
