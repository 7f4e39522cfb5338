//! Test suite for ensuring a correct implementation of a [`JobStore`].
use assert_matches::assert_matches;
use chrono::{SubsecRound, TimeDelta, Utc};

use crate::job::{builder::JobBuilder, query::Query, JobId, JobKind, JobStatus, Priority};

use super::*;

/// Jobs used by the conformance suite and by the engine's own tests.
pub mod fixtures {
    use std::path::PathBuf;

    use chrono::{TimeZone, Utc};

    use crate::job::{
        builder::JobBuilder, MetadataPatch, NewJob, PhotoSnapshot, Priority, ProjectSnapshot,
    };

    pub fn photo_snapshot(id: &str, local_path: PathBuf, sha256: &str) -> PhotoSnapshot {
        PhotoSnapshot {
            id: id.to_owned(),
            project_id: "project-1".to_owned(),
            polygon_id: Some("polygon-1".to_owned()),
            local_path,
            file_name: format!("{id}.jpg"),
            file_size: 4,
            mime_type: "image/jpeg".to_owned(),
            sha256: sha256.to_owned(),
            exif_data: serde_json::json!({ "Make": "FieldCam" }),
            measurements: serde_json::json!({ "dbh_cm": 31.5 }),
            metadata: serde_json::json!({ "species": "quercus robur" }),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap(),
        }
    }

    pub fn photo_job(priority: Priority) -> NewJob {
        JobBuilder::photo(photo_snapshot(
            &uuid::Uuid::now_v7().to_string(),
            PathBuf::from("/data/photos/missing.jpg"),
            "00",
        ))
        .with_priority(priority)
        .build()
    }

    pub fn project_job(priority: Priority) -> NewJob {
        JobBuilder::project(ProjectSnapshot {
            id: uuid::Uuid::now_v7().to_string(),
            body: serde_json::json!({ "name": "North ridge", "area_ha": 12.5 }),
        })
        .with_priority(priority)
        .build()
    }

    pub fn metadata_job(entity_type: &str, entity_id: &str) -> NewJob {
        JobBuilder::metadata(MetadataPatch {
            entity_type: entity_type.to_owned(),
            entity_id: entity_id.to_owned(),
            changes: serde_json::json!({ "notes": "re-measured" }),
        })
        .build()
    }
}

use fixtures::{metadata_job, photo_job, project_job};

/// Create test suite for a [`JobStore`] implementation.
///
/// For store implementors, it is useful to include this as part of your test suite.
///
/// # Example
///
/// ```
/// use fieldsync::store::memory::InMemoryJobStore;
/// use fieldsync::store_test_suite;
/// store_test_suite!(for: InMemoryJobStore::new());
/// ```
///
/// If you are using a different async test attribute, or need arguments, you can configure the
/// macro to use those instead:
///
/// ```ignore
/// store_test_suite!(
///     attr: tokio::test,
///     args: (),
///     store: SqliteJobStore::in_memory().await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! store_test_suite {
    (for: $store:expr) => {
        $crate::store_test_suite!(attr: tokio::test, args: (), store: $store);
    };
    (attr: $attr:meta, args: $args:tt, store: $store:expr) => {
        $crate::store_test_suite!(@tests $attr, $args, $store;
            enqueue,
            enqueue_persists_payload,
            get_unknown_job,
            list_actionable_orders_by_priority_then_age,
            list_actionable_only_pending_and_failed,
            list_actionable_includes_backoff_and_exhausted,
            mark_processing,
            mark_processing_job_not_found,
            mark_completed,
            mark_completed_job_not_found,
            mark_failed_retry_at,
            mark_failed_never,
            mark_failed_discard,
            mark_failed_job_not_found,
            reset_for_retry,
            reset_for_retry_skips_processing,
            reset_for_retry_empty,
            prune,
            prune_all,
            query,
            query_exhausted,
            counts,
            recover_abandoned,
            recover_abandoned_keeps_recent,
        );
    };
    (@tests $attr:meta, $args:tt, $store:expr; $($name:ident),* $(,)?) => {
        $(
            #[$attr]
            async fn $name $args {
                let store = $store;
                $crate::store::testing::$name(store).await;
            }
        )*
    };
}

#[doc(hidden)]
pub async fn enqueue(store: impl JobStore) {
    let id1 = store.enqueue(photo_job(Priority::High)).await.unwrap();
    let id2 = store.enqueue(photo_job(Priority::High)).await.unwrap();

    assert_ne!(id1, id2);
    let job = store.get(id1).await.unwrap().unwrap();
    assert_eq!(job.id, id1);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.kind, JobKind::Photo);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_attempts, 3);
    assert_eq!(job.last_attempt_at, None);
    assert_eq!(job.next_attempt_at, None);
    assert_eq!(job.error, None);
    assert_eq!(job.completed_at, None);
    assert_eq!(job.discarded_at, None);
    assert!(store.get(id2).await.unwrap().is_some());
}

#[doc(hidden)]
pub async fn enqueue_persists_payload(store: impl JobStore) {
    let new_job = metadata_job("polygon", "polygon-9");
    let id = store.enqueue(new_job.clone()).await.unwrap();

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.payload, new_job.payload);
    assert_eq!(job.entity_id, "polygon-9");
    assert_eq!(job.kind, JobKind::Metadata);
    assert_eq!(job.priority, Priority::Normal);
}

#[doc(hidden)]
pub async fn get_unknown_job(store: impl JobStore) {
    assert_eq!(store.get(JobId::new()).await.unwrap(), None);
}

#[doc(hidden)]
pub async fn list_actionable_orders_by_priority_then_age(store: impl JobStore) {
    let normal1 = store.enqueue(project_job(Priority::Normal)).await.unwrap();
    let low = store.enqueue(photo_job(Priority::Low)).await.unwrap();
    let high = store.enqueue(photo_job(Priority::High)).await.unwrap();
    let normal2 = store.enqueue(project_job(Priority::Normal)).await.unwrap();
    let critical = store
        .enqueue(
            JobBuilder::new(metadata_job("photo", "photo-1").payload)
                .with_priority(Priority::Critical)
                .build(),
        )
        .await
        .unwrap();

    let ids: Vec<_> = store
        .list_actionable()
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();

    assert_eq!(ids, [critical, high, normal1, normal2, low]);
}

#[doc(hidden)]
pub async fn list_actionable_only_pending_and_failed(store: impl JobStore) {
    let pending = store.enqueue(project_job(Priority::Normal)).await.unwrap();
    let processing = store.enqueue(project_job(Priority::Normal)).await.unwrap();
    let completed = store.enqueue(project_job(Priority::Normal)).await.unwrap();
    let failed = store.enqueue(project_job(Priority::Normal)).await.unwrap();

    store.mark_processing(processing).await.unwrap();
    store.mark_processing(completed).await.unwrap();
    store.mark_completed(completed).await.unwrap();
    store.mark_processing(failed).await.unwrap();
    store
        .mark_failed(failed, "boom", Retry::At(Utc::now()))
        .await
        .unwrap();

    let ids: Vec<_> = store
        .list_actionable()
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();

    assert_eq!(ids, [pending, failed]);
}

#[doc(hidden)]
pub async fn list_actionable_includes_backoff_and_exhausted(store: impl JobStore) {
    let delayed = store.enqueue(project_job(Priority::Normal)).await.unwrap();
    let exhausted = store.enqueue(project_job(Priority::Normal)).await.unwrap();

    store.mark_processing(delayed).await.unwrap();
    store
        .mark_failed(delayed, "later", Retry::At(Utc::now() + TimeDelta::hours(1)))
        .await
        .unwrap();
    for _ in 0..3 {
        store.mark_processing(exhausted).await.unwrap();
        store.mark_failed(exhausted, "again", Retry::Never).await.unwrap();
    }

    let jobs = store.list_actionable().await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(!jobs[0].is_due(Utc::now()));
    assert!(jobs[1].is_exhausted());
}

#[doc(hidden)]
pub async fn mark_processing(store: impl JobStore) {
    let id = store.enqueue(photo_job(Priority::Normal)).await.unwrap();
    let before = Utc::now().trunc_subsecs(3);

    let job = store.mark_processing(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.attempts, 1);
    assert_matches!(job.last_attempt_at, Some(at) if at >= before);
    assert_eq!(store.get(id).await.unwrap().unwrap(), job);

    let job = store.mark_processing(id).await.unwrap();
    assert_eq!(job.attempts, 2);
}

#[doc(hidden)]
pub async fn mark_processing_job_not_found(store: impl JobStore) {
    let result = store.mark_processing(JobId::new()).await;
    assert_matches!(result, Err(StoreError::JobNotFound(_)));
}

#[doc(hidden)]
pub async fn mark_completed(store: impl JobStore) {
    let id = store.enqueue(photo_job(Priority::Normal)).await.unwrap();
    store.mark_processing(id).await.unwrap();
    store
        .mark_failed(id, "first try", Retry::At(Utc::now()))
        .await
        .unwrap();
    store.mark_processing(id).await.unwrap();

    store.mark_completed(id).await.unwrap();

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.completed_at.is_some());
    assert_eq!(job.error, None);
    assert_eq!(job.next_attempt_at, None);
    assert_eq!(job.attempts, 2);
}

#[doc(hidden)]
pub async fn mark_completed_job_not_found(store: impl JobStore) {
    let result = store.mark_completed(JobId::new()).await;
    assert_matches!(result, Err(StoreError::JobNotFound(_)));
}

#[doc(hidden)]
pub async fn mark_failed_retry_at(store: impl JobStore) {
    let id = store.enqueue(photo_job(Priority::Normal)).await.unwrap();
    store.mark_processing(id).await.unwrap();
    let next = (Utc::now() + TimeDelta::seconds(1)).trunc_subsecs(3);

    store
        .mark_failed(id, "connection reset", Retry::At(next))
        .await
        .unwrap();

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("connection reset"));
    assert_eq!(job.next_attempt_at, Some(next));
    assert_eq!(job.discarded_at, None);
    assert!(!job.is_terminal());
}

#[doc(hidden)]
pub async fn mark_failed_never(store: impl JobStore) {
    let id = store.enqueue(photo_job(Priority::Normal)).await.unwrap();
    store.mark_processing(id).await.unwrap();
    store
        .mark_failed(id, "first", Retry::At(Utc::now() + TimeDelta::seconds(1)))
        .await
        .unwrap();

    store.mark_failed(id, "last", Retry::Never).await.unwrap();

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("last"));
    assert_eq!(job.next_attempt_at, None);
    assert_eq!(job.discarded_at, None);
}

#[doc(hidden)]
pub async fn mark_failed_discard(store: impl JobStore) {
    let id = store.enqueue(photo_job(Priority::Normal)).await.unwrap();
    store.mark_processing(id).await.unwrap();

    store
        .mark_failed(id, "422 Unprocessable Entity", Retry::Discard)
        .await
        .unwrap();

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert!(job.discarded_at.is_some());
    assert_eq!(job.next_attempt_at, None);
    assert!(job.is_terminal());
}

#[doc(hidden)]
pub async fn mark_failed_job_not_found(store: impl JobStore) {
    let result = store.mark_failed(JobId::new(), "error", Retry::Never).await;
    assert_matches!(result, Err(StoreError::JobNotFound(_)));
}

#[doc(hidden)]
pub async fn reset_for_retry(store: impl JobStore) {
    let mut ids = vec![];
    for attempts in 1..=3 {
        let id = store.enqueue(photo_job(Priority::Normal)).await.unwrap();
        for _ in 0..attempts {
            store.mark_processing(id).await.unwrap();
            store
                .mark_failed(id, "failed", Retry::At(Utc::now() + TimeDelta::minutes(5)))
                .await
                .unwrap();
        }
        ids.push(id);
    }
    let discarded = store.enqueue(photo_job(Priority::Normal)).await.unwrap();
    store.mark_processing(discarded).await.unwrap();
    store
        .mark_failed(discarded, "bad request", Retry::Discard)
        .await
        .unwrap();
    ids.push(discarded);

    let count = store.reset_for_retry(&ids).await.unwrap();
    assert_eq!(count, 4);

    for id in ids {
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.error, None);
        assert_eq!(job.next_attempt_at, None);
        assert_eq!(job.discarded_at, None);
        assert!(!job.is_terminal());
    }
}

#[doc(hidden)]
pub async fn reset_for_retry_skips_processing(store: impl JobStore) {
    let processing = store.enqueue(photo_job(Priority::Normal)).await.unwrap();
    let failed = store.enqueue(photo_job(Priority::Normal)).await.unwrap();
    let untouched = store.enqueue(photo_job(Priority::Normal)).await.unwrap();
    store.mark_processing(processing).await.unwrap();
    store.mark_processing(failed).await.unwrap();
    store.mark_failed(failed, "failed", Retry::Never).await.unwrap();
    store.mark_processing(untouched).await.unwrap();
    store.mark_failed(untouched, "failed", Retry::Never).await.unwrap();

    let count = store.reset_for_retry(&[processing, failed]).await.unwrap();
    assert_eq!(count, 1);

    let job = store.get(processing).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.attempts, 1);
    let job = store.get(untouched).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
}

#[doc(hidden)]
pub async fn reset_for_retry_empty(store: impl JobStore) {
    store.enqueue(photo_job(Priority::Normal)).await.unwrap();
    assert_eq!(store.reset_for_retry(&[]).await.unwrap(), 0);
}

#[doc(hidden)]
pub async fn prune(store: impl JobStore) {
    let completed = store.enqueue(photo_job(Priority::Normal)).await.unwrap();
    let pending = store.enqueue(photo_job(Priority::Normal)).await.unwrap();
    let completed_project = store.enqueue(project_job(Priority::Normal)).await.unwrap();
    for id in [completed, completed_project] {
        store.mark_processing(id).await.unwrap();
        store.mark_completed(id).await.unwrap();
    }

    let count = store
        .prune(
            &Query::status_equal(JobStatus::Completed).and(Query::kind_equal(JobKind::Photo)),
        )
        .await
        .unwrap();
    assert_eq!(count, 1);

    assert!(store.get(completed).await.unwrap().is_none());
    assert!(store.get(pending).await.unwrap().is_some());
    assert!(store.get(completed_project).await.unwrap().is_some());

    let count = store
        .prune(&Query::completed_before(Utc::now() - TimeDelta::days(1)))
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[doc(hidden)]
pub async fn prune_all(store: impl JobStore) {
    for _ in 0..3 {
        store.enqueue(project_job(Priority::Low)).await.unwrap();
    }

    assert_eq!(store.prune(&Query::All).await.unwrap(), 3);
    assert!(store.query(&Query::All).await.unwrap().is_empty());
}

#[doc(hidden)]
pub async fn query(store: impl JobStore) {
    let photo = store.enqueue(photo_job(Priority::Low)).await.unwrap();
    let project = store.enqueue(project_job(Priority::High)).await.unwrap();
    let metadata = store.enqueue(metadata_job("photo", "photo-7")).await.unwrap();
    store.mark_processing(project).await.unwrap();

    let ids = |jobs: Vec<SyncJob>| jobs.into_iter().map(|job| job.id).collect::<Vec<_>>();

    assert_eq!(
        ids(store.query(&Query::All).await.unwrap()),
        [project, metadata, photo]
    );
    assert_eq!(
        ids(store
            .query(&Query::status_equal(JobStatus::Processing))
            .await
            .unwrap()),
        [project]
    );
    assert_eq!(
        ids(store
            .query(&!Query::status_equal(JobStatus::Processing))
            .await
            .unwrap()),
        [metadata, photo]
    );
    assert_eq!(
        ids(store.query(&Query::entity_equal("photo-7")).await.unwrap()),
        [metadata]
    );
    assert_eq!(
        ids(store
            .query(&Query::id_in(&[photo, metadata]).or(Query::priority_equal(Priority::High)))
            .await
            .unwrap()),
        [project, metadata, photo]
    );
    assert_eq!(
        ids(store
            .query(&Query::created_before(Utc::now() + TimeDelta::seconds(1)).and(
                Query::kind_equal(JobKind::Photo)
            ))
            .await
            .unwrap()),
        [photo]
    );
    assert!(store
        .query(&Query::And(vec![
            Query::kind_equal(JobKind::Photo),
            Query::kind_equal(JobKind::Project),
        ]))
        .await
        .unwrap()
        .is_empty());
}

#[doc(hidden)]
pub async fn query_exhausted(store: impl JobStore) {
    let exhausted = store.enqueue(photo_job(Priority::Normal)).await.unwrap();
    let discarded = store.enqueue(photo_job(Priority::Normal)).await.unwrap();
    let retryable = store.enqueue(photo_job(Priority::Normal)).await.unwrap();
    for _ in 0..3 {
        store.mark_processing(exhausted).await.unwrap();
        store.mark_failed(exhausted, "failed", Retry::Never).await.unwrap();
    }
    store.mark_processing(discarded).await.unwrap();
    store
        .mark_failed(discarded, "failed", Retry::Discard)
        .await
        .unwrap();
    store.mark_processing(retryable).await.unwrap();
    store
        .mark_failed(retryable, "failed", Retry::At(Utc::now()))
        .await
        .unwrap();

    let mut ids: Vec<_> = store
        .query(&Query::exhausted())
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();
    ids.sort();
    let mut expected = vec![exhausted, discarded];
    expected.sort();
    assert_eq!(ids, expected);
}

#[doc(hidden)]
pub async fn counts(store: impl JobStore) {
    assert_eq!(store.counts().await.unwrap(), StatusCounts::default());

    let _pending = store.enqueue(photo_job(Priority::Normal)).await.unwrap();
    let processing = store.enqueue(photo_job(Priority::Normal)).await.unwrap();
    let completed = store.enqueue(photo_job(Priority::Normal)).await.unwrap();
    let failed = store.enqueue(photo_job(Priority::Normal)).await.unwrap();
    let discarded = store.enqueue(photo_job(Priority::Normal)).await.unwrap();
    for id in [processing, completed, failed, discarded] {
        store.mark_processing(id).await.unwrap();
    }
    store.mark_completed(completed).await.unwrap();
    store
        .mark_failed(failed, "failed", Retry::At(Utc::now()))
        .await
        .unwrap();
    store
        .mark_failed(discarded, "failed", Retry::Discard)
        .await
        .unwrap();

    let counts = store.counts().await.unwrap();
    assert_eq!(
        counts,
        StatusCounts {
            pending: 1,
            processing: 1,
            completed: 1,
            failed: 2,
            exhausted: 1,
        }
    );
    assert_eq!(counts.total(), 5);
}

#[doc(hidden)]
pub async fn recover_abandoned(store: impl JobStore) {
    let abandoned = store.enqueue(photo_job(Priority::Normal)).await.unwrap();
    let pending = store.enqueue(photo_job(Priority::Normal)).await.unwrap();
    store.mark_processing(abandoned).await.unwrap();

    let recovered = store
        .recover_abandoned(Utc::now() + TimeDelta::seconds(1))
        .await
        .unwrap();
    assert_eq!(recovered, [abandoned]);

    let job = store.get(abandoned).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.error.as_deref(), Some(INTERRUPTED_ERROR));
    assert_eq!(
        store.get(pending).await.unwrap().unwrap().status,
        JobStatus::Pending
    );

    let ids: Vec<_> = store
        .list_actionable()
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(ids, [abandoned, pending]);
}

#[doc(hidden)]
pub async fn recover_abandoned_keeps_recent(store: impl JobStore) {
    let id = store.enqueue(photo_job(Priority::Normal)).await.unwrap();
    store.mark_processing(id).await.unwrap();

    let recovered = store
        .recover_abandoned(Utc::now() - TimeDelta::minutes(10))
        .await
        .unwrap();
    assert!(recovered.is_empty());
    assert_eq!(
        store.get(id).await.unwrap().unwrap().status,
        JobStatus::Processing
    );
}
