use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    handler::{HandlerError, SyncHandler},
    job::{JobKind, JobPayload, SyncJob},
    remote::RemoteApi,
};

/// Applies a metadata patch with `PATCH /{entityType}/{entityId}`.
pub struct MetadataPatchSaga {
    remote: Arc<dyn RemoteApi>,
}

impl MetadataPatchSaga {
    pub fn new(remote: Arc<dyn RemoteApi>) -> Self {
        Self { remote }
    }
}

#[async_trait]
impl SyncHandler for MetadataPatchSaga {
    fn kind(&self) -> JobKind {
        JobKind::Metadata
    }

    async fn execute(&self, job: &SyncJob) -> Result<(), HandlerError> {
        let JobPayload::Metadata(patch) = &job.payload else {
            return Err(HandlerError::payload_mismatch(self.kind(), job));
        };
        self.remote
            .patch_entity(&patch.entity_type, &patch.entity_id, &patch.changes)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use chrono::Utc;
    use mockall::predicate::eq;

    use super::*;
    use crate::{
        job::Priority,
        remote::{MockRemoteApi, RemoteError},
        store::testing::fixtures,
    };

    #[tokio::test]
    async fn patches_the_entity() {
        let mut remote = MockRemoteApi::new();
        remote
            .expect_patch_entity()
            .with(
                eq("polygon"),
                eq("pg-7"),
                eq(serde_json::json!({ "notes": "re-measured" })),
            )
            .times(1)
            .returning(|_, _, _| Ok(()));
        let job = SyncJob::new(fixtures::metadata_job("polygon", "pg-7"), Utc::now());
        let saga = MetadataPatchSaga::new(Arc::new(remote));

        saga.execute(&job).await.unwrap();
    }

    #[tokio::test]
    async fn missing_entity_is_terminal() {
        let mut remote = MockRemoteApi::new();
        remote.expect_patch_entity().returning(|_, _, _| {
            Err(RemoteError::Status {
                status: 404,
                body: String::new(),
            })
        });
        let job = SyncJob::new(fixtures::metadata_job("polygon", "pg-7"), Utc::now());
        let saga = MetadataPatchSaga::new(Arc::new(remote));

        assert!(saga.execute(&job).await.unwrap_err().is_terminal());
    }

    #[tokio::test]
    async fn wrong_payload_is_terminal() {
        let job = SyncJob::new(fixtures::project_job(Priority::Low), Utc::now());
        let saga = MetadataPatchSaga::new(Arc::new(MockRemoteApi::new()));

        assert!(saga.execute(&job).await.unwrap_err().is_terminal());
    }
}
