use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    handler::{HandlerError, SyncHandler},
    job::{JobKind, JobPayload, SyncJob},
    remote::RemoteApi,
};

/// Submits a project snapshot with `POST /projects`.
pub struct ProjectSubmitSaga {
    remote: Arc<dyn RemoteApi>,
}

impl ProjectSubmitSaga {
    pub fn new(remote: Arc<dyn RemoteApi>) -> Self {
        Self { remote }
    }
}

#[async_trait]
impl SyncHandler for ProjectSubmitSaga {
    fn kind(&self) -> JobKind {
        JobKind::Project
    }

    async fn execute(&self, job: &SyncJob) -> Result<(), HandlerError> {
        let JobPayload::Project(project) = &job.payload else {
            return Err(HandlerError::payload_mismatch(self.kind(), job));
        };
        self.remote.submit_project(project).await?;
        tracing::debug!(project_id = %project.id, "Submitted project");
        Ok(())
    }
}
