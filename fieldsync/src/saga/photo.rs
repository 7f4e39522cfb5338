use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::{
    handler::{HandlerError, SyncHandler},
    job::{JobKind, JobPayload, SyncJob},
    remote::{PhotoRecord, PresignRequest, RemoteApi},
    tracker::{EntityStateTracker, SyncState},
};

/// Uploads a captured photo and registers it with the remote.
///
/// Steps, all re-run on every attempt:
///
/// 1. verify the local file against the snapshot's SHA-256;
/// 2. request a presigned upload target keyed by name, size, mime type and hash;
/// 3. `PUT` the bytes to the target;
/// 4. submit the photo record referencing the remote location;
/// 5. mark the photo `uploaded` with its remote url.
///
/// A missing file or a hash mismatch can never succeed and fails terminally.
pub struct PhotoUploadSaga {
    remote: Arc<dyn RemoteApi>,
    tracker: Arc<dyn EntityStateTracker>,
}

impl PhotoUploadSaga {
    pub fn new(remote: Arc<dyn RemoteApi>, tracker: Arc<dyn EntityStateTracker>) -> Self {
        Self { remote, tracker }
    }
}

#[async_trait]
impl SyncHandler for PhotoUploadSaga {
    fn kind(&self) -> JobKind {
        JobKind::Photo
    }

    async fn execute(&self, job: &SyncJob) -> Result<(), HandlerError> {
        let JobPayload::Photo(photo) = &job.payload else {
            return Err(HandlerError::payload_mismatch(self.kind(), job));
        };

        let bytes = tokio::fs::read(&photo.local_path).await?;
        let digest = hex::encode(Sha256::digest(&bytes));
        if !digest.eq_ignore_ascii_case(&photo.sha256) {
            return Err(HandlerError::terminal(format!(
                "content of {} changed since capture: expected sha256 {}, found {digest}",
                photo.local_path.display(),
                photo.sha256,
            )));
        }

        let target = self
            .remote
            .presign_upload(&PresignRequest::from(photo))
            .await?;
        tracing::debug!(file_id = %target.file_id, "Acquired presigned upload target");

        self.remote
            .upload_bytes(&target, bytes, &photo.mime_type)
            .await?;
        let remote_url = target.remote_url();
        tracing::debug!(%remote_url, "Uploaded photo content");

        self.remote
            .submit_photo(&PhotoRecord::new(photo, remote_url))
            .await?;

        self.tracker
            .set_state(&job.entity(), SyncState::Uploaded, Some(remote_url))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use chrono::Utc;
    use mockall::predicate::eq;

    use super::*;
    use crate::{
        handler::ErrorKind,
        job::{builder::JobBuilder, Priority},
        remote::{test::FakeRemote, MockRemoteApi, PresignedUpload, RemoteError},
        store::testing::fixtures,
        tracker::{EntityRef, InMemoryEntityStateTracker},
    };

    const CONTENT: &[u8] = b"oak";

    struct Capture {
        _dir: tempfile::TempDir,
        job: SyncJob,
        tracker: InMemoryEntityStateTracker,
    }

    fn sha256(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    fn capture(content: &[u8], recorded_sha256: &str) -> Capture {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("ph-1.jpg");
        std::fs::write(&path, content).unwrap();
        let snapshot = fixtures::photo_snapshot("ph-1", path.clone(), recorded_sha256);
        let tracker = InMemoryEntityStateTracker::new();
        tracker
            .register(
                EntityRef::new("photo", "ph-1"),
                Some(&path),
                Some(recorded_sha256),
            )
            .unwrap();
        let job = SyncJob::new(
            JobBuilder::photo(snapshot)
                .with_priority(Priority::High)
                .build(),
            Utc::now(),
        );
        Capture {
            _dir: dir,
            job,
            tracker,
        }
    }

    fn target() -> PresignedUpload {
        PresignedUpload {
            upload_url: "https://files.example.com/ph-1.jpg?sig=xyz".to_owned(),
            file_id: "file-1".to_owned(),
        }
    }

    #[tokio::test]
    async fn uploads_then_submits_then_marks_uploaded() {
        let capture = capture(CONTENT, &sha256(CONTENT));
        let mut remote = MockRemoteApi::new();
        let mut sequence = mockall::Sequence::new();
        remote
            .expect_presign_upload()
            .withf(|request| request.file_name == "ph-1.jpg" && request.sha256 == sha256(CONTENT))
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| Ok(target()));
        remote
            .expect_upload_bytes()
            .with(eq(target()), eq(CONTENT.to_vec()), eq("image/jpeg"))
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _, _| Ok(()));
        remote
            .expect_submit_photo()
            .withf(|record| {
                record.id == "ph-1" && record.remote_url == "https://files.example.com/ph-1.jpg"
            })
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| Ok(()));
        let saga = PhotoUploadSaga::new(Arc::new(remote), Arc::new(capture.tracker.clone()));

        saga.execute(&capture.job).await.unwrap();

        let state = capture
            .tracker
            .state(&EntityRef::new("photo", "ph-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, SyncState::Uploaded);
        assert_eq!(
            state.remote_url.as_deref(),
            Some("https://files.example.com/ph-1.jpg")
        );
    }

    #[tokio::test]
    async fn rerun_does_not_duplicate_remote_records() {
        let capture = capture(CONTENT, &sha256(CONTENT));
        let remote = FakeRemote::default();
        let saga = PhotoUploadSaga::new(
            Arc::new(remote.clone()),
            Arc::new(capture.tracker.clone()),
        );

        saga.execute(&capture.job).await.unwrap();
        saga.execute(&capture.job).await.unwrap();

        assert_eq!(remote.photos.lock().unwrap().len(), 1);
        assert_eq!(remote.uploads.lock().unwrap().len(), 1);
        let state = capture
            .tracker
            .state(&EntityRef::new("photo", "ph-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, SyncState::Uploaded);
    }

    #[tokio::test]
    async fn failed_upload_fails_the_attempt() {
        let capture = capture(CONTENT, &sha256(CONTENT));
        let mut remote = MockRemoteApi::new();
        remote
            .expect_presign_upload()
            .returning(|_| Ok(target()));
        remote
            .expect_upload_bytes()
            .returning(|_, _, _| Err(RemoteError::Timeout));
        remote.expect_submit_photo().never();
        let saga = PhotoUploadSaga::new(Arc::new(remote), Arc::new(capture.tracker.clone()));

        let error = saga.execute(&capture.job).await.unwrap_err();

        assert_eq!(error.kind, ErrorKind::Retryable);
        let state = capture
            .tracker
            .state(&EntityRef::new("photo", "ph-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, SyncState::Pending);
    }

    #[tokio::test]
    async fn rejected_metadata_is_terminal() {
        let capture = capture(CONTENT, &sha256(CONTENT));
        let mut remote = MockRemoteApi::new();
        remote
            .expect_presign_upload()
            .returning(|_| Ok(target()));
        remote.expect_upload_bytes().returning(|_, _, _| Ok(()));
        remote.expect_submit_photo().returning(|_| {
            Err(RemoteError::Status {
                status: 422,
                body: "unknown project".to_owned(),
            })
        });
        let saga = PhotoUploadSaga::new(Arc::new(remote), Arc::new(capture.tracker.clone()));

        let error = saga.execute(&capture.job).await.unwrap_err();

        assert!(error.is_terminal());
    }

    #[tokio::test]
    async fn hash_mismatch_is_terminal_before_any_request() {
        let capture = capture(b"maple", &sha256(CONTENT));
        let mut remote = MockRemoteApi::new();
        remote.expect_presign_upload().never();
        let saga = PhotoUploadSaga::new(Arc::new(remote), Arc::new(capture.tracker.clone()));

        let error = saga.execute(&capture.job).await.unwrap_err();

        assert!(error.is_terminal());
        assert!(error.message.contains("changed since capture"));
    }

    #[tokio::test]
    async fn missing_file_is_terminal() {
        let mut capture = capture(CONTENT, &sha256(CONTENT));
        if let JobPayload::Photo(photo) = &mut capture.job.payload {
            photo.local_path = PathBuf::from("/nonexistent/ph-1.jpg");
        }
        let mut remote = MockRemoteApi::new();
        remote.expect_presign_upload().never();
        let saga = PhotoUploadSaga::new(Arc::new(remote), Arc::new(capture.tracker.clone()));

        let error = saga.execute(&capture.job).await.unwrap_err();

        assert!(error.is_terminal());
    }

    #[tokio::test]
    async fn wrong_payload_is_terminal() {
        let job = SyncJob::new(fixtures::project_job(Priority::Normal), Utc::now());
        let saga = PhotoUploadSaga::new(
            Arc::new(MockRemoteApi::new()),
            Arc::new(InMemoryEntityStateTracker::new()),
        );

        let error = saga.execute(&job).await.unwrap_err();

        assert!(error.is_terminal());
    }
}
