//! The remote system of record, as seen by the saga handlers.
//!
//! [`RemoteApi`] describes the five calls the engine makes; [`http::HttpRemoteApi`] implements
//! them over HTTP. The remote service is expected to treat repeated presign and photo
//! submissions for the same content hash as upserts, which is what makes a full re-run of the
//! photo saga safe.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{PhotoSnapshot, ProjectSnapshot};

pub mod http;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Request could not reach the server: {0}")]
    Transport(String),
    #[error("Request timed out")]
    Timeout,
    #[error("Server responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Request was rejected as unauthorized and the access token could not be refreshed")]
    Unauthorized,
    #[error("Invalid response body: {0}")]
    Decode(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl RemoteError {
    /// Whether the same request may succeed if sent again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout | Self::Decode(_) => true,
            Self::Status { status, .. } => matches!(status, 408 | 425 | 429 | 500..=599),
            Self::Unauthorized | Self::InvalidRequest(_) => false,
        }
    }
}

/// Body of `POST /files/presigned-upload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignRequest {
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub sha256: String,
}

impl From<&PhotoSnapshot> for PresignRequest {
    fn from(photo: &PhotoSnapshot) -> Self {
        Self {
            file_name: photo.file_name.clone(),
            file_size: photo.file_size,
            mime_type: photo.mime_type.clone(),
            sha256: photo.sha256.clone(),
        }
    }
}

/// A presigned upload target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUpload {
    pub upload_url: String,
    pub file_id: String,
}

impl PresignedUpload {
    /// Where the uploaded file lives once transferred: the upload URL without its query string.
    pub fn remote_url(&self) -> &str {
        self.upload_url
            .split_once('?')
            .map_or(self.upload_url.as_str(), |(url, _)| url)
    }
}

/// Body of `POST /photos`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoRecord {
    pub id: String,
    pub project_id: String,
    pub polygon_id: Option<String>,
    pub remote_url: String,
    pub sha256: String,
    pub file_size: u64,
    pub mime_type: String,
    pub exif_data: serde_json::Value,
    pub measurements: serde_json::Value,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl PhotoRecord {
    pub fn new(photo: &PhotoSnapshot, remote_url: impl Into<String>) -> Self {
        Self {
            id: photo.id.clone(),
            project_id: photo.project_id.clone(),
            polygon_id: photo.polygon_id.clone(),
            remote_url: remote_url.into(),
            sha256: photo.sha256.clone(),
            file_size: photo.file_size,
            mime_type: photo.mime_type.clone(),
            exif_data: photo.exif_data.clone(),
            measurements: photo.measurements.clone(),
            metadata: photo.metadata.clone(),
            created_at: photo.created_at,
        }
    }
}

/// The remote calls made by the saga handlers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// `POST /files/presigned-upload`
    async fn presign_upload(&self, request: &PresignRequest)
        -> Result<PresignedUpload, RemoteError>;

    /// `PUT <uploadUrl>` with the raw file bytes.
    async fn upload_bytes(
        &self,
        target: &PresignedUpload,
        bytes: Vec<u8>,
        mime_type: &str,
    ) -> Result<(), RemoteError>;

    /// `POST /photos`
    async fn submit_photo(&self, record: &PhotoRecord) -> Result<(), RemoteError>;

    /// `POST /projects`
    async fn submit_project(&self, project: &ProjectSnapshot) -> Result<(), RemoteError>;

    /// `PATCH /{entityType}/{entityId}`
    async fn patch_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        changes: &serde_json::Value,
    ) -> Result<(), RemoteError>;
}

/// Supplies bearer tokens to [`http::HttpRemoteApi`].
///
/// Credential storage and the login flow belong to the host.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// The current access token, if the user is signed in.
    async fn access_token(&self) -> Option<String>;

    /// Obtains a fresh access token after the server rejected the current one.
    ///
    /// Returns `None` when the token cannot be refreshed.
    async fn refresh(&self) -> Option<String>;
}

/// A [`TokenProvider`] for servers that need no authentication.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

#[async_trait]
impl TokenProvider for NoAuth {
    async fn access_token(&self) -> Option<String> {
        None
    }

    async fn refresh(&self) -> Option<String> {
        None
    }
}

/// A fixed bearer token that cannot be refreshed.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Option<String> {
        Some(self.0.clone())
    }

    async fn refresh(&self) -> Option<String> {
        None
    }
}
