//! The UI-facing sync status mirrored onto domain entities.
//!
//! The producer records an entity as [`SyncState::Pending`] when it captures it; from then on
//! only the engine writes the mirror:
//!
//! | event                                  | state       |
//! |----------------------------------------|-------------|
//! | job starts processing                  | `uploading` |
//! | photo uploaded and submitted           | `uploaded` (with remote url) |
//! | job completed                          | `uploaded`  |
//! | retryable failure                      | `pending`   |
//! | terminal failure (exhausted/discarded) | `failed`    |
use std::{
    collections::HashMap,
    fmt::Display,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::ParseError;

/// Mirrored synchronization status of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    Uploading,
    Uploaded,
    Failed,
}

impl SyncState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Uploaded => "uploaded",
            Self::Failed => "failed",
        }
    }
}

impl Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "uploading" => Ok(Self::Uploading),
            "uploaded" => Ok(Self::Uploaded),
            "failed" => Ok(Self::Failed),
            other => Err(ParseError::new("sync state", other)),
        }
    }
}

/// Addresses a domain record, e.g. `("photo", "0190c7a2-...")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// The sync-related fields of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityState {
    pub local_path: Option<PathBuf>,
    pub sha256: Option<String>,
    pub remote_url: Option<String>,
    pub status: SyncState,
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Invalid tracker configuration: {0}")]
    Configuration(String),
    #[error("Error decoding stored value: {0}")]
    Decode(#[from] ParseError),
    #[error("System in bad state")]
    BadState,
    #[error("Database error: {0}")]
    Database(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[async_trait]
pub trait EntityStateTracker: Send + Sync {
    /// Writes `state` to the entity's mirror. When `remote_url` is `None` any previously
    /// recorded remote url is kept.
    ///
    /// Entities the tracker does not know about are ignored.
    async fn set_state(
        &self,
        entity: &EntityRef,
        state: SyncState,
        remote_url: Option<&str>,
    ) -> Result<(), TrackerError>;

    async fn state(&self, entity: &EntityRef) -> Result<Option<EntityState>, TrackerError>;
}

/// An in memory [`EntityStateTracker`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryEntityStateTracker {
    entities: Arc<RwLock<HashMap<EntityRef, EntityState>>>,
}

impl InMemoryEntityStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a freshly captured entity as `pending`, the way a producer does at capture time.
    pub fn register(
        &self,
        entity: EntityRef,
        local_path: Option<&Path>,
        sha256: Option<&str>,
    ) -> Result<(), TrackerError> {
        self.entities
            .write()
            .map_err(|_| TrackerError::BadState)?
            .insert(
                entity,
                EntityState {
                    local_path: local_path.map(Path::to_path_buf),
                    sha256: sha256.map(str::to_owned),
                    remote_url: None,
                    status: SyncState::Pending,
                },
            );
        Ok(())
    }
}

#[async_trait]
impl EntityStateTracker for InMemoryEntityStateTracker {
    async fn set_state(
        &self,
        entity: &EntityRef,
        state: SyncState,
        remote_url: Option<&str>,
    ) -> Result<(), TrackerError> {
        let mut entities = self.entities.write().map_err(|_| TrackerError::BadState)?;
        match entities.get_mut(entity) {
            Some(current) => {
                current.status = state;
                if let Some(remote_url) = remote_url {
                    current.remote_url = Some(remote_url.to_owned());
                }
            }
            None => tracing::debug!(%entity, "Ignoring state change of untracked entity"),
        }
        Ok(())
    }

    async fn state(&self, entity: &EntityRef) -> Result<Option<EntityState>, TrackerError> {
        Ok(self
            .entities
            .read()
            .map_err(|_| TrackerError::BadState)?
            .get(entity)
            .cloned())
    }
}
