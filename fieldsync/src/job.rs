//! The unit of synchronization work and the snapshots it carries.
//!
//! A [`SyncJob`] pairs an immutable [`JobPayload`] (the entity data as it was when the job was
//! submitted) with the bookkeeping the scheduler needs: status, attempt counters, backoff
//! timestamps and the last error.
//!
//! Jobs are created through the [`builder::JobBuilder`] and persisted by a
//! [`crate::store::JobStore`].
use std::{fmt::Display, path::PathBuf, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::tracker::EntityRef;

pub mod builder;
pub mod query;

/// The number of attempts a job gets when none is given at enqueue time.
pub const DEFAULT_MAX_ATTEMPTS: u16 = 3;

/// Opaque identifier of a [`SyncJob`].
///
/// Identifiers are UUIDv7 values, so they sort roughly by creation time.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<JobId> for Uuid {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Returned when a persisted enum value cannot be decoded.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {field} value: {value}")]
pub struct ParseError {
    field: &'static str,
    value: String,
}

impl ParseError {
    pub fn new(field: &'static str, value: impl Into<String>) -> Self {
        Self {
            field,
            value: value.into(),
        }
    }
}

/// The kind of entity a job synchronizes. Derived from the payload variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Photo,
    Project,
    Metadata,
}

impl JobKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Project => "project",
            Self::Metadata => "metadata",
        }
    }
}

impl Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "photo" => Ok(Self::Photo),
            "project" => Ok(Self::Project),
            "metadata" => Ok(Self::Metadata),
            other => Err(ParseError::new("kind", other)),
        }
    }
}

/// Scheduling priority. Variants are declared lowest first so the derived ordering gives
/// `Critical > High > Normal > Low`.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// The persisted numeric rank; higher values are scheduled first.
    pub const fn rank(self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }
}

impl TryFrom<i64> for Priority {
    type Error = ParseError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Low),
            1 => Ok(Self::Normal),
            2 => Ok(Self::High),
            3 => Ok(Self::Critical),
            other => Err(ParseError::new("priority", other.to_string())),
        }
    }
}

/// Lifecycle state of a [`SyncJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether jobs in this state are returned by
    /// [`crate::store::JobStore::list_actionable`].
    pub const fn is_actionable(self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ParseError::new("status", other)),
        }
    }
}

/// Submit-time snapshot of a captured photo.
///
/// The file at `local_path` is never modified after capture, `sha256` is the lowercase hex
/// digest of its content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoSnapshot {
    pub id: String,
    pub project_id: String,
    pub polygon_id: Option<String>,
    pub local_path: PathBuf,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub sha256: String,
    #[serde(default)]
    pub exif_data: serde_json::Value,
    #[serde(default)]
    pub measurements: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Submit-time snapshot of a whole project record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub id: String,
    pub body: serde_json::Value,
}

/// A partial update for an arbitrary remote entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataPatch {
    pub entity_type: String,
    pub entity_id: String,
    pub changes: serde_json::Value,
}

/// The immutable data a job submits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "snapshot", rename_all = "snake_case")]
pub enum JobPayload {
    Photo(PhotoSnapshot),
    Project(ProjectSnapshot),
    Metadata(MetadataPatch),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Photo(_) => JobKind::Photo,
            Self::Project(_) => JobKind::Project,
            Self::Metadata(_) => JobKind::Metadata,
        }
    }

    /// The domain record this payload concerns.
    pub fn entity(&self) -> EntityRef {
        match self {
            Self::Photo(photo) => EntityRef::new("photo", &photo.id),
            Self::Project(project) => EntityRef::new("project", &project.id),
            Self::Metadata(patch) => EntityRef::new(&patch.entity_type, &patch.entity_id),
        }
    }
}

/// A job ready to be handed to [`crate::store::JobStore::enqueue`].
///
/// Usually constructed with [`builder::JobBuilder`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub payload: JobPayload,
    pub priority: Priority,
    pub max_attempts: u16,
}

/// A persisted synchronization job.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncJob {
    pub id: JobId,
    pub kind: JobKind,
    pub entity_id: String,
    pub priority: Priority,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub attempts: u16,
    pub max_attempts: u16,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub discarded_at: Option<DateTime<Utc>>,
}

impl SyncJob {
    /// A freshly enqueued job. Store implementations call this from
    /// [`crate::store::JobStore::enqueue`].
    pub fn new(job: NewJob, created_at: DateTime<Utc>) -> Self {
        let entity_id = job.payload.entity().entity_id;
        Self {
            id: JobId::new(),
            kind: job.payload.kind(),
            entity_id,
            priority: job.priority,
            payload: job.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: job.max_attempts,
            last_attempt_at: None,
            next_attempt_at: None,
            error: None,
            created_at,
            completed_at: None,
            discarded_at: None,
        }
    }

    /// The domain record mirrored by the [`crate::tracker::EntityStateTracker`].
    pub fn entity(&self) -> EntityRef {
        self.payload.entity()
    }

    /// All attempts have been used up.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded_at.is_some()
    }

    /// The job will never be picked up by automatic scheduling again.
    pub fn is_terminal(&self) -> bool {
        self.status == JobStatus::Completed || self.is_exhausted() || self.is_discarded()
    }

    /// The job's backoff, if any, has elapsed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |next| next <= now)
    }

    pub(crate) fn is_final_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}
