use chrono::{DateTime, Utc};
use fieldsync::{
    job::{JobId, ParseError, Priority, SyncJob},
    store::StoreError,
};
use sqlx::prelude::FromRow;
use uuid::Uuid;

/// Column list shared by every statement that returns whole jobs.
pub(crate) const JOB_COLUMNS: &str = "id, kind, entity_id, priority, payload, status, attempts, \
    max_attempts, last_attempt_at, next_attempt_at, error, created_at, completed_at, discarded_at";

#[derive(Debug, FromRow)]
pub(crate) struct JobRow {
    pub id: String,
    pub kind: String,
    pub entity_id: String,
    pub priority: i64,
    pub payload: String,
    pub status: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub last_attempt_at: Option<i64>,
    pub next_attempt_at: Option<i64>,
    pub error: Option<String>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub discarded_at: Option<i64>,
}

impl TryFrom<JobRow> for SyncJob {
    type Error = StoreError;

    fn try_from(value: JobRow) -> Result<Self, Self::Error> {
        let id: JobId = value
            .id
            .parse()
            .map_err(|_| ParseError::new("job id", &value.id))?;
        Ok(Self {
            id,
            kind: value.kind.parse()?,
            entity_id: value.entity_id,
            priority: Priority::try_from(value.priority)?,
            payload: serde_json::from_str(&value.payload)?,
            status: value.status.parse()?,
            attempts: to_u16("attempts", value.attempts)?,
            max_attempts: to_u16("max_attempts", value.max_attempts)?,
            last_attempt_at: value.last_attempt_at.map(from_millis).transpose()?,
            next_attempt_at: value.next_attempt_at.map(from_millis).transpose()?,
            error: value.error,
            created_at: from_millis(value.created_at)?,
            completed_at: value.completed_at.map(from_millis).transpose()?,
            discarded_at: value.discarded_at.map(from_millis).transpose()?,
        })
    }
}

/// Per-status aggregate returned by the counts statement. `SUM` over zero rows is `NULL`.
#[derive(Debug, FromRow)]
pub(crate) struct CountsRow {
    pub pending: Option<i64>,
    pub processing: Option<i64>,
    pub completed: Option<i64>,
    pub failed: Option<i64>,
    pub exhausted: Option<i64>,
}

/// Job ids are stored in their hyphenated textual form.
pub(crate) fn id_text(id: JobId) -> String {
    Uuid::from(id).to_string()
}

/// Timestamps are stored as milliseconds since the unix epoch.
pub(crate) fn millis(timestamp: DateTime<Utc>) -> i64 {
    timestamp.timestamp_millis()
}

fn from_millis(value: i64) -> Result<DateTime<Utc>, ParseError> {
    DateTime::from_timestamp_millis(value)
        .ok_or_else(|| ParseError::new("timestamp", value.to_string()))
}

fn to_u16(field: &'static str, value: i64) -> Result<u16, ParseError> {
    u16::try_from(value).map_err(|_| ParseError::new(field, value.to_string()))
}
