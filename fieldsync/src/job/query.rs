//! Composable predicates over [`SyncJob`](super::SyncJob)s.
//!
//! A [`Query`] is used for pruning, for the queue view and for bulk operations. The in-memory
//! store evaluates it directly, the SQLite store translates it into a `WHERE` clause.
//!
//! # Example
//!
//! ```
//! # use fieldsync::prelude::*;
//! # use chrono::{TimeDelta, Utc};
//! // Completed jobs older than a week, and everything that can no longer be retried.
//! let query = Query::status_equal(JobStatus::Completed)
//!     .and(Query::completed_before(Utc::now() - TimeDelta::days(7)))
//!     .or(Query::exhausted());
//! ```
use chrono::{DateTime, TimeDelta, Utc};

use super::{JobId, JobKind, JobStatus, Priority};

#[derive(Debug, Eq, PartialEq, Clone)]
pub enum Query<'a> {
    /// Matches every job.
    All,
    Not(Box<Query<'a>>),
    And(Vec<Query<'a>>),
    Or(Vec<Query<'a>>),
    IdEquals(JobId),
    IdIn(&'a [JobId]),
    KindEqual(JobKind),
    StatusEqual(JobStatus),
    PriorityEqual(Priority),
    EntityEqual(&'a str),
    CreatedBefore(DateTime<Utc>),
    /// Jobs completed strictly before the given instant. Never matches incomplete jobs.
    CompletedBefore(DateTime<Utc>),
    /// Jobs with no automatic retries left: attempts used up, or discarded.
    Exhausted,
}

impl<'a> Query<'a> {
    pub fn and(mut self, other: Query<'a>) -> Self {
        if let Query::And(ref mut constraints) = self {
            constraints.push(other);
        } else {
            self = Query::And(vec![self, other]);
        }
        self
    }

    pub fn or(mut self, other: Query<'a>) -> Self {
        if let Query::Or(ref mut constraints) = self {
            constraints.push(other);
        } else {
            self = Query::Or(vec![self, other]);
        }
        self
    }

    pub fn all() -> Self {
        Self::All
    }

    pub fn id_equals(id: JobId) -> Self {
        Self::IdEquals(id)
    }

    pub fn id_in(ids: &'a [JobId]) -> Self {
        Self::IdIn(ids)
    }

    pub fn kind_equal(kind: JobKind) -> Self {
        Self::KindEqual(kind)
    }

    pub fn status_equal(status: JobStatus) -> Self {
        Self::StatusEqual(status)
    }

    pub fn priority_equal(priority: Priority) -> Self {
        Self::PriorityEqual(priority)
    }

    pub fn entity_equal(entity_id: &'a str) -> Self {
        Self::EntityEqual(entity_id)
    }

    pub fn created_before(created_at: DateTime<Utc>) -> Self {
        Self::CreatedBefore(created_at)
    }

    pub fn completed_before(completed_at: DateTime<Utc>) -> Self {
        Self::CompletedBefore(completed_at)
    }

    pub fn completed_older_than(age: TimeDelta) -> Self {
        Self::CompletedBefore(Utc::now() - age)
    }

    pub fn exhausted() -> Self {
        Self::Exhausted
    }
}

impl<'a> std::ops::Not for Query<'a> {
    type Output = Self;
    fn not(self) -> Self {
        Self::Not(Box::new(self))
    }
}
