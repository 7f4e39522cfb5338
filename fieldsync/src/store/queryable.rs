use crate::job::{query::Query, SyncJob};

pub(super) trait Queryable {
    fn matches(&self, job: &SyncJob) -> bool;
}

impl<'a> Queryable for Query<'a> {
    fn matches(&self, job: &SyncJob) -> bool {
        match self {
            Query::All => true,
            Query::Not(inner) => !inner.matches(job),
            Query::And(inner) => inner.iter().all(|query| query.matches(job)),
            Query::Or(inner) => inner.iter().any(|query| query.matches(job)),
            Query::IdEquals(id) => job.id == *id,
            Query::IdIn(ids) => ids.contains(&job.id),
            Query::KindEqual(kind) => job.kind == *kind,
            Query::StatusEqual(status) => job.status == *status,
            Query::PriorityEqual(priority) => job.priority == *priority,
            Query::EntityEqual(entity_id) => job.entity_id == *entity_id,
            Query::CreatedBefore(created_at) => job.created_at < *created_at,
            Query::CompletedBefore(completed_at) => job
                .completed_at
                .is_some_and(|completed| completed < *completed_at),
            Query::Exhausted => job.is_exhausted() || job.is_discarded(),
        }
    }
}
