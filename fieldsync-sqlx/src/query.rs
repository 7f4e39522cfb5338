use fieldsync::job::{query::Query, JobId};
use sqlx::{QueryBuilder, Sqlite};

use crate::types::{id_text, millis, JOB_COLUMNS};

/// Ordering shared by every statement that lists jobs.
pub(crate) const JOB_ORDER: &str = " ORDER BY priority DESC, created_at ASC, rowid ASC";

pub(crate) trait ToQuery {
    fn select(&self) -> QueryBuilder<'static, Sqlite>;
    fn delete(&self) -> QueryBuilder<'static, Sqlite>;
}

impl ToQuery for Query<'_> {
    fn select(&self) -> QueryBuilder<'static, Sqlite> {
        let mut builder = QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE "));
        handle_query(&mut builder, self);
        builder.push(JOB_ORDER);
        builder
    }

    fn delete(&self) -> QueryBuilder<'static, Sqlite> {
        let mut builder = QueryBuilder::new("DELETE FROM sync_jobs WHERE ");
        handle_query(&mut builder, self);
        builder
    }
}

fn handle_query(builder: &mut QueryBuilder<'static, Sqlite>, query: &Query<'_>) {
    match query {
        Query::All => {
            builder.push("1 = 1");
        }
        Query::Not(inner) => {
            builder.push("NOT (");
            handle_query(builder, inner);
            builder.push(")");
        }
        Query::And(queries) => join(builder, queries, " AND ", "1 = 1"),
        Query::Or(queries) => join(builder, queries, " OR ", "1 = 0"),
        Query::IdEquals(id) => {
            builder.push("id = ");
            builder.push_bind(id_text(*id));
        }
        Query::IdIn(ids) => push_id_list(builder, ids),
        Query::KindEqual(kind) => {
            builder.push("kind = ");
            builder.push_bind(kind.as_str());
        }
        Query::StatusEqual(status) => {
            builder.push("status = ");
            builder.push_bind(status.as_str());
        }
        Query::PriorityEqual(priority) => {
            builder.push("priority = ");
            builder.push_bind(priority.rank());
        }
        Query::EntityEqual(entity_id) => {
            builder.push("entity_id = ");
            builder.push_bind(entity_id.to_string());
        }
        Query::CreatedBefore(created_at) => {
            builder.push("created_at < ");
            builder.push_bind(millis(*created_at));
        }
        Query::CompletedBefore(completed_at) => {
            builder.push("completed_at < ");
            builder.push_bind(millis(*completed_at));
        }
        Query::Exhausted => {
            builder.push("(attempts >= max_attempts OR discarded_at IS NOT NULL)");
        }
    }
}

fn join(
    builder: &mut QueryBuilder<'static, Sqlite>,
    queries: &[Query<'_>],
    separator: &str,
    empty: &str,
) {
    match queries.split_last() {
        None => {
            builder.push(empty);
        }
        Some((last, elements)) => {
            builder.push("(");
            elements.iter().for_each(|query| {
                handle_query(builder, query);
                builder.push(separator);
            });
            handle_query(builder, last);
            builder.push(")");
        }
    }
}

/// Pushes `id IN (?, ..)`, or a predicate that never matches for an empty list.
pub(crate) fn push_id_list(builder: &mut QueryBuilder<'static, Sqlite>, ids: &[JobId]) {
    if ids.is_empty() {
        builder.push("1 = 0");
        return;
    }
    builder.push("id IN (");
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(id_text(*id));
    }
    separated.push_unseparated(")");
}
