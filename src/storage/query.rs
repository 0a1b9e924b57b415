//! Query building helpers shared by the repositories.
//!
//! Filter helpers assume the statement already has a `WHERE` clause and prefix
//! every condition with ` AND `.

use crate::errors::{ForgeError, Result};
use crate::storage::util::{escape_like, string_to_ts_query};
use sqlx::{Encode, PgConnection, Postgres, QueryBuilder, Type};
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::hash::Hash;
use tracing::Span;
use uuid::Uuid;

/// Largest number of rows a single batch operation accepts
pub const MAX_BATCH_ITEMS: usize = 100;

/// Number of batch item ids recorded on a span
pub const MAX_BATCH_ITEMS_TO_TRACE: usize = 20;

/// Reject batches over [`MAX_BATCH_ITEMS`]. Runs before any statement is issued.
pub fn check_batch_size(size: usize) -> Result<()> {
    if size > MAX_BATCH_ITEMS {
        return Err(ForgeError::BatchTooLarge { size, max: MAX_BATCH_ITEMS });
    }
    Ok(())
}

/// Reject batches that name the same id more than once. Runs before any statement
/// is issued.
pub fn check_unique_ids<K: Eq + Hash + Display>(ids: &[K]) -> Result<()> {
    let mut seen = HashSet::with_capacity(ids.len());
    match ids.iter().find(|id| !seen.insert(*id)) {
        Some(id) => Err(ForgeError::validation_field(
            format!("id {} appears more than once in the batch", id),
            "id",
        )),
        None => Ok(()),
    }
}

/// Fail with `NotFound` unless `table` holds a row with `id` that is not soft deleted
pub async fn ensure_live_row(
    conn: &mut PgConnection,
    table: &'static str,
    resource_type: &'static str,
    id: Uuid,
) -> Result<()> {
    let query = format!("SELECT EXISTS (SELECT 1 FROM {} WHERE id = $1 AND deleted IS NULL)", table);
    let exists: bool = sqlx::query_scalar(&query)
        .bind(id)
        .fetch_one(conn)
        .await
        .map_err(|e| ForgeError::database(e, format!("Failed to look up {} {}", resource_type, id)))?;

    if !exists {
        return Err(ForgeError::not_found(resource_type, id));
    }
    Ok(())
}

/// Record the batch size and the first [`MAX_BATCH_ITEMS_TO_TRACE`] ids on `span`.
///
/// The span must declare `batch_size`, `ids` and `items_truncated` fields.
pub fn record_batch_ids<I: Display>(span: &Span, ids: &[I]) {
    let traced = ids
        .iter()
        .take(MAX_BATCH_ITEMS_TO_TRACE)
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");

    span.record("batch_size", ids.len());
    span.record("ids", traced.as_str());
    span.record("items_truncated", ids.len() > MAX_BATCH_ITEMS_TO_TRACE);
}

/// Reorder rows fetched with `id = ANY(..)` to match `ids`.
///
/// Every id must be matched by exactly one row.
pub fn order_by_input<K, T, F>(ids: &[K], rows: Vec<T>, key: F) -> Result<Vec<T>>
where
    K: Eq + Hash + Display,
    F: Fn(&T) -> &K,
{
    if rows.len() != ids.len() {
        return Err(ForgeError::internal(format!(
            "expected {} rows, database returned {}",
            ids.len(),
            rows.len()
        )));
    }

    let positions: HashMap<&K, usize> = ids.iter().enumerate().map(|(i, id)| (id, i)).collect();
    let mut slots: Vec<Option<T>> = std::iter::repeat_with(|| None).take(ids.len()).collect();

    for row in rows {
        let position = positions.get(key(&row)).copied().ok_or_else(|| {
            ForgeError::internal(format!("database returned unexpected row {}", key(&row)))
        })?;
        slots[position] = Some(row);
    }

    slots
        .into_iter()
        .zip(ids)
        .map(|(slot, id)| {
            slot.ok_or_else(|| ForgeError::internal(format!("row {} missing from result", id)))
        })
        .collect()
}

/// Per-status counts keyed by status name, with every status in `all` present and a
/// `total` entry summing them.
pub fn status_counts<T>(all: &[T], rows: Vec<(String, i64)>) -> HashMap<String, i64>
where
    T: Copy + Into<&'static str>,
{
    let mut counts: HashMap<String, i64> =
        all.iter().map(|status| ((*status).into().to_string(), 0)).collect();
    let mut total = 0;
    for (status, count) in rows {
        total += count;
        *counts.entry(status).or_insert(0) += count;
    }
    counts.insert("total".to_string(), total);
    counts
}

/// `AND column = $n`
pub fn push_eq<'a, T>(qb: &mut QueryBuilder<'a, Postgres>, column: &str, value: T)
where
    T: 'a + Encode<'a, Postgres> + Type<Postgres>,
{
    qb.push(" AND ").push(column).push(" = ").push_bind(value);
}

/// `AND column IN ids`. An empty list matches nothing.
pub fn push_in_uuids(qb: &mut QueryBuilder<'_, Postgres>, column: &str, ids: &[Uuid]) {
    match ids {
        [] => {
            qb.push(" AND FALSE");
        }
        [id] => {
            qb.push(" AND ").push(column).push(" = ").push_bind(*id);
        }
        _ => {
            qb.push(" AND ").push(column).push(" = ANY(").push_bind(ids.to_vec()).push(")");
        }
    }
}

/// `AND column IN values`. An empty list matches nothing.
pub fn push_in_strings<S: AsRef<str>>(
    qb: &mut QueryBuilder<'_, Postgres>,
    column: &str,
    values: &[S],
) {
    match values {
        [] => {
            qb.push(" AND FALSE");
        }
        [value] => {
            qb.push(" AND ").push(column).push(" = ").push_bind(value.as_ref().to_string());
        }
        _ => {
            let values: Vec<String> = values.iter().map(|v| v.as_ref().to_string()).collect();
            qb.push(" AND ").push(column).push(" = ANY(").push_bind(values).push(")");
        }
    }
}

/// Optional uuid list filter
pub fn push_opt_uuids(qb: &mut QueryBuilder<'_, Postgres>, column: &str, ids: &Option<Vec<Uuid>>) {
    if let Some(ids) = ids {
        push_in_uuids(qb, column, ids);
    }
}

/// Optional string list filter
pub fn push_opt_strings<S: AsRef<str>>(
    qb: &mut QueryBuilder<'_, Postgres>,
    column: &str,
    values: &Option<Vec<S>>,
) {
    if let Some(values) = values {
        push_in_strings(qb, column, values);
    }
}

/// Optional integer list filter. An empty list matches nothing.
pub fn push_opt_i32s(qb: &mut QueryBuilder<'_, Postgres>, column: &str, values: &Option<Vec<i32>>) {
    match values.as_deref() {
        None => {}
        Some([]) => {
            qb.push(" AND FALSE");
        }
        Some(values) => {
            qb.push(" AND ").push(column).push(" = ANY(").push_bind(values.to_vec()).push(")");
        }
    }
}

/// Free text search.
///
/// Matches rows whose `ts_columns` full text vector matches the normalized
/// prefix query, or where any of `ilike_columns` contains the literal input.
/// Blank input adds nothing.
pub fn push_search(
    qb: &mut QueryBuilder<'_, Postgres>,
    search: Option<&str>,
    ts_columns: &[&str],
    ilike_columns: &[&str],
) {
    let Some(search) = search.map(str::trim).filter(|s| !s.is_empty()) else {
        return;
    };

    let ts_query = string_to_ts_query(search);
    let pattern = format!("%{}%", escape_like(search));

    qb.push(" AND (");
    let mut first = true;

    if !ts_query.is_empty() && !ts_columns.is_empty() {
        qb.push("to_tsvector('english', ");
        for (i, column) in ts_columns.iter().enumerate() {
            if i > 0 {
                qb.push(" || ' ' || ");
            }
            qb.push("coalesce(").push(*column).push(", '')");
        }
        qb.push(") @@ to_tsquery('english', ").push_bind(ts_query).push(")");
        first = false;
    }

    for column in ilike_columns {
        if !first {
            qb.push(" OR ");
        }
        qb.push(*column).push(" ILIKE ").push_bind(pattern.clone());
        first = false;
    }

    if first {
        qb.push("TRUE");
    }
    qb.push(")");
}
