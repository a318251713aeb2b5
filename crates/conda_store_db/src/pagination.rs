//! Cursor based pagination over arbitrary sort keys.
//!
//! A page query is ordered by the requested sort columns plus the primary key
//! as a final tie-breaker. The cursor carries the sort-key values of the last
//! row of the previous page; the next page seeks past them with a single
//! tuple comparison rather than column-wise `AND` chains, so ties on non-id
//! columns are handled correctly.

use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite};

use crate::{DbError, DbPool};

/// Client supplied cursors larger than this are rejected before decoding.
pub const MAX_CURSOR_BYTES: usize = 4096;

/// The opaque token returned with every non-final page.
///
/// Wire format: `base64url(json({"last_id": ..., "last_value": {...},
/// "count": ...}))`. Unknown fields are tolerated on read, missing required
/// fields are not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    /// Primary key of the last row of the previous page.
    pub last_id: i64,
    /// Sort-key values of that row, keyed by sort name.
    pub last_value: BTreeMap<String, serde_json::Value>,
    /// Total number of rows matching the filtered query.
    pub count: i64,
}

impl Cursor {
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("cursor serializes to json");
        URL_SAFE.encode(json)
    }

    pub fn decode(data: &str) -> Result<Self, DbError> {
        if data.len() > MAX_CURSOR_BYTES {
            return Err(DbError::InvalidCursor {
                reason: format!("cursor exceeds {MAX_CURSOR_BYTES} bytes"),
            });
        }
        let bytes = URL_SAFE.decode(data).map_err(|err| DbError::InvalidCursor {
            reason: err.to_string(),
        })?;
        serde_json::from_slice(&bytes).map_err(|err| DbError::InvalidCursor {
            reason: err.to_string(),
        })
    }
}

/// Requested sort direction; applies to all sort keys at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    fn order_sql(self) -> &'static str {
        match self {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        }
    }

    /// The strict comparison used to seek past the cursor row.
    fn seek_sql(self) -> &'static str {
        match self {
            SortDirection::Ascending => ">",
            SortDirection::Descending => "<",
        }
    }
}

impl FromStr for SortDirection {
    type Err = DbError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "asc" => Ok(SortDirection::Ascending),
            "desc" => Ok(SortDirection::Descending),
            other => Err(DbError::InvalidSortDirection {
                value: other.to_string(),
            }),
        }
    }
}

/// Declares one orderable key of a paged listing: the client facing name,
/// the SQL column expression it orders by (possibly across a join), and how
/// to extract the cursor value from a result row.
pub struct SortColumn<T> {
    pub name: &'static str,
    pub expr: &'static str,
    pub value: fn(&T) -> serde_json::Value,
}

/// One page of results plus the total count of the filtered query.
#[derive(Debug)]
pub struct Page<T> {
    pub rows: Vec<T>,
    pub count: i64,
    pub cursor: Option<String>,
}

/// Runs a cursor-paged query.
///
/// `push_from` appends the `FROM ... WHERE ...` clause (including its binds)
/// to a fresh query builder; it is invoked twice, once for the count and once
/// for the page itself, and must always emit a `WHERE` clause so predicates
/// can be appended with `AND`.
pub async fn paginate<T, F>(
    pool: &DbPool,
    select: &str,
    push_from: F,
    id_expr: &str,
    id_value: fn(&T) -> i64,
    columns: &[SortColumn<T>],
    sort_by: &[String],
    direction: SortDirection,
    limit: i64,
    cursor: Option<&str>,
) -> Result<Page<T>, DbError>
where
    T: for<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> + Send + Unpin,
    F: for<'a> Fn(&mut QueryBuilder<'a, Sqlite>),
{
    let resolved = resolve_sort_columns(columns, sort_by)?;
    let cursor = cursor.map(Cursor::decode).transpose()?;

    if let Some(cursor) = &cursor {
        for column in &resolved {
            if !cursor.last_value.contains_key(column.name) {
                return Err(DbError::InvalidCursor {
                    reason: format!("cursor is missing a value for sort key '{}'", column.name),
                });
            }
        }
    }

    // Total count of the filtered query, independent of the seek position.
    let mut count_query = QueryBuilder::new("SELECT COUNT(*) FROM (SELECT ");
    count_query.push(select).push(" ");
    push_from(&mut count_query);
    count_query.push(")");
    let count: i64 = count_query.build_query_scalar().fetch_one(pool).await?;

    let mut query = QueryBuilder::new("SELECT ");
    query.push(select).push(" ");
    push_from(&mut query);

    if let Some(cursor) = &cursor {
        query.push(" AND (");
        for column in &resolved {
            query.push(column.expr).push(", ");
        }
        query.push(id_expr).push(") ").push(direction.seek_sql()).push(" (");
        for column in &resolved {
            push_bind_value(&mut query, &cursor.last_value[column.name]);
            query.push(", ");
        }
        query.push_bind(cursor.last_id);
        query.push(")");
    }

    query.push(" ORDER BY ");
    for column in &resolved {
        query
            .push(column.expr)
            .push(" ")
            .push(direction.order_sql())
            .push(", ");
    }
    query.push(id_expr).push(" ").push(direction.order_sql());
    query.push(" LIMIT ").push_bind(limit);

    let rows: Vec<T> = query.build_query_as().fetch_all(pool).await?;

    let cursor = match rows.last() {
        Some(last) if rows.len() as i64 == limit => Some(
            Cursor {
                last_id: id_value(last),
                last_value: resolved
                    .iter()
                    .map(|column| (column.name.to_string(), (column.value)(last)))
                    .collect(),
                count,
            }
            .encode(),
        ),
        _ => None,
    };

    Ok(Page { rows, count, cursor })
}

/// Validates the requested sort names (comma separated entries permitted)
/// against the declared set, preserving request order.
fn resolve_sort_columns<'c, T>(
    columns: &'c [SortColumn<T>],
    sort_by: &[String],
) -> Result<Vec<&'c SortColumn<T>>, DbError> {
    let mut resolved = Vec::new();
    for requested in sort_by
        .iter()
        .flat_map(|entry| entry.split(','))
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
    {
        let column = columns
            .iter()
            .find(|column| column.name == requested)
            .ok_or_else(|| DbError::InvalidSortBy {
                name: requested.to_string(),
            })?;
        resolved.push(column);
    }
    Ok(resolved)
}

fn push_bind_value<'a>(query: &mut QueryBuilder<'a, Sqlite>, value: &serde_json::Value) {
    match value {
        serde_json::Value::Null => {
            query.push("NULL");
        }
        serde_json::Value::Bool(flag) => {
            query.push_bind(*flag);
        }
        serde_json::Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                query.push_bind(int);
            } else {
                query.push_bind(number.as_f64().unwrap_or(0.0));
            }
        }
        serde_json::Value::String(text) => {
            query.push_bind(text.clone());
        }
        other => {
            query.push_bind(other.to_string());
        }
    }
}
