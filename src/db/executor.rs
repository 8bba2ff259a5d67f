//! Statement execution.
//!
//! Thin wrappers over `sqlx` that bind [`SqlValue`] parameters, convert result
//! rows into row projections and surface driver errors unchanged.
//!
//! Statements are built dynamically, so they are sent as unnamed (non-cached)
//! prepared statements: the inferred type of an untyped NULL parameter must not
//! leak into later executions of the same SQL text.

use crate::db::types::{RowMap, SqlValue, bind_param, row_to_map};
use crate::error::DbResult;
use futures_util::StreamExt;
use sqlx::{PgPool, Postgres};
use tracing::debug;

/// Execute a statement and return every result row.
pub async fn fetch_rows(pool: &PgPool, sql: &str, params: &[SqlValue]) -> DbResult<Vec<RowMap>> {
    debug!(sql = %sql, params = params.len(), "Executing query");

    let mut query = sqlx::query(sql).persistent(false);
    for param in params {
        query = bind_param(query, param);
    }

    let results = query.fetch(pool).collect::<Vec<_>>().await;
    let mut rows = Vec::with_capacity(results.len());
    for result in results {
        rows.push(row_to_map(&result?)?);
    }
    Ok(rows)
}

/// Execute a statement and return the first result row, if any.
pub async fn fetch_optional(
    pool: &PgPool,
    sql: &str,
    params: &[SqlValue],
) -> DbResult<Option<RowMap>> {
    debug!(sql = %sql, params = params.len(), "Executing query");

    let mut query = sqlx::query(sql).persistent(false);
    for param in params {
        query = bind_param(query, param);
    }

    let row = query.fetch_optional(pool).await?;
    row.as_ref().map(row_to_map).transpose()
}

/// Execute a writing statement with a `RETURNING` clause and convert its row.
///
/// The statement runs in its own transaction, committed only after the
/// returned row was decoded and converted. A failed conversion rolls the
/// write back.
pub async fn write_returning<R, F>(
    pool: &PgPool,
    sql: &str,
    params: &[SqlValue],
    convert: F,
) -> DbResult<Option<R>>
where
    F: FnOnce(RowMap) -> DbResult<R>,
{
    debug!(sql = %sql, params = params.len(), "Executing write operation");

    let mut tx = pool.begin().await?;

    let mut query = sqlx::query(sql).persistent(false);
    for param in params {
        query = bind_param(query, param);
    }
    let row = query.fetch_optional(&mut *tx).await?;

    // Dropping the transaction on error rolls it back
    let result = row
        .as_ref()
        .map(row_to_map)
        .transpose()?
        .map(convert)
        .transpose()?;

    tx.commit().await?;
    Ok(result)
}

/// Execute a `SELECT COUNT(*)` style statement.
pub async fn fetch_count(pool: &PgPool, sql: &str) -> DbResult<i64> {
    debug!(sql = %sql, "Executing count");

    let count = sqlx::query_scalar::<Postgres, i64>(sql)
        .persistent(false)
        .fetch_optional(pool)
        .await?;
    Ok(count.unwrap_or(0))
}

/// Execute a statement and return the number of affected rows.
pub async fn execute(pool: &PgPool, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
    debug!(sql = %sql, params = params.len(), "Executing write operation");

    // Without parameters use the simple query protocol (DDL, multi-statement scripts)
    let result = if params.is_empty() {
        use sqlx::Executor;
        pool.execute(sql).await?
    } else {
        let mut query = sqlx::query(sql).persistent(false);
        for param in params {
            query = bind_param(query, param);
        }
        query.execute(pool).await?
    };

    Ok(result.rows_affected())
}
