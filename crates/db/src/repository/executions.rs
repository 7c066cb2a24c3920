//! Execution document repository functions.
//!
//! Executions are read-modify-written wholesale. Writes are guarded by the
//! `version` column: an `UPDATE … WHERE version = $expected` that touches no
//! row means a concurrent writer won.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{DbError, models::ExecutionRow};

/// Fetch an execution document by id.
pub async fn get_execution(pool: &PgPool, id: Uuid) -> Result<ExecutionRow, DbError> {
    sqlx::query_as::<_, ExecutionRow>(
        r#"
        SELECT id, workflow_id, org_id, status, version, body, updated_at
        FROM workflow_executions
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)
}

/// Insert (expected version 0) or conditionally update an execution.
pub async fn set_execution(
    pool: &PgPool,
    row: &ExecutionRow,
    expected_version: i64,
) -> Result<i64, DbError> {
    let now = Utc::now();
    let next = expected_version + 1;

    let affected = if expected_version == 0 {
        sqlx::query(
            r#"
            INSERT INTO workflow_executions (id, workflow_id, org_id, status, version, body, updated_at)
            VALUES ($1, $2, $3, $4, 1, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(row.id)
        .bind(row.workflow_id)
        .bind(&row.org_id)
        .bind(&row.status)
        .bind(&row.body)
        .bind(now)
        .execute(pool)
        .await?
        .rows_affected()
    } else {
        sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = $1, body = $2, version = $3, updated_at = $4
            WHERE id = $5 AND version = $6
            "#,
        )
        .bind(&row.status)
        .bind(&row.body)
        .bind(next)
        .bind(now)
        .bind(row.id)
        .bind(expected_version)
        .execute(pool)
        .await?
        .rows_affected()
    };

    if affected == 0 {
        let found = current_version(pool, row.id).await?;
        return Err(DbError::VersionConflict {
            id: row.id,
            expected: expected_version,
            found,
        });
    }

    Ok(next)
}

async fn current_version(pool: &PgPool, id: Uuid) -> Result<i64, DbError> {
    let version: Option<i64> =
        sqlx::query_scalar("SELECT version FROM workflow_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
    Ok(version.unwrap_or(0))
}
