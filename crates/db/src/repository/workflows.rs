//! Workflow CRUD operations.

use sqlx::PgPool;
use uuid::Uuid;

use crate::{DbError, models::WorkflowRow};

/// Insert or replace a workflow definition.
///
/// `definition` must be a valid JSON object produced by serialising the
/// domain `Workflow` type from the `engine` crate.
pub async fn upsert_workflow(pool: &PgPool, row: &WorkflowRow) -> Result<WorkflowRow, DbError> {
    let saved = sqlx::query_as::<_, WorkflowRow>(
        r#"
        INSERT INTO workflows (id, org_id, name, definition, created_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, definition = EXCLUDED.definition
        RETURNING id, org_id, name, definition, created_at
        "#,
    )
    .bind(row.id)
    .bind(&row.org_id)
    .bind(&row.name)
    .bind(&row.definition)
    .bind(row.created_at)
    .fetch_one(pool)
    .await?;

    Ok(saved)
}

/// Fetch a single workflow by its primary key.
pub async fn get_workflow(pool: &PgPool, id: Uuid) -> Result<WorkflowRow, DbError> {
    sqlx::query_as::<_, WorkflowRow>(
        "SELECT id, org_id, name, definition, created_at FROM workflows WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)
}

/// Return all workflows ordered by creation time (newest first).
pub async fn list_workflows(pool: &PgPool) -> Result<Vec<WorkflowRow>, DbError> {
    let rows = sqlx::query_as::<_, WorkflowRow>(
        "SELECT id, org_id, name, definition, created_at FROM workflows ORDER BY created_at DESC",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Permanently delete a workflow by its primary key.
///
/// Returns `DbError::NotFound` if no row was deleted.
pub async fn delete_workflow(pool: &PgPool, id: Uuid) -> Result<(), DbError> {
    let result = sqlx::query("DELETE FROM workflows WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    Ok(())
}
