//! Job queue repository functions.
//!
//! Each row of `job_queue` carries one dispatched action. Claims go through
//! `FOR UPDATE SKIP LOCKED` so any number of workers can poll concurrently.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{DbError, models::JobRow};

const JOB_COLUMNS: &str =
    "id, execution_id, workflow_id, status, attempts, max_attempts, priority, payload, created_at, updated_at";

/// Enqueue one action for `execution_id`.
pub async fn enqueue_job(
    pool: &PgPool,
    execution_id: Uuid,
    workflow_id: Uuid,
    priority: i32,
    payload: serde_json::Value,
) -> Result<JobRow, DbError> {
    let now = Utc::now();
    let sql = format!(
        "INSERT INTO job_queue ({JOB_COLUMNS}) \
         VALUES ($1, $2, $3, 'pending', 0, 3, $4, $5, $6, $6) \
         RETURNING {JOB_COLUMNS}"
    );

    let row = sqlx::query_as::<_, JobRow>(&sql)
        .bind(Uuid::new_v4())
        .bind(execution_id)
        .bind(workflow_id)
        .bind(priority)
        .bind(payload)
        .bind(now)
        .fetch_one(pool)
        .await?;

    Ok(row)
}

/// Claim the highest-priority, oldest pending job.
///
/// The returned row is already `processing` with its attempt counted.
pub async fn fetch_next_job(pool: &PgPool) -> Result<Option<JobRow>, DbError> {
    let sql = format!(
        "UPDATE job_queue SET status = 'processing', attempts = attempts + 1, updated_at = $1 \
         WHERE id = ( \
             SELECT id FROM job_queue WHERE status = 'pending' \
             ORDER BY priority DESC, created_at ASC \
             LIMIT 1 FOR UPDATE SKIP LOCKED \
         ) \
         RETURNING {JOB_COLUMNS}"
    );

    let row = sqlx::query_as::<_, JobRow>(&sql)
        .bind(Utc::now())
        .fetch_optional(pool)
        .await?;

    Ok(row)
}

/// Mark a claimed job as done. `DbError::NotFound` for an unknown id.
pub async fn complete_job(pool: &PgPool, job_id: Uuid) -> Result<(), DbError> {
    let result = sqlx::query("UPDATE job_queue SET status = 'completed', updated_at = $1 WHERE id = $2")
        .bind(Utc::now())
        .bind(job_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}
