//! Job hand-out for workers polling the queue.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::debug;
use uuid::Uuid;

use crate::{ApiResult, AppState};

/// Claim the next pending job; `204` when the queue is empty.
pub async fn next_job(State(state): State<AppState>) -> ApiResult<Response> {
    match state.store().fetch_next_job().await? {
        Some(job) => {
            debug!(job_id = %job.id, execution_id = %job.execution_id, "Handing out job");
            Ok(Json(job).into_response())
        }
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

pub async fn complete_job(Path(id): Path<Uuid>, State(state): State<AppState>) -> ApiResult<StatusCode> {
    state.store().complete_job(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
