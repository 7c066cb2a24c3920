use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::{info, warn};
use uuid::Uuid;

use db::models::WorkflowRow;
use db::DbError;
use engine::{validate_workflow, Workflow};

use super::{load_workflow, workflow_from_row};
use crate::{ApiError, ApiResult, AppState};

pub async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<Workflow>>> {
    let rows = state.store().list_workflows().await?;
    let workflows = rows.into_iter().map(workflow_from_row).collect::<ApiResult<Vec<_>>>()?;
    Ok(Json(workflows))
}

pub async fn get(Path(id): Path<Uuid>, State(state): State<AppState>) -> ApiResult<Json<Workflow>> {
    Ok(Json(load_workflow(&**state.store(), id).await?))
}

pub async fn create(
    State(state): State<AppState>,
    Json(workflow): Json<Workflow>,
) -> ApiResult<(StatusCode, Json<Workflow>)> {
    let saved = persist(&state, workflow, false).await?;
    Ok((StatusCode::CREATED, Json(saved)))
}

pub async fn save(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(mut workflow): Json<Workflow>,
) -> ApiResult<Json<Workflow>> {
    let existing = match load_workflow(&**state.store(), id).await {
        Ok(existing) => existing,
        Err(ApiError::Db(DbError::NotFound)) => return Err(ApiError::NotFound(format!("workflow {id} not found"))),
        Err(e) => return Err(e),
    };
    workflow.id = id;
    workflow.created_at = existing.created_at;
    Ok(Json(persist(&state, workflow, existing.previously_saved).await?))
}

pub async fn delete(Path(id): Path<Uuid>, State(state): State<AppState>) -> ApiResult<StatusCode> {
    state.store().delete_workflow(id).await?;
    info!(workflow_id = %id, "Workflow deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Validate and store a definition.
///
/// Broken branches are only recorded on the first save; once a workflow
/// has been saved they are rejected.
async fn persist(state: &AppState, mut workflow: Workflow, previously_saved: bool) -> ApiResult<Workflow> {
    if workflow.name.trim().is_empty() {
        return Err(ApiError::BadRequest("workflow name is required".into()));
    }

    let problems = validate_workflow(&workflow);
    if !problems.is_empty() {
        if previously_saved {
            return Err(ApiError::BadRequest(problems.join("; ")));
        }
        warn!(workflow_id = %workflow.id, problems = problems.len(), "Saving workflow with broken branches");
    }
    workflow.errors = problems;
    workflow.previously_saved = true;

    let row = WorkflowRow {
        id: workflow.id,
        org_id: workflow.org_id.clone(),
        name: workflow.name.clone(),
        definition: serde_json::to_value(&workflow).map_err(engine::EngineError::from)?,
        created_at: workflow.created_at,
    };
    state.store().save_workflow(row).await?;
    info!(workflow_id = %workflow.id, "Workflow saved");
    Ok(workflow)
}
