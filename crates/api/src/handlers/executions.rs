use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use engine::{ExecutionOutcome, ExecutionRequest, ExecutionStatus};

use super::load_workflow;
use crate::{ApiResult, AppState};

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecutionStatus>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub environments: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<ExecutionOutcome> for ExecuteResponse {
    fn from(outcome: ExecutionOutcome) -> Self {
        match outcome {
            ExecutionOutcome::Started { execution, info } => Self {
                success: true,
                execution_id: Some(execution.execution_id),
                authorization: Some(execution.authorization),
                status: Some(execution.status),
                environments: info.environments,
                reason: None,
            },
            ExecutionOutcome::Resumed { execution } => Self {
                success: true,
                execution_id: Some(execution.execution_id),
                authorization: Some(execution.authorization),
                status: Some(execution.status),
                environments: Vec::new(),
                reason: None,
            },
            ExecutionOutcome::AlreadyExecuted => Self {
                success: true,
                execution_id: None,
                authorization: None,
                status: None,
                environments: Vec::new(),
                reason: Some("already executed".into()),
            },
        }
    }
}

/// Start a workflow or answer a parked one.
///
/// Trigger context comes from the query string; a non-empty request body
/// becomes the execution argument.
pub async fn execute(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Query(mut request): Query<ExecutionRequest>,
    body: String,
) -> ApiResult<Json<ExecuteResponse>> {
    let workflow = load_workflow(&**state.store(), id).await?;
    if !body.trim().is_empty() {
        request.execution_argument = body;
    }
    if request.execution_source.is_empty() {
        request.execution_source = "default".into();
    }

    let outcome = state.executor.execute(workflow, request).await?;
    Ok(Json(outcome.into()))
}
