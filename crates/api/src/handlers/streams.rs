//! Endpoints workers and child executions report back to.

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use engine::{ActionResult, WorkflowExecution};

use crate::{ApiResult, AppState};

/// What a worker may post: a single result, or the whole execution as it
/// saw it.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum StreamBody {
    Result(ActionResult),
    Execution(WorkflowExecution),
}

/// `POST /api/v1/streams`: apply one action result, or every result of an
/// execution snapshot in order.
pub async fn ingest(State(state): State<AppState>, Json(body): Json<StreamBody>) -> ApiResult<Json<Value>> {
    let status = match body {
        StreamBody::Result(result) => state.executor.ingest(result).await?.execution.map(|e| e.status),
        StreamBody::Execution(snapshot) => {
            // An empty snapshot still needs a valid token.
            let current = state
                .executor
                .get_execution(snapshot.execution_id, &snapshot.authorization)
                .await?;
            let mut status = Some(current.status);
            for mut result in snapshot.results {
                result.execution_id = snapshot.execution_id;
                result.authorization = snapshot.authorization.clone();
                if let Some(execution) = state.executor.ingest(result).await?.execution {
                    status = Some(execution.status);
                }
            }
            status
        }
    };
    Ok(Json(json!({ "success": true, "status": status })))
}

#[derive(Debug, Deserialize)]
pub struct ResultsRequest {
    pub execution_id: Uuid,
    pub authorization: String,
}

/// `POST /api/v1/streams/results`: poll an execution.
pub async fn results(
    State(state): State<AppState>,
    Json(request): Json<ResultsRequest>,
) -> ApiResult<Json<WorkflowExecution>> {
    let execution = state.executor.get_execution(request.execution_id, &request.authorization).await?;
    Ok(Json(execution))
}
