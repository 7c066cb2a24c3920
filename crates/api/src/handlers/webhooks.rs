use axum::{
    extract::{Path, State},
    Json,
};
use tracing::{info, warn};

use engine::models::TriggerType;
use engine::ExecutionRequest;

use super::executions::ExecuteResponse;
use super::workflow_from_row;
use crate::{ApiError, ApiResult, AppState};

/// Run the workflow owning webhook trigger `trigger_id`, with the request
/// body as its argument.
pub async fn handle_webhook(
    Path(trigger_id): Path<String>,
    State(state): State<AppState>,
    body: String,
) -> ApiResult<Json<ExecuteResponse>> {
    let rows = state.store().list_workflows().await?;

    let mut matched = None;
    for row in rows {
        let id = row.id;
        match workflow_from_row(row) {
            Ok(workflow)
                if workflow
                    .triggers
                    .iter()
                    .any(|t| t.id == trigger_id && t.trigger_type == TriggerType::Webhook) =>
            {
                matched = Some(workflow);
                break;
            }
            Ok(_) => {}
            Err(e) => warn!(workflow_id = %id, error = %e, "Skipping unreadable workflow"),
        }
    }
    let workflow = matched.ok_or_else(|| ApiError::NotFound(format!("no webhook '{trigger_id}'")))?;

    info!(workflow_id = %workflow.id, %trigger_id, "Webhook fired");
    let request = ExecutionRequest {
        execution_argument: body,
        execution_source: "webhook".into(),
        ..Default::default()
    };
    let outcome = state.executor.execute(workflow, request).await?;
    Ok(Json(outcome.into()))
}
