pub mod executions;
pub mod streams;
pub mod webhooks;
pub mod workers;
pub mod workflows;

use uuid::Uuid;

use db::models::WorkflowRow;
use db::Store;
use engine::Workflow;

use crate::ApiResult;

/// Stored definition with the row's identity stamped back on.
pub(crate) fn workflow_from_row(row: WorkflowRow) -> ApiResult<Workflow> {
    let mut workflow: Workflow = serde_json::from_value(row.definition).map_err(engine::EngineError::from)?;
    workflow.id = row.id;
    if workflow.org_id.is_empty() {
        workflow.org_id = row.org_id;
    }
    Ok(workflow)
}

pub(crate) async fn load_workflow(store: &dyn Store, id: Uuid) -> ApiResult<Workflow> {
    workflow_from_row(store.get_workflow(id).await?)
}
