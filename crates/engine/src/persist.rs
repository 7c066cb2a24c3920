//! Loading and saving execution documents.
//!
//! Every save blanks credential values, runs the compression guard and is
//! conditional on the version the snapshot was read at.

use chrono::Utc;
use uuid::Uuid;

use db::models::ExecutionRow;
use db::{DbError, Store};

use crate::compression::CompressionGuard;
use crate::models::WorkflowExecution;
use crate::EngineError;

pub async fn load_execution(store: &dyn Store, id: Uuid) -> Result<WorkflowExecution, EngineError> {
    let row = store.get_execution(id).await.map_err(|e| match e {
        DbError::NotFound => EngineError::ExecutionNotFound(id),
        other => other.into(),
    })?;

    let mut execution: WorkflowExecution = serde_json::from_value(row.body)?;
    execution.version = row.version;
    Ok(execution)
}

/// Load and check the caller's authorization token.
pub async fn load_authorized(
    store: &dyn Store,
    id: Uuid,
    authorization: &str,
) -> Result<WorkflowExecution, EngineError> {
    let execution = load_execution(store, id).await?;
    if execution.authorization != authorization {
        return Err(EngineError::Unauthorized(id));
    }
    Ok(execution)
}

/// Scrub credentials, compress if needed, then write at `execution.version`.
///
/// On success `execution.version` holds the new version. A
/// `DbError::VersionConflict` is passed through untouched so callers can
/// re-read and retry.
pub async fn save_execution(
    store: &dyn Store,
    guard: &CompressionGuard,
    execution: &mut WorkflowExecution,
) -> Result<(), EngineError> {
    execution.scrub_sensitive();
    guard.compress(store, execution).await?;

    let row = ExecutionRow {
        id: execution.execution_id,
        workflow_id: execution.workflow_id,
        org_id: execution.org_id.clone(),
        status: execution.status.as_str().to_owned(),
        version: execution.version,
        body: serde_json::to_value(&*execution)?,
        updated_at: Utc::now(),
    };

    execution.version = store.set_execution(row, execution.version).await?;
    Ok(())
}

pub fn is_conflict(err: &EngineError) -> bool {
    matches!(err, EngineError::Database(DbError::VersionConflict { .. }))
}
