//! Hand-off of runnable actions to workers.
//!
//! The engine decides *what* runs; workers run it. The default dispatcher
//! enqueues one job per action for workers to claim.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use db::Store;

use crate::models::{Action, WorkflowExecution};
use crate::EngineError;

#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn dispatch(&self, execution: &WorkflowExecution, actions: &[Action]) -> Result<(), EngineError>;
}

/// Enqueues each action into the store's job queue.
pub struct QueueDispatcher {
    store: Arc<dyn Store>,
}

impl QueueDispatcher {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ActionDispatcher for QueueDispatcher {
    async fn dispatch(&self, execution: &WorkflowExecution, actions: &[Action]) -> Result<(), EngineError> {
        for action in actions {
            let payload = json!({
                "execution_id": execution.execution_id,
                "workflow_id": execution.workflow_id,
                "authorization": execution.authorization,
                "environment": action.environment,
                "action": action,
            });
            let job = self
                .store
                .enqueue_job(execution.execution_id, execution.workflow_id, execution.priority, payload)
                .await?;
            debug!(job_id = %job.id, action_id = %action.id, "Enqueued action");
        }
        Ok(())
    }
}
