//! Org notifications raised by the engine.
//!
//! Delivery is best-effort and never blocks result processing: every
//! notification is handed to a spawned task.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub org_id: String,
    pub title: String,
    pub description: String,
    pub workflow_id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Writes notifications to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, n: Notification) {
        warn!(
            org_id = %n.org_id,
            workflow_id = %n.workflow_id,
            execution_id = %n.execution_id,
            node_id = %n.node_id,
            "{}: {}",
            n.title,
            n.description
        );
    }
}

/// Fire-and-forget.
pub(crate) fn emit(notifier: &Arc<dyn Notifier>, notification: Notification) {
    let notifier = Arc::clone(notifier);
    tokio::spawn(async move {
        notifier.notify(notification).await;
    });
}
