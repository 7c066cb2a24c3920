//! Moves a finished child execution's result into its parent.
//!
//! A non-looping subflow node simply receives the child's result. A looping
//! node (one child per list element) holds a slot list in its result body
//! and only succeeds once every slot is filled. Because a child can finish
//! before the parent has even recorded its slot list, each child also drops
//! its result into a short-lived mailbox the parent checks when the slot
//! list arrives.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use db::Store;

use crate::config::subflow_mailbox_key;
use crate::models::{ActionResult, ActionStatus, ExecutionStatus, ResultBody, WorkflowExecution};
use crate::persist;
use crate::{EngineConfig, EngineError};

/// One child's entry in a looping subflow result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubflowSlot {
    #[serde(default)]
    pub success: bool,
    /// Child workflow id.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub execution_id: String,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub result_set: bool,
}

/// Parse a result body as a slot list. `None` if it isn't a JSON array.
pub fn parse_slots(body: &ResultBody) -> Option<Vec<SubflowSlot>> {
    match body.parse()? {
        Value::Array(items) => Some(
            items
                .into_iter()
                .map(|item| serde_json::from_value(item).unwrap_or_default())
                .collect(),
        ),
        _ => None,
    }
}

pub fn slots_body(slots: &[SubflowSlot]) -> ResultBody {
    ResultBody::Structured(json!(slots))
}

pub struct SubflowCoordinator {
    store: Arc<dyn Store>,
    config: Arc<EngineConfig>,
}

impl SubflowCoordinator {
    pub fn new(store: Arc<dyn Store>, config: Arc<EngineConfig>) -> Self {
        Self { store, config }
    }

    /// Fill the mailbox of a looping slot list from the cache.
    ///
    /// Returns `true` once every slot has a result.
    pub async fn fill_from_mailbox(&self, node_id: &str, slots: &mut [SubflowSlot]) -> Result<bool, EngineError> {
        for slot in slots.iter_mut().filter(|s| !s.result_set && !s.execution_id.is_empty()) {
            let key = subflow_mailbox_key(&slot.execution_id, node_id);
            if let Some(result) = self.store.get_cache(&key).await? {
                debug!(child = %slot.execution_id, node_id, "Filled subflow slot from mailbox");
                slot.result = result;
                slot.result_set = true;
                slot.success = true;
            }
        }
        Ok(slots.iter().all(|s| s.result_set))
    }

    /// Build the result the parent should receive for `child`'s source node.
    ///
    /// Returns `None` when there is nothing to deliver: no parent, parent
    /// gone or already finished, or a looping slot list that doesn't exist
    /// yet (the mailbox covers that case).
    #[instrument(skip_all, fields(child = %child.execution_id))]
    pub async fn parent_result(&self, child: &WorkflowExecution) -> Result<Option<ActionResult>, EngineError> {
        let Some(parent_id) = child.execution_parent else {
            return Ok(None);
        };

        let parent = match persist::load_execution(&*self.store, parent_id).await {
            Ok(parent) => parent,
            Err(EngineError::ExecutionNotFound(_)) => {
                warn!(parent = %parent_id, "Parent execution not found; dropping subflow result");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if parent.authorization != child.execution_source_auth {
            warn!(parent = %parent_id, "Child carries the wrong parent authorization");
            return Ok(None);
        }
        if parent.is_finished() {
            debug!(parent = %parent_id, status = %parent.status, "Parent already finished");
            return Ok(None);
        }

        let node_id = child.execution_source_node.as_str();
        let existing = parent.result_for(node_id);
        let Some(action) = existing
            .map(|r| r.action.clone())
            .or_else(|| parent.workflow.node_action(node_id))
        else {
            warn!(parent = %parent_id, node_id, "Source node is missing from the parent workflow");
            return Ok(None);
        };

        let looping = parent.workflow.trigger(node_id).is_some_and(|t| t.is_looping())
            || existing.is_some_and(|r| parse_slots(&r.result).is_some());

        let finished = child.status == ExecutionStatus::Finished;

        if !looping {
            let body = json!({
                "success": finished,
                "id": child.workflow_id,
                "execution_id": child.execution_id,
                "result": child.result,
            });
            let status = if finished { ActionStatus::Success } else { ActionStatus::Failure };
            info!(parent = %parent_id, node_id, %status, "Propagating subflow result");
            return Ok(Some(ActionResult::new(&parent, action, status, body)));
        }

        // Looping: leave the result in the mailbox first so it survives the
        // slot list arriving after us.
        let child_id = child.execution_id.to_string();
        self.store
            .set_cache(&subflow_mailbox_key(&child_id, node_id), child.result.clone(), self.config.result_cache_ttl)
            .await?;

        let Some(mut slots) = existing.and_then(|r| parse_slots(&r.result)) else {
            debug!(parent = %parent_id, node_id, "No slot list yet; result left in mailbox");
            return Ok(None);
        };
        let Some(slot) = slots.iter_mut().find(|s| s.execution_id == child_id) else {
            warn!(parent = %parent_id, node_id, "Child has no slot in the parent's list");
            return Ok(None);
        };
        slot.result = child.result.clone();
        slot.result_set = true;
        slot.success = finished;

        let all_set = self.fill_from_mailbox(node_id, &mut slots).await?;
        let status = if all_set { ActionStatus::Success } else { ActionStatus::Waiting };
        let filled = slots.iter().filter(|s| s.result_set).count();
        info!(parent = %parent_id, node_id, filled, total = slots.len(), "Filled looping subflow slot");

        Ok(Some(ActionResult::new(&parent, action, status, slots_body(&slots))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_list_parses_leniently() {
        let body = ResultBody::from(r#"[{"success":true,"execution_id":"c1"},{"execution_id":"c2","result":"x","result_set":true}]"#);
        let slots = parse_slots(&body).unwrap();
        assert_eq!(slots.len(), 2);
        assert!(!slots[0].result_set);
        assert_eq!(slots[1].result, "x");

        assert!(parse_slots(&ResultBody::from(r#"{"success":true}"#)).is_none());
    }

    #[tokio::test]
    async fn mailbox_fills_unset_slots() {
        let store = Arc::new(db::MemoryStore::new());
        let coordinator = SubflowCoordinator::new(store.clone(), Arc::new(EngineConfig::default()));
        store
            .set_cache(&subflow_mailbox_key("c1", "node"), "done".into(), std::time::Duration::from_secs(60))
            .await
            .unwrap();

        let mut slots = vec![
            SubflowSlot { execution_id: "c1".into(), ..Default::default() },
            SubflowSlot { execution_id: "c2".into(), ..Default::default() },
        ];
        assert!(!coordinator.fill_from_mailbox("node", &mut slots).await.unwrap());
        assert_eq!(slots[0].result, "done");
        assert!(slots[0].result_set);
        assert!(!slots[1].result_set);
    }
}
