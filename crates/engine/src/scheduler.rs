//! Decides which nodes of an execution can be handed to workers next.
//!
//! The scheduler is stateless. Each call looks at one execution snapshot,
//! works out the dispatch frontier and returns it; the actual hand-off is
//! done by an [`ActionDispatcher`](crate::dispatch::ActionDispatcher).
//!
//! Re-dispatch is guarded by short-TTL markers in the cache rather than
//! locks, so a node can occasionally be dispatched twice under a race.
//! Result application is idempotent, which absorbs that.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use db::Store;

use crate::compression::CompressionGuard;
use crate::config::dispatch_marker_key;
use crate::graph::{GraphIndex, NodeKind, ParentState};
use crate::models::{Action, ActionResult, ActionStatus, ExecutionStatus, WorkflowExecution};
use crate::persist;
use crate::{EngineConfig, EngineError};

/// Output of one scheduling cycle.
#[derive(Debug)]
pub struct Decision {
    /// The execution after this cycle (possibly re-persisted).
    pub execution: WorkflowExecution,
    /// Actions to hand to workers now.
    pub dispatch: Vec<Action>,
    /// Nodes every parent of which failed or was skipped. These still have
    /// to go through the result processor.
    pub skipped: Vec<ActionResult>,
    /// A user-input node parked the execution.
    pub waiting: bool,
}

impl Decision {
    fn idle(execution: WorkflowExecution) -> Self {
        let waiting = execution.status == ExecutionStatus::Waiting;
        Self { execution, dispatch: Vec::new(), skipped: Vec::new(), waiting }
    }
}

enum Step {
    Dispatch(Action),
    Skip(ActionResult),
    AwaitInput(Action),
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    config: Arc<EngineConfig>,
    guard: CompressionGuard,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, config: Arc<EngineConfig>) -> Self {
        let guard = CompressionGuard::new(&config);
        Self { store, config, guard }
    }

    /// Compute the next dispatchable nodes for `execution`.
    ///
    /// # Errors
    /// Store failures, and `DbError::VersionConflict` (wrapped) if the
    /// execution changed while this cycle had to write it back.
    #[instrument(skip_all, fields(execution_id = %execution.execution_id))]
    pub async fn next_actions(&self, mut execution: WorkflowExecution) -> Result<Decision, EngineError> {
        if execution.is_finished() || execution.status == ExecutionStatus::Waiting {
            return Ok(Decision::idle(execution));
        }

        let index = GraphIndex::build(&execution.workflow);
        let (frontier, reverted) = seed_frontier(&index, &mut execution);
        let steps = plan(&index, &execution, frontier);

        let mut dispatch = Vec::new();
        let mut skipped = Vec::new();
        let mut waiting = false;
        let mut claimed = Vec::new();

        for step in steps {
            match step {
                Step::Skip(result) => {
                    debug!(node_id = %result.action.id, "Every parent failed; skipping");
                    skipped.push(result);
                }
                Step::Dispatch(action) => {
                    if self.claim(&execution, &action.id, &mut claimed).await? {
                        debug!(node_id = %action.id, app = %action.app_name, "Dispatching");
                        dispatch.push(action);
                    }
                }
                Step::AwaitInput(action) => {
                    if !self.claim(&execution, &action.id, &mut claimed).await? {
                        continue;
                    }
                    let node_id = action.id.clone();
                    let result = ActionResult::new(&execution, action, ActionStatus::Waiting, "Waiting for user input");
                    execution.upsert_result(result);
                    execution.status = ExecutionStatus::Waiting;
                    execution.last_node = node_id.clone();
                    self.save_or_release(&mut execution, &claimed).await?;

                    info!(node_id = %node_id, "Execution parked waiting for user input");
                    waiting = true;
                    break;
                }
            }
        }

        if reverted && !waiting {
            self.save_or_release(&mut execution, &claimed).await?;
        }

        Ok(Decision { execution, dispatch, skipped, waiting })
    }

    /// Set the dispatch marker for a node unless one exists already.
    ///
    /// Keys set here are pushed onto `claimed`.
    async fn claim(
        &self,
        execution: &WorkflowExecution,
        node_id: &str,
        claimed: &mut Vec<String>,
    ) -> Result<bool, EngineError> {
        let key = dispatch_marker_key(&execution.execution_id, node_id);
        if self.store.get_cache(&key).await?.is_some() {
            debug!(node_id, "Already dispatched recently");
            return Ok(false);
        }
        self.store.set_cache(&key, "1".to_owned(), self.config.dispatch_marker_ttl).await?;
        claimed.push(key);
        Ok(true)
    }

    /// Write the cycle back. If the write fails, markers claimed by this
    /// cycle are dropped so the retry on a fresh snapshot can claim them.
    async fn save_or_release(&self, execution: &mut WorkflowExecution, claimed: &[String]) -> Result<(), EngineError> {
        let Err(e) = persist::save_execution(&*self.store, &self.guard, execution).await else {
            return Ok(());
        };
        for key in claimed {
            if let Err(release) = self.store.delete_cache(key).await {
                warn!(%key, error = %release, "Failed releasing dispatch marker");
            }
        }
        Err(e)
    }
}

/// Build the candidate set for this cycle.
///
/// Returns the frontier in discovery order and whether any premature
/// SKIPPED result was withdrawn (which requires a write-back).
fn seed_frontier(index: &GraphIndex, execution: &mut WorkflowExecution) -> (Vec<String>, bool) {
    let mut frontier = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |id: &str, frontier: &mut Vec<String>| {
        if seen.insert(id.to_owned()) {
            frontier.push(id.to_owned());
        }
    };

    if execution.results.is_empty() {
        push(&execution.start.clone(), &mut frontier);
        return (frontier, false);
    }

    // A SKIPPED node with a parent still running was skipped too early; an
    // OR-join may yet succeed through that parent.
    let premature: Vec<String> = {
        let status = index.status_lookup(execution);
        execution
            .results
            .iter()
            .filter(|r| r.status == ActionStatus::Skipped && r.action.id != execution.start)
            .filter(|r| index.parent_state(r.node_id(), &status, true) == ParentState::Pending)
            .map(|r| r.action.id.clone())
            .collect()
    };
    for id in &premature {
        debug!(node_id = %id, "Withdrawing premature skip");
        execution.remove_result(id);
        push(id, &mut frontier);
    }

    let terminal: Vec<String> = execution
        .results
        .iter()
        .filter(|r| r.status.is_terminal())
        .map(|r| r.action.id.clone())
        .collect();
    for id in &terminal {
        for child in index.children(id) {
            if execution.result_for(child).is_none() {
                push(child, &mut frontier);
            }
        }
    }

    // Repair pass: nothing new is runnable, yet nodes may still be lacking
    // results because a delivery got lost somewhere.
    if frontier.is_empty() {
        let status = index.status_lookup(execution);
        for node in index.nodes() {
            if execution.result_for(node).is_some() {
                continue;
            }
            match index.parent_state(node, &status, true) {
                ParentState::Ready | ParentState::Dead => push(node, &mut frontier),
                ParentState::NoParents if *node == execution.start => push(node, &mut frontier),
                _ => {}
            }
        }
        if !frontier.is_empty() {
            warn!(nodes = ?frontier, "Repair pass recovered stalled nodes");
        }
    }

    (frontier, !premature.is_empty())
}

/// Classify each frontier node without touching the store.
fn plan(index: &GraphIndex, execution: &WorkflowExecution, frontier: Vec<String>) -> Vec<Step> {
    let status = index.status_lookup(execution);
    let fallback_env = execution
        .workflow
        .action(&execution.start)
        .map(|a| a.environment.clone())
        .unwrap_or_default();

    let mut steps = Vec::new();
    for node in frontier {
        if execution.result_for(&node).is_some() {
            continue;
        }
        let Some(mut action) = execution.workflow.node_action(&node) else {
            warn!(node_id = %node, "Frontier node is not part of the workflow");
            continue;
        };
        if action.environment.is_empty() {
            action.environment = fallback_env.clone();
        }

        let is_start = node == execution.start;
        let state = if is_start {
            ParentState::NoParents
        } else {
            index.parent_state(&node, &status, true)
        };

        match state {
            ParentState::Pending => continue,
            ParentState::Dead => {
                let body = "{\"success\":false,\"reason\":\"no parent node succeeded\"}";
                steps.push(Step::Skip(ActionResult::new(execution, action, ActionStatus::Skipped, body)));
                continue;
            }
            ParentState::Ready | ParentState::NoParents => {}
        }

        match index.kind(&node) {
            Some(NodeKind::Trigger(_)) if action.is_user_input() && !is_start => {
                steps.push(Step::AwaitInput(action));
            }
            Some(NodeKind::Trigger(_)) if action.is_subflow() => {
                // Children may not start before every incoming branch is
                // settled, loop back-edges included.
                if is_start || index.parent_state(&node, &status, false) != ParentState::Pending {
                    steps.push(Step::Dispatch(action));
                }
            }
            _ => steps.push(Step::Dispatch(action)),
        }
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Branch, ResultBody, Trigger, TriggerType, Workflow};
    use chrono::Utc;
    use db::MemoryStore;
    use uuid::Uuid;

    fn action(id: &str) -> Action {
        Action { id: id.into(), app_name: "http".into(), environment: "cloud".into(), ..Default::default() }
    }

    fn execution(ids: &[&str], edges: &[(&str, &str)]) -> WorkflowExecution {
        let mut workflow = Workflow::new(
            "wf",
            "org",
            ids.iter().map(|id| action(id)).collect(),
            edges.iter().map(|(a, b)| Branch::new(*a, *b)).collect(),
        );
        workflow.start = ids[0].into();
        WorkflowExecution {
            execution_id: Uuid::new_v4(),
            workflow_id: workflow.id,
            org_id: "org".into(),
            start: ids[0].into(),
            workflow,
            status: ExecutionStatus::Executing,
            execution_argument: ResultBody::default(),
            execution_source: "test".into(),
            results: vec![],
            execution_variables: vec![],
            execution_parent: None,
            execution_source_node: String::new(),
            execution_source_auth: String::new(),
            authorization: "auth".into(),
            priority: 0,
            sub_execution_count: 0,
            result: String::new(),
            last_node: String::new(),
            started_at: Utc::now(),
            completed_at: None,
            version: 0,
        }
    }

    fn record(exec: &mut WorkflowExecution, id: &str, status: ActionStatus) {
        let result = ActionResult::new(exec, action(id), status, "{}");
        exec.upsert_result(result);
    }

    fn scheduler() -> (Arc<MemoryStore>, Scheduler) {
        let store = Arc::new(MemoryStore::new());
        let scheduler = Scheduler::new(store.clone(), Arc::new(EngineConfig::default()));
        (store, scheduler)
    }

    fn ids(actions: &[Action]) -> Vec<&str> {
        actions.iter().map(|a| a.id.as_str()).collect()
    }

    #[tokio::test]
    async fn fresh_execution_dispatches_the_start_node() {
        let (_, scheduler) = scheduler();
        let exec = execution(&["start", "send"], &[("start", "send")]);
        let decision = scheduler.next_actions(exec).await.unwrap();
        assert_eq!(ids(&decision.dispatch), vec!["start"]);
    }

    #[tokio::test]
    async fn dispatch_marker_prevents_a_second_dispatch() {
        let (_, scheduler) = scheduler();
        let exec = execution(&["start", "send"], &[("start", "send")]);
        let first = scheduler.next_actions(exec.clone()).await.unwrap();
        let second = scheduler.next_actions(exec).await.unwrap();
        assert_eq!(first.dispatch.len(), 1);
        assert!(second.dispatch.is_empty());
    }

    #[tokio::test]
    async fn join_waits_for_every_parent() {
        let (_, scheduler) = scheduler();
        let mut exec = execution(&["s", "a", "b", "c"], &[("s", "a"), ("s", "b"), ("a", "c"), ("b", "c")]);
        record(&mut exec, "s", ActionStatus::Success);
        record(&mut exec, "a", ActionStatus::Success);
        record(&mut exec, "b", ActionStatus::Executing);

        let decision = scheduler.next_actions(exec).await.unwrap();
        assert!(decision.dispatch.is_empty());
    }

    #[tokio::test]
    async fn node_with_only_failed_parents_is_skipped() {
        let (_, scheduler) = scheduler();
        let mut exec = execution(&["s", "a"], &[("s", "a")]);
        record(&mut exec, "s", ActionStatus::Failure);

        let decision = scheduler.next_actions(exec).await.unwrap();
        assert!(decision.dispatch.is_empty());
        assert_eq!(decision.skipped.len(), 1);
        assert_eq!(decision.skipped[0].status, ActionStatus::Skipped);
    }

    #[tokio::test]
    async fn premature_skip_is_withdrawn_and_persisted() {
        let (store, scheduler) = scheduler();
        let mut exec = execution(&["s", "a", "b", "c"], &[("s", "a"), ("s", "b"), ("a", "c"), ("b", "c")]);
        record(&mut exec, "s", ActionStatus::Success);
        record(&mut exec, "a", ActionStatus::Failure);
        record(&mut exec, "b", ActionStatus::Executing);
        record(&mut exec, "c", ActionStatus::Skipped);
        let guard = CompressionGuard::new(&EngineConfig::default());
        persist::save_execution(&*store, &guard, &mut exec).await.unwrap();

        let decision = scheduler.next_actions(exec).await.unwrap();
        assert!(decision.execution.result_for("c").is_none());

        let stored = persist::load_execution(&*store, decision.execution.execution_id).await.unwrap();
        assert!(stored.result_for("c").is_none());
    }

    #[tokio::test]
    async fn user_input_trigger_parks_the_execution() {
        let (store, scheduler) = scheduler();
        let mut exec = execution(&["s", "after"], &[("s", "ask"), ("ask", "after")]);
        exec.workflow.triggers.push(Trigger {
            id: "ask".into(),
            label: "approve".into(),
            name: "User Input".into(),
            trigger_type: TriggerType::UserInput,
            app_name: "User Input".into(),
            parameters: vec![],
            environment: String::new(),
            is_start_node: false,
        });
        record(&mut exec, "s", ActionStatus::Success);
        let guard = CompressionGuard::new(&EngineConfig::default());
        persist::save_execution(&*store, &guard, &mut exec).await.unwrap();

        let decision = scheduler.next_actions(exec).await.unwrap();
        assert!(decision.waiting);
        assert!(decision.dispatch.is_empty());
        assert_eq!(decision.execution.status, ExecutionStatus::Waiting);
        assert_eq!(decision.execution.status_of("ask"), Some(ActionStatus::Waiting));

        let stored = persist::load_execution(&*store, decision.execution.execution_id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Waiting);
    }

    fn ask_trigger() -> Trigger {
        Trigger {
            id: "ask".into(),
            label: "approve".into(),
            name: "User Input".into(),
            trigger_type: TriggerType::UserInput,
            app_name: "User Input".into(),
            parameters: vec![],
            environment: String::new(),
            is_start_node: false,
        }
    }

    #[tokio::test]
    async fn conflicting_park_leaves_the_node_claimable_for_the_retry() {
        let (store, scheduler) = scheduler();
        let mut exec = execution(&["s", "after"], &[("s", "ask"), ("ask", "after")]);
        exec.workflow.triggers.push(ask_trigger());
        record(&mut exec, "s", ActionStatus::Success);
        let guard = CompressionGuard::new(&EngineConfig::default());
        persist::save_execution(&*store, &guard, &mut exec).await.unwrap();

        // Someone else writes in between; our snapshot is now stale.
        let stale = exec.clone();
        persist::save_execution(&*store, &guard, &mut exec).await.unwrap();

        let err = scheduler.next_actions(stale).await.unwrap_err();
        assert!(persist::is_conflict(&err));
        assert!(store
            .get_cache(&dispatch_marker_key(&exec.execution_id, "ask"))
            .await
            .unwrap()
            .is_none());

        let fresh = persist::load_execution(&*store, exec.execution_id).await.unwrap();
        let decision = scheduler.next_actions(fresh).await.unwrap();
        assert!(decision.waiting);
        assert_eq!(decision.execution.status, ExecutionStatus::Waiting);
        assert_eq!(decision.execution.status_of("ask"), Some(ActionStatus::Waiting));
    }

    #[tokio::test]
    async fn conflicting_skip_withdrawal_keeps_the_dispatch_for_the_retry() {
        let (store, scheduler) = scheduler();
        let mut exec = execution(
            &["s", "a", "b", "c", "d"],
            &[("s", "a"), ("s", "b"), ("s", "d"), ("a", "c"), ("b", "c")],
        );
        record(&mut exec, "s", ActionStatus::Success);
        record(&mut exec, "a", ActionStatus::Failure);
        record(&mut exec, "b", ActionStatus::Executing);
        record(&mut exec, "c", ActionStatus::Skipped);
        let guard = CompressionGuard::new(&EngineConfig::default());
        persist::save_execution(&*store, &guard, &mut exec).await.unwrap();
        let stale = exec.clone();
        persist::save_execution(&*store, &guard, &mut exec).await.unwrap();

        let err = scheduler.next_actions(stale).await.unwrap_err();
        assert!(persist::is_conflict(&err));

        let fresh = persist::load_execution(&*store, exec.execution_id).await.unwrap();
        let decision = scheduler.next_actions(fresh).await.unwrap();
        assert_eq!(ids(&decision.dispatch), vec!["d"]);
    }

    #[tokio::test]
    async fn expired_marker_allows_redispatch() {
        let (store, scheduler) = scheduler();
        let mut exec = execution(&["s", "a", "b"], &[("s", "a"), ("a", "b")]);
        record(&mut exec, "s", ActionStatus::Success);
        record(&mut exec, "a", ActionStatus::Success);

        let first = scheduler.next_actions(exec.clone()).await.unwrap();
        assert_eq!(ids(&first.dispatch), vec!["b"]);
        store
            .delete_cache(&dispatch_marker_key(&exec.execution_id, "b"))
            .await
            .unwrap();

        let again = scheduler.next_actions(exec).await.unwrap();
        assert_eq!(ids(&again.dispatch), vec!["b"]);
    }

    #[tokio::test]
    async fn repair_pass_recovers_a_lost_start_dispatch() {
        let (_, scheduler) = scheduler();
        // "orphan" was pre-skipped as unreachable, but the start node never
        // reported back.
        let mut exec = execution(&["s", "a", "orphan"], &[("s", "a")]);
        record(&mut exec, "orphan", ActionStatus::Skipped);

        let decision = scheduler.next_actions(exec).await.unwrap();
        assert_eq!(ids(&decision.dispatch), vec!["s"]);
    }
}
