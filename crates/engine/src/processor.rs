//! Applies incoming node results to their execution.
//!
//! This is the only code that mutates a running execution. Each result is
//! applied with a read-modify-write against the store's version counter;
//! on conflict the execution is re-read and the result applied again, which
//! is safe because application is idempotent.
//!
//! Skip propagation runs on an in-process queue: a SKIPPED result pushes
//! the SKIPPED results of its dead children onto the same queue, so a whole
//! dead branch resolves in one write. A finished child execution's result
//! is handed to its parent through the same loop.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use db::Store;

use crate::compression::CompressionGuard;
use crate::config::result_cache_key;
use crate::graph::{GraphIndex, ParentState};
use crate::models::{ActionResult, ActionStatus, ExecutionStatus, ResultBody, WorkflowExecution};
use crate::notify::{self, Notification, Notifier};
use crate::persist;
use crate::subflow::{parse_slots, slots_body, SubflowCoordinator};
use crate::{EngineConfig, EngineError};

/// What [`ResultProcessor::process`] did.
#[derive(Debug, Default)]
pub struct ProcessOutcome {
    /// The result's execution as written (or as found, if nothing changed).
    pub execution: Option<WorkflowExecution>,
    /// Whether this call wrote the result's execution.
    pub durable: bool,
    /// Every execution written by this call, parents included.
    pub touched: Vec<Uuid>,
}

struct Applied {
    execution: WorkflowExecution,
    changed: bool,
    completed: bool,
}

/// How a subflow result looked after resolution.
enum SubflowState {
    Ready,
    /// Looping slots still missing or child still running.
    Pending,
    /// Premature result withdrawn.
    Sinkholed,
}

pub struct ResultProcessor {
    store: Arc<dyn Store>,
    config: Arc<EngineConfig>,
    guard: CompressionGuard,
    subflows: SubflowCoordinator,
    notifier: Arc<dyn Notifier>,
}

impl ResultProcessor {
    pub fn new(store: Arc<dyn Store>, config: Arc<EngineConfig>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            guard: CompressionGuard::new(&config),
            subflows: SubflowCoordinator::new(store.clone(), config.clone()),
            store,
            config,
            notifier,
        }
    }

    /// Apply one result, plus everything it sets in motion.
    ///
    /// # Errors
    /// `Unauthorized` if the result's token doesn't match its execution,
    /// `ExecutionNotFound`, `WriteContention` after repeated version
    /// conflicts, and store failures.
    #[instrument(skip_all, fields(execution_id = %result.execution_id, node_id = %result.action.id))]
    pub async fn process(&self, result: ActionResult) -> Result<ProcessOutcome, EngineError> {
        let mut outcome = ProcessOutcome::default();
        if result.action.id.is_empty() {
            debug!("Ignoring result without an action id");
            return Ok(outcome);
        }

        let origin = result.execution_id;
        let mut work = VecDeque::from([result]);

        while let Some(next) = work.pop_front() {
            let execution_id = next.execution_id;
            let applied = self.apply_with_retry(next).await?;

            if applied.changed && !outcome.touched.contains(&execution_id) {
                outcome.touched.push(execution_id);
            }
            if applied.completed && applied.execution.execution_parent.is_some() {
                if let Some(parent_result) = self.subflows.parent_result(&applied.execution).await? {
                    work.push_back(parent_result);
                }
            }
            if execution_id == origin && outcome.execution.is_none() {
                outcome.durable = applied.changed;
                outcome.execution = Some(applied.execution);
            }
        }

        Ok(outcome)
    }

    async fn apply_with_retry(&self, result: ActionResult) -> Result<Applied, EngineError> {
        let mut conflicts = 0;
        loop {
            let mut execution = persist::load_execution(&*self.store, result.execution_id).await?;
            if execution.authorization != result.authorization {
                return Err(EngineError::Unauthorized(result.execution_id));
            }
            if execution.is_finished() {
                debug!(status = %execution.status, "Execution already finished; result ignored");
                return Ok(Applied { execution, changed: false, completed: false });
            }

            let mut notes = Vec::new();
            let mut queue = VecDeque::from([result.clone()]);
            let mut changed = false;
            while let Some(next) = queue.pop_front() {
                changed |= self.apply_one(&mut execution, next, &mut queue, &mut notes).await?;
                if execution.is_finished() {
                    break;
                }
            }
            if !changed {
                return Ok(Applied { execution, changed: false, completed: false });
            }
            if !execution.is_finished() {
                complete_if_done(&mut execution);
            }
            let completed = execution.is_finished();

            match persist::save_execution(&*self.store, &self.guard, &mut execution).await {
                Ok(()) => {
                    if completed {
                        info!(status = %execution.status, "Execution completed");
                    }
                    for note in notes {
                        notify::emit(&self.notifier, note);
                    }
                    return Ok(Applied { execution, changed: true, completed });
                }
                Err(e) if persist::is_conflict(&e) => {
                    conflicts += 1;
                    if conflicts >= self.config.max_write_conflicts {
                        return Err(EngineError::WriteContention(result.execution_id));
                    }
                    debug!(attempt = conflicts, "Version conflict; re-applying on a fresh read");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Apply a single result to the in-memory execution.
    ///
    /// Returns whether anything changed.
    async fn apply_one(
        &self,
        execution: &mut WorkflowExecution,
        mut result: ActionResult,
        queue: &mut VecDeque<ActionResult>,
        notes: &mut Vec<Notification>,
    ) -> Result<bool, EngineError> {
        if result.action.id.is_empty() {
            return Ok(false);
        }
        result.result = std::mem::take(&mut result.result).sanitized();
        // Workers echo the action they ran, credentials included.
        result.action.scrub_sensitive();
        let node_id = result.action.id.clone();

        if let Some(existing) = execution.result_for(&node_id) {
            if *existing == result {
                return Ok(false);
            }
            if existing.status.is_terminal() && !result.status.is_terminal() {
                debug!(node_id = %node_id, status = %result.status, "Keeping terminal result");
                return Ok(false);
            }
        }

        let mut cacheable = !(result.action.is_user_input() && result.status == ActionStatus::Waiting);
        if result.action.is_subflow() {
            match self.resolve_subflow(execution, &mut result).await? {
                SubflowState::Ready => {}
                SubflowState::Pending => cacheable = false,
                SubflowState::Sinkholed => {
                    let removed = execution.remove_result(&node_id);
                    if execution.status != ExecutionStatus::Waiting {
                        execution.status = ExecutionStatus::Executing;
                    }
                    self.store
                        .delete_cache(&result_cache_key(&execution.execution_id, &node_id))
                        .await?;
                    warn!(node_id = %node_id, "Subflow result arrived before the child finished; dropped for re-poll");
                    return Ok(removed);
                }
            }
        }

        if cacheable {
            self.store
                .set_cache(
                    &result_cache_key(&execution.execution_id, &node_id),
                    serde_json::to_string(&result)?,
                    self.config.result_cache_ttl,
                )
                .await?;
        }

        if result.status == ActionStatus::Success && !result.result.reports_failure() {
            let variable = result
                .action
                .execution_variable
                .clone()
                .or_else(|| execution.workflow.action(&node_id).and_then(|a| a.execution_variable.clone()));
            if let Some(variable) = variable.filter(|v| !v.name.is_empty()) {
                execution.set_variable(&variable.name, result.result.text().into_owned());
            }
        }

        let status = result.status;
        let body = result.result.clone();
        execution.upsert_result(result);
        execution.last_node = node_id.clone();

        match status {
            ActionStatus::Failure | ActionStatus::Aborted => {
                self.on_failure(execution, &node_id, status, &body, queue, notes);
            }
            ActionStatus::Skipped => skip_dead_children(execution, &node_id, queue),
            ActionStatus::Success if body.reports_failure() => {
                self.note(
                    execution,
                    &node_id,
                    notes,
                    "Action reported failure",
                    format!("'{node_id}' finished with status SUCCESS but its result says success=false"),
                );
            }
            _ => {}
        }

        Ok(true)
    }

    fn on_failure(
        &self,
        execution: &mut WorkflowExecution,
        node_id: &str,
        status: ActionStatus,
        body: &ResultBody,
        queue: &mut VecDeque<ActionResult>,
        notes: &mut Vec<Notification>,
    ) {
        self.note(
            execution,
            node_id,
            notes,
            "Action failed",
            format!("'{node_id}' ended with status {status}"),
        );

        if !execution.workflow.configuration.exit_on_error {
            skip_dead_children(execution, node_id, queue);
            return;
        }

        let now = Utc::now();
        execution.status = if status == ActionStatus::Aborted {
            ExecutionStatus::Aborted
        } else {
            ExecutionStatus::Failure
        };
        for running in execution.results.iter_mut().filter(|r| r.status == ActionStatus::Executing) {
            running.status = ActionStatus::Aborted;
            running.completed_at = Some(now);
        }
        execution.completed_at = Some(now);
        execution.result = if execution.workflow.default_return_value.is_empty() {
            body.text().into_owned()
        } else {
            execution.workflow.default_return_value.clone()
        };
        execution.scrub_sensitive();
        queue.clear();
        info!(node_id, status = %execution.status, "Exit on error: execution stopped");
    }

    fn note(
        &self,
        execution: &WorkflowExecution,
        node_id: &str,
        notes: &mut Vec<Notification>,
        title: &str,
        description: String,
    ) {
        if execution.workflow.configuration.skip_notifications {
            return;
        }
        notes.push(Notification {
            org_id: execution.org_id.clone(),
            title: title.to_owned(),
            description,
            workflow_id: execution.workflow_id,
            execution_id: execution.execution_id,
            node_id: node_id.to_owned(),
        });
    }

    /// Settle a `run_subflow` result that may not carry the child's answer.
    async fn resolve_subflow(
        &self,
        execution: &WorkflowExecution,
        result: &mut ActionResult,
    ) -> Result<SubflowState, EngineError> {
        let node_id = result.action.id.clone();

        if let Some(mut slots) = parse_slots(&result.result) {
            // Keep whatever earlier children already delivered.
            if let Some(previous) = execution.result_for(&node_id).and_then(|r| parse_slots(&r.result)) {
                for slot in slots.iter_mut().filter(|s| !s.result_set) {
                    if let Some(known) = previous.iter().find(|p| p.result_set && p.execution_id == slot.execution_id) {
                        *slot = known.clone();
                    }
                }
            }
            let all_set = self.subflows.fill_from_mailbox(&node_id, &mut slots).await?;
            result.result = slots_body(&slots);
            if all_set {
                result.status = ActionStatus::Success;
                return Ok(SubflowState::Ready);
            }
            if result.status.is_terminal() && result.status != ActionStatus::Success {
                return Ok(SubflowState::Ready);
            }
            result.status = ActionStatus::Waiting;
            result.completed_at = None;
            return Ok(SubflowState::Pending);
        }

        if result.status != ActionStatus::Success || !result.action.checks_result() {
            return Ok(SubflowState::Ready);
        }
        let Some(Value::Object(map)) = result.result.parse() else {
            return Ok(SubflowState::Ready);
        };
        if map.contains_key("result") {
            return Ok(SubflowState::Ready);
        }
        let Some(child_id) = map
            .get("execution_id")
            .and_then(Value::as_str)
            .and_then(|id| Uuid::parse_str(id).ok())
        else {
            return Ok(SubflowState::Ready);
        };

        let child = match persist::load_execution(&*self.store, child_id).await {
            Ok(child) => child,
            Err(EngineError::ExecutionNotFound(_)) => return Ok(SubflowState::Sinkholed),
            Err(e) => return Err(e),
        };
        if !child.is_finished() {
            return Ok(SubflowState::Sinkholed);
        }

        result.result = ResultBody::Structured(json!({
            "success": child.status == ExecutionStatus::Finished,
            "id": child.workflow_id,
            "execution_id": child.execution_id,
            "result": child.result,
        }));
        Ok(SubflowState::Ready)
    }
}

/// Queue SKIPPED results for children of `node_id` that can no longer run.
///
/// Children with another parent still pending are left alone; the
/// scheduler picks them up once that parent settles.
fn skip_dead_children(execution: &WorkflowExecution, node_id: &str, queue: &mut VecDeque<ActionResult>) {
    let index = GraphIndex::build(&execution.workflow);
    let status = index.status_lookup(execution);

    for child in index.children(node_id) {
        if execution.result_for(child).is_some() || queue.iter().any(|q| q.action.id == *child) {
            continue;
        }
        match index.parent_state(child, &status, true) {
            ParentState::Dead => {
                let Some(action) = execution.workflow.node_action(child) else {
                    continue;
                };
                debug!(node_id = %child, parent = node_id, "Skipping dead branch");
                let body = json!({ "success": false, "reason": format!("parent '{node_id}' did not succeed") });
                queue.push_back(ActionResult::new(execution, action, ActionStatus::Skipped, body));
            }
            ParentState::Pending => {
                debug!(node_id = %child, "Another parent is still running; not skipping");
            }
            ParentState::Ready | ParentState::NoParents => {}
        }
    }
}

/// Mark the execution FINISHED once every graph node has a terminal result.
fn complete_if_done(execution: &mut WorkflowExecution) -> bool {
    let index = GraphIndex::build(&execution.workflow);
    let expected = execution.workflow.actions.len() + index.extra_trigger_count();

    let in_graph: Vec<&ActionResult> = execution
        .results
        .iter()
        .filter(|r| index.contains(r.node_id()))
        .collect();
    if in_graph.len() < expected || in_graph.iter().any(|r| !r.status.is_terminal()) {
        return false;
    }

    let failed = in_graph.iter().any(|r| r.status.is_failure());
    let last_success = in_graph
        .iter()
        .rev()
        .find(|r| r.status == ActionStatus::Success)
        .map(|r| r.result.text().into_owned());

    let default_value = &execution.workflow.default_return_value;
    let result = if failed && !default_value.is_empty() {
        default_value.clone()
    } else {
        last_success.unwrap_or_default()
    };

    execution.status = ExecutionStatus::Finished;
    execution.completed_at = Some(Utc::now());
    execution.result = result;
    execution.scrub_sensitive();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Action, Branch, Workflow};
    use crate::notify::LogNotifier;
    use db::MemoryStore;

    fn action(id: &str) -> Action {
        Action { id: id.into(), app_name: "http".into(), ..Default::default() }
    }

    async fn seeded(
        store: &Arc<MemoryStore>,
        ids: &[&str],
        edges: &[(&str, &str)],
        exit_on_error: bool,
    ) -> WorkflowExecution {
        let mut workflow = Workflow::new(
            "wf",
            "org",
            ids.iter().map(|id| action(id)).collect(),
            edges.iter().map(|(a, b)| Branch::new(*a, *b)).collect(),
        );
        workflow.start = ids[0].into();
        workflow.configuration.exit_on_error = exit_on_error;
        let mut exec = WorkflowExecution {
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
        };
        let guard = CompressionGuard::new(&EngineConfig::default());
        persist::save_execution(&**store, &guard, &mut exec).await.unwrap();
        exec
    }

    fn processor(store: &Arc<MemoryStore>) -> ResultProcessor {
        ResultProcessor::new(store.clone(), Arc::new(EngineConfig::default()), Arc::new(LogNotifier))
    }

    fn result(exec: &WorkflowExecution, id: &str, status: ActionStatus, body: &str) -> ActionResult {
        ActionResult::new(exec, action(id), status, body)
    }

    #[tokio::test]
    async fn empty_action_id_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let exec = seeded(&store, &["a"], &[], false).await;
        let outcome = processor(&store).process(result(&exec, "", ActionStatus::Success, "x")).await.unwrap();
        assert!(outcome.execution.is_none());
        assert!(!outcome.durable);
    }

    #[tokio::test]
    async fn wrong_authorization_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let exec = seeded(&store, &["a"], &[], false).await;
        let mut forged = result(&exec, "a", ActionStatus::Success, "x");
        forged.authorization = "nope".into();
        let err = processor(&store).process(forged).await.unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn failure_skips_the_whole_downstream_chain_in_one_write() {
        let store = Arc::new(MemoryStore::new());
        let exec = seeded(&store, &["a", "b", "c"], &[("a", "b"), ("b", "c")], false).await;

        let outcome = processor(&store)
            .process(result(&exec, "a", ActionStatus::Failure, "boom"))
            .await
            .unwrap();
        let exec = outcome.execution.unwrap();

        assert_eq!(exec.status_of("b"), Some(ActionStatus::Skipped));
        assert_eq!(exec.status_of("c"), Some(ActionStatus::Skipped));
        assert_eq!(exec.status, ExecutionStatus::Finished);
        assert!(exec.completed_at.is_some());
    }

    #[tokio::test]
    async fn failure_does_not_skip_a_join_with_a_running_parent() {
        let store = Arc::new(MemoryStore::new());
        let exec = seeded(&store, &["s", "a", "b", "c"], &[("s", "a"), ("s", "b"), ("a", "c"), ("b", "c")], false).await;
        let processor = processor(&store);

        processor.process(result(&exec, "s", ActionStatus::Success, "ok")).await.unwrap();
        processor.process(result(&exec, "b", ActionStatus::Executing, "")).await.unwrap();
        let outcome = processor.process(result(&exec, "a", ActionStatus::Failure, "boom")).await.unwrap();

        assert_eq!(outcome.execution.unwrap().status_of("c"), None);
    }

    #[tokio::test]
    async fn exit_on_error_aborts_and_sweeps_running_nodes() {
        let store = Arc::new(MemoryStore::new());
        let exec = seeded(&store, &["s", "a", "b"], &[("s", "a"), ("s", "b")], true).await;
        let processor = processor(&store);

        processor.process(result(&exec, "s", ActionStatus::Success, "ok")).await.unwrap();
        processor.process(result(&exec, "b", ActionStatus::Executing, "")).await.unwrap();
        let outcome = processor.process(result(&exec, "a", ActionStatus::Failure, "boom")).await.unwrap();
        let exec = outcome.execution.unwrap();

        assert_eq!(exec.status, ExecutionStatus::Failure);
        assert_eq!(exec.status_of("b"), Some(ActionStatus::Aborted));
        assert_eq!(exec.result, "boom");
        assert!(exec.completed_at.is_some());
    }

    #[tokio::test]
    async fn terminal_execution_never_changes() {
        let store = Arc::new(MemoryStore::new());
        let exec = seeded(&store, &["a"], &[], false).await;
        let processor = processor(&store);

        let done = processor.process(result(&exec, "a", ActionStatus::Success, "first")).await.unwrap();
        let done = done.execution.unwrap();
        assert_eq!(done.status, ExecutionStatus::Finished);

        let late = processor.process(result(&exec, "a", ActionStatus::Failure, "late")).await.unwrap();
        assert!(!late.durable);
        let after = late.execution.unwrap();
        assert_eq!(after.status, ExecutionStatus::Finished);
        assert_eq!(after.completed_at, done.completed_at);
        assert_eq!(after.result, "first");
    }

    #[tokio::test]
    async fn execution_variable_tracks_successful_output_only() {
        let store = Arc::new(MemoryStore::new());
        let exec = seeded(&store, &["a", "b"], &[("a", "b")], false).await;
        let processor = processor(&store);

        let mut ok = result(&exec, "a", ActionStatus::Success, "42");
        ok.action.execution_variable = Some(crate::models::Variable { name: "answer".into(), value: String::new() });
        let exec1 = processor.process(ok).await.unwrap().execution.unwrap();
        assert_eq!(exec1.execution_variables[0].value, "42");

        let mut soft_fail = result(&exec, "b", ActionStatus::Success, r#"{"success":false}"#);
        soft_fail.action.execution_variable = Some(crate::models::Variable { name: "answer".into(), value: String::new() });
        let exec2 = processor.process(soft_fail).await.unwrap().execution.unwrap();
        assert_eq!(exec2.execution_variables[0].value, "42");
    }

    #[tokio::test]
    async fn result_is_cached_under_its_node_key() {
        let store = Arc::new(MemoryStore::new());
        let exec = seeded(&store, &["a", "b"], &[("a", "b")], false).await;
        processor(&store).process(result(&exec, "a", ActionStatus::Success, "x")).await.unwrap();

        let cached = store.get_cache(&result_cache_key(&exec.execution_id, "a")).await.unwrap();
        assert!(cached.is_some());
    }
}
