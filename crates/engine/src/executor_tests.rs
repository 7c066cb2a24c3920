//! End-to-end engine scenarios.
//!
//! Everything runs against `MemoryStore`; workers are simulated by building
//! the results they would report and feeding them to `ingest`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use db::models::{AppAuthRow, AuthFieldRow, EnvironmentRow, Json, OrgRow};
use db::{MemoryStore, Store};

use crate::auth::seal_record;
use crate::config::result_cache_key;
use crate::dispatch::ActionDispatcher;
use crate::executor::{ExecutionOutcome, WorkflowExecutor};
use crate::models::{
    Action, ActionResult, ActionStatus, Branch, ExecutionStatus, Parameter, ResultBody, Trigger, TriggerType,
    Workflow, WorkflowExecution,
};
use crate::preparer::ExecutionRequest;
use crate::subflow::{parse_slots, SubflowSlot};
use crate::{persist, EngineConfig, EngineError};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingDispatcher {
    sent: Mutex<Vec<(Uuid, Action)>>,
}

impl RecordingDispatcher {
    fn sent_for(&self, execution_id: Uuid) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == execution_id)
            .map(|(_, action)| action.id.clone())
            .collect()
    }

    /// The action exactly as a worker received it.
    fn last_sent(&self, execution_id: Uuid, node: &str) -> Action {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, action)| *id == execution_id && action.id == node)
            .map(|(_, action)| action.clone())
            .unwrap()
    }
}

#[async_trait]
impl ActionDispatcher for RecordingDispatcher {
    async fn dispatch(&self, execution: &WorkflowExecution, actions: &[Action]) -> Result<(), EngineError> {
        let mut sent = self.sent.lock().unwrap();
        for action in actions {
            sent.push((execution.execution_id, action.clone()));
        }
        Ok(())
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    dispatcher: Arc<RecordingDispatcher>,
    executor: WorkflowExecutor,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    store.insert_org(
        OrgRow { id: "org".into(), name: "Org".into() },
        vec![EnvironmentRow {
            id: Uuid::new_v4(),
            org_id: "org".into(),
            name: "cloud".into(),
            env_type: "cloud".into(),
            is_default: true,
            archived: false,
        }],
    );
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let executor = WorkflowExecutor::new(store.clone(), Arc::new(EngineConfig::default()), dispatcher.clone());
    Harness { store, dispatcher, executor }
}

fn action(id: &str) -> Action {
    Action { id: id.into(), label: id.into(), app_name: "http".into(), ..Default::default() }
}

fn workflow(ids: &[&str], edges: &[(&str, &str)]) -> Workflow {
    let mut wf = Workflow::new(
        "scenario",
        "org",
        ids.iter().map(|id| action(id)).collect(),
        edges.iter().map(|(a, b)| Branch::new(*a, *b)).collect(),
    );
    wf.start = ids[0].into();
    wf
}

fn trigger(id: &str, trigger_type: TriggerType, app_name: &str, parameters: Vec<Parameter>) -> Trigger {
    Trigger {
        id: id.into(),
        label: id.into(),
        name: app_name.into(),
        trigger_type,
        app_name: app_name.into(),
        parameters,
        environment: String::new(),
        is_start_node: false,
    }
}

/// What a worker would report for `node` of `execution`.
fn report(execution: &WorkflowExecution, node: &str, status: ActionStatus, body: impl Into<ResultBody>) -> ActionResult {
    let action = execution.workflow.node_action(node).unwrap();
    ActionResult::new(execution, action, status, body)
}

async fn start(h: &Harness, wf: Workflow, request: ExecutionRequest) -> WorkflowExecution {
    match h.executor.execute(wf, request).await.unwrap() {
        ExecutionOutcome::Started { execution, .. } => execution,
        other => panic!("expected Started, got {other:?}"),
    }
}

async fn ingest(h: &Harness, result: ActionResult) -> WorkflowExecution {
    h.executor.ingest(result).await.unwrap().execution.unwrap()
}

async fn load(h: &Harness, id: Uuid) -> WorkflowExecution {
    persist::load_execution(&*h.store, id).await.unwrap()
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn success_of_start_dispatches_its_child() {
    let h = harness();
    let exec = start(&h, workflow(&["Start", "Send"], &[("Start", "Send")]), ExecutionRequest::default()).await;
    assert_eq!(h.dispatcher.sent_for(exec.execution_id), vec!["Start"]);

    ingest(&h, report(&exec, "Start", ActionStatus::Success, "{}")).await;
    assert_eq!(h.dispatcher.sent_for(exec.execution_id), vec!["Start", "Send"]);
}

#[tokio::test]
async fn failed_head_of_a_chain_skips_the_rest() {
    let h = harness();
    let exec = start(&h, workflow(&["A", "B", "C"], &[("A", "B"), ("B", "C")]), ExecutionRequest::default()).await;

    let after = ingest(&h, report(&exec, "A", ActionStatus::Failure, "boom")).await;

    assert_eq!(after.status_of("B"), Some(ActionStatus::Skipped));
    assert_eq!(after.status_of("C"), Some(ActionStatus::Skipped));
    assert_eq!(after.status, ExecutionStatus::Finished);
    assert!(after.completed_at.is_some());
    assert_eq!(h.dispatcher.sent_for(exec.execution_id), vec!["A"]);
}

#[tokio::test]
async fn or_join_runs_when_one_parent_succeeds() {
    let h = harness();
    let wf = workflow(&["S", "A", "B", "C"], &[("S", "A"), ("S", "B"), ("A", "C"), ("B", "C")]);
    let exec = start(&h, wf, ExecutionRequest::default()).await;

    ingest(&h, report(&exec, "S", ActionStatus::Success, "{}")).await;
    let after_fail = ingest(&h, report(&exec, "A", ActionStatus::Failure, "boom")).await;
    assert_eq!(after_fail.status_of("C"), None);

    let after_ok = ingest(&h, report(&exec, "B", ActionStatus::Success, "{}")).await;
    assert_eq!(after_ok.status_of("C"), None);
    assert!(h.dispatcher.sent_for(exec.execution_id).contains(&"C".to_owned()));
}

#[tokio::test]
async fn applying_the_same_result_twice_is_idempotent() {
    let h = harness();
    let exec = start(&h, workflow(&["A", "B"], &[("A", "B")]), ExecutionRequest::default()).await;
    let result = report(&exec, "A", ActionStatus::Success, r#"{"n": 1}"#);

    let once = ingest(&h, result.clone()).await;
    let twice = h.executor.ingest(result).await.unwrap();

    assert!(!twice.durable);
    assert_eq!(once.results, twice.execution.unwrap().results);
    assert_eq!(h.dispatcher.sent_for(exec.execution_id), vec!["A", "B"]);
}

#[tokio::test]
async fn exit_on_error_stops_the_execution_with_the_default_return_value() {
    let h = harness();
    let mut wf = workflow(&["A", "B"], &[("A", "B")]);
    wf.configuration.exit_on_error = true;
    wf.default_return_value = "fallback".into();
    let exec = start(&h, wf, ExecutionRequest::default()).await;

    let after = ingest(&h, report(&exec, "A", ActionStatus::Failure, "boom")).await;
    assert_eq!(after.status, ExecutionStatus::Failure);
    assert_eq!(after.result, "fallback");
    assert_eq!(after.status_of("B"), None);

    // Terminal means terminal.
    let late = ingest(&h, report(&exec, "B", ActionStatus::Success, "{}")).await;
    assert_eq!(late.status, ExecutionStatus::Failure);
    assert_eq!(late.completed_at, after.completed_at);
}

#[tokio::test]
async fn results_poll_requires_the_execution_token() {
    let h = harness();
    let exec = start(&h, workflow(&["A"], &[]), ExecutionRequest::default()).await;

    let err = h.executor.get_execution(exec.execution_id, "wrong").await.unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized(_)));
    assert!(h.executor.get_execution(exec.execution_id, &exec.authorization).await.is_ok());
}

// ---------------------------------------------------------------------------
// User input
// ---------------------------------------------------------------------------

fn approval_workflow() -> Workflow {
    let mut wf = workflow(&["Start", "After"], &[("Start", "ask"), ("ask", "After")]);
    wf.triggers.push(trigger("ask", TriggerType::UserInput, "User Input", vec![]));
    wf
}

#[tokio::test]
async fn user_input_parks_and_an_answer_resumes() {
    let h = harness();
    let exec = start(&h, approval_workflow(), ExecutionRequest::default()).await;

    let parked = ingest(&h, report(&exec, "Start", ActionStatus::Success, "{}")).await;
    assert_eq!(parked.status, ExecutionStatus::Waiting);
    assert_eq!(parked.status_of("ask"), Some(ActionStatus::Waiting));
    assert_eq!(h.dispatcher.sent_for(exec.execution_id), vec!["Start"]);

    let resume = ExecutionRequest {
        reference_execution: Some(exec.execution_id),
        authorization: Some(exec.authorization.clone()),
        node: Some("ask".into()),
        answer: Some("true".into()),
        ..Default::default()
    };
    let resumed = match h.executor.execute(approval_workflow(), resume).await.unwrap() {
        ExecutionOutcome::Resumed { execution } => execution,
        other => panic!("expected Resumed, got {other:?}"),
    };
    assert_eq!(resumed.status, ExecutionStatus::Executing);
    assert_eq!(resumed.status_of("ask"), Some(ActionStatus::Success));
    assert_eq!(h.dispatcher.sent_for(exec.execution_id), vec!["Start", "After"]);
}

#[tokio::test]
async fn declined_user_input_skips_downstream() {
    let h = harness();
    let exec = start(&h, approval_workflow(), ExecutionRequest::default()).await;
    ingest(&h, report(&exec, "Start", ActionStatus::Success, "{}")).await;

    let decline = ExecutionRequest {
        reference_execution: Some(exec.execution_id),
        authorization: Some(exec.authorization.clone()),
        answer: Some("false".into()),
        ..Default::default()
    };
    h.executor.execute(approval_workflow(), decline).await.unwrap();

    let after = load(&h, exec.execution_id).await;
    assert_eq!(after.status_of("ask"), Some(ActionStatus::Aborted));
    assert_eq!(after.status_of("After"), Some(ActionStatus::Skipped));
    assert_eq!(after.status, ExecutionStatus::Finished);
}

#[tokio::test]
async fn answer_without_a_node_skips_a_waiting_subflow() {
    let h = harness();
    let mut wf = workflow(&["Start", "mid"], &[("Start", "loop"), ("Start", "mid"), ("mid", "ask")]);
    wf.triggers.push(trigger("loop", TriggerType::Subflow, "Shuffle Workflow", vec![]));
    wf.triggers.push(trigger("ask", TriggerType::UserInput, "User Input", vec![]));
    let exec = start(&h, wf.clone(), ExecutionRequest::default()).await;
    ingest(&h, report(&exec, "Start", ActionStatus::Success, "{}")).await;

    let slots = json!([{ "execution_id": Uuid::new_v4().to_string(), "result_set": false }]);
    ingest(&h, report(&exec, "loop", ActionStatus::Success, slots)).await;
    let parked = ingest(&h, report(&exec, "mid", ActionStatus::Success, "{}")).await;
    assert_eq!(parked.status, ExecutionStatus::Waiting);
    assert_eq!(parked.status_of("loop"), Some(ActionStatus::Waiting));

    let answer = ExecutionRequest {
        reference_execution: Some(exec.execution_id),
        authorization: Some(exec.authorization.clone()),
        answer: Some("true".into()),
        ..Default::default()
    };
    h.executor.execute(wf, answer).await.unwrap();

    let after = load(&h, exec.execution_id).await;
    assert_eq!(after.status_of("ask"), Some(ActionStatus::Success));
    assert_eq!(after.status_of("loop"), Some(ActionStatus::Waiting));
}

#[tokio::test]
async fn resume_with_a_wrong_token_is_rejected() {
    let h = harness();
    let exec = start(&h, approval_workflow(), ExecutionRequest::default()).await;
    ingest(&h, report(&exec, "Start", ActionStatus::Success, "{}")).await;

    let forged = ExecutionRequest {
        reference_execution: Some(exec.execution_id),
        authorization: Some("guess".into()),
        answer: Some("true".into()),
        ..Default::default()
    };
    let err = h.executor.execute(approval_workflow(), forged).await.unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized(_)));
}

// ---------------------------------------------------------------------------
// Subflows
// ---------------------------------------------------------------------------

fn child_request(parent: &WorkflowExecution, node: &str) -> ExecutionRequest {
    ExecutionRequest {
        execution_id: Some(Uuid::new_v4()),
        source_execution: Some(parent.execution_id),
        source_node: Some(node.into()),
        source_auth: Some(parent.authorization.clone()),
        source_workflow: Some(parent.workflow_id),
        execution_source: "subflow".into(),
        ..Default::default()
    }
}

async fn run_child(h: &Harness, parent: &WorkflowExecution, node: &str, output: &str) -> WorkflowExecution {
    let child = start(h, workflow(&["c"], &[]), child_request(parent, node)).await;
    ingest(h, report(&child, "c", ActionStatus::Success, output)).await
}

#[tokio::test]
async fn finished_child_result_lands_in_the_parent() {
    let h = harness();
    let mut wf = workflow(&["Start"], &[("Start", "sub")]);
    wf.triggers.push(trigger("sub", TriggerType::Subflow, "Shuffle Workflow", vec![]));
    let parent = start(&h, wf, ExecutionRequest::default()).await;

    ingest(&h, report(&parent, "Start", ActionStatus::Success, "{}")).await;
    assert_eq!(h.dispatcher.sent_for(parent.execution_id), vec!["Start", "sub"]);

    let child = run_child(&h, &parent, "sub", "ok").await;
    assert_eq!(child.status, ExecutionStatus::Finished);
    assert_eq!(child.sub_execution_count, 1);

    let parent = load(&h, parent.execution_id).await;
    let body = parent.result_for("sub").unwrap().result.parse().unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["result"], "ok");
    assert_eq!(body["execution_id"], child.execution_id.to_string());
    assert_eq!(parent.status, ExecutionStatus::Finished);
}

#[tokio::test]
async fn looping_subflow_fills_every_slot_before_succeeding() {
    let h = harness();
    let mut wf = workflow(&["Start"], &[("Start", "loop")]);
    wf.triggers.push(trigger(
        "loop",
        TriggerType::Subflow,
        "Shuffle Workflow",
        vec![Parameter::new("argument", "$Start.items.#")],
    ));
    let parent = start(&h, wf, ExecutionRequest::default()).await;
    ingest(&h, report(&parent, "Start", ActionStatus::Success, r#"{"items":[1,2,3]}"#)).await;

    // The worker starts three children; the first finishes before the
    // worker has even reported the slot list.
    let requests: Vec<ExecutionRequest> = (0..3).map(|_| child_request(&parent, "loop")).collect();
    let mut children = Vec::new();
    for request in &requests {
        children.push(start(&h, workflow(&["c"], &[]), request.clone()).await);
    }
    ingest(&h, report(&children[0], "c", ActionStatus::Success, "r0")).await;

    let slots: Vec<SubflowSlot> = children
        .iter()
        .map(|c| SubflowSlot {
            success: true,
            id: c.workflow_id.to_string(),
            execution_id: c.execution_id.to_string(),
            ..Default::default()
        })
        .collect();
    let listed = ingest(&h, report(&parent, "loop", ActionStatus::Success, json!(slots))).await;
    assert_eq!(listed.status_of("loop"), Some(ActionStatus::Waiting));
    assert_eq!(listed.status, ExecutionStatus::Executing);

    ingest(&h, report(&children[1], "c", ActionStatus::Success, "r1")).await;
    let midway = load(&h, parent.execution_id).await;
    assert_eq!(midway.status_of("loop"), Some(ActionStatus::Waiting));

    ingest(&h, report(&children[2], "c", ActionStatus::Success, "r2")).await;
    let done = load(&h, parent.execution_id).await;
    let result = done.result_for("loop").unwrap();
    let slots = parse_slots(&result.result).unwrap();

    assert_eq!(result.status, ActionStatus::Success);
    assert_eq!(slots.len(), 3);
    assert!(slots.iter().all(|s| s.result_set));
    assert_eq!(slots.iter().map(|s| s.result.as_str()).collect::<Vec<_>>(), vec!["r0", "r1", "r2"]);
    assert_eq!(done.status, ExecutionStatus::Finished);
}

#[tokio::test]
async fn early_checked_subflow_result_is_dropped_until_the_child_finishes() {
    let h = harness();
    let mut wf = workflow(&["Start"], &[("Start", "sub")]);
    wf.triggers.push(trigger(
        "sub",
        TriggerType::Subflow,
        "Shuffle Workflow",
        vec![Parameter::new("check_result", "true")],
    ));
    let parent = start(&h, wf, ExecutionRequest::default()).await;
    ingest(&h, report(&parent, "Start", ActionStatus::Success, "{}")).await;

    let child = start(&h, workflow(&["c"], &[]), child_request(&parent, "sub")).await;
    ingest(&h, report(&parent, "sub", ActionStatus::Executing, "")).await;
    let cache_key = result_cache_key(&parent.execution_id, "sub");
    assert!(h.store.get_cache(&cache_key).await.unwrap().is_some());

    // The worker only knows which child it started, not what it returned.
    let early = json!({ "success": true, "execution_id": child.execution_id.to_string() });
    ingest(&h, report(&parent, "sub", ActionStatus::Success, early)).await;

    let after = load(&h, parent.execution_id).await;
    assert!(after.result_for("sub").is_none());
    assert_eq!(after.status, ExecutionStatus::Executing);
    assert!(h.store.get_cache(&cache_key).await.unwrap().is_none());

    ingest(&h, report(&child, "c", ActionStatus::Success, "ok")).await;
    let done = load(&h, parent.execution_id).await;
    let body = done.result_for("sub").unwrap().result.parse().unwrap();
    assert_eq!(body["result"], "ok");
    assert_eq!(done.status, ExecutionStatus::Finished);
}

#[tokio::test]
async fn checked_subflow_result_is_filled_from_a_finished_child() {
    let h = harness();
    let mut wf = workflow(&["Start"], &[("Start", "sub")]);
    wf.triggers.push(trigger(
        "sub",
        TriggerType::Subflow,
        "Shuffle Workflow",
        vec![Parameter::new("check_result", "true")],
    ));
    let parent = start(&h, wf, ExecutionRequest::default()).await;
    ingest(&h, report(&parent, "Start", ActionStatus::Success, "{}")).await;

    // A child that finished without reporting to this parent itself.
    let child = start(&h, workflow(&["c"], &[]), ExecutionRequest::default()).await;
    let child = ingest(&h, report(&child, "c", ActionStatus::Success, "done")).await;
    assert_eq!(child.status, ExecutionStatus::Finished);

    let late = json!({ "success": true, "execution_id": child.execution_id.to_string() });
    ingest(&h, report(&parent, "sub", ActionStatus::Success, late)).await;

    let done = load(&h, parent.execution_id).await;
    let body = done.result_for("sub").unwrap().result.parse().unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["result"], "done");
    assert_eq!(done.status, ExecutionStatus::Finished);
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

async fn seal_apikey(h: &Harness, secret: &str) {
    let mut record = AppAuthRow {
        id: "auth-1".into(),
        org_id: "org".into(),
        label: "prod".into(),
        app_name: "http".into(),
        active: true,
        auth_type: "apikey".into(),
        encrypted: false,
        fields: Json(vec![AuthFieldRow { key: "apikey".into(), value: secret.into() }]),
        created: 1_700_000_000,
    };
    seal_record(h.executor.config(), &mut record).unwrap();
    h.store.set_app_auth(record).await.unwrap();
}

async fn raw_body(h: &Harness, id: Uuid) -> String {
    h.store.get_execution(id).await.unwrap().body.to_string()
}

#[tokio::test]
async fn credentials_reach_the_worker_but_never_the_store() {
    let h = harness();
    seal_apikey(&h, "TOPSECRET").await;
    let mut wf = workflow(&["A", "B"], &[("A", "B")]);
    wf.actions[0].authentication_id = "auth-1".into();

    let exec = start(&h, wf, ExecutionRequest::default()).await;
    assert!(!raw_body(&h, exec.execution_id).await.contains("TOPSECRET"));

    let sent = h.dispatcher.last_sent(exec.execution_id, "A");
    assert_eq!(sent.parameter("apikey"), Some("TOPSECRET"));

    // Workers echo the action they ran, credentials included.
    let echoed = ActionResult::new(&exec, sent, ActionStatus::Success, "{}");
    ingest(&h, echoed).await;

    assert!(!raw_body(&h, exec.execution_id).await.contains("TOPSECRET"));
    let cached = h.store.get_cache(&result_cache_key(&exec.execution_id, "A")).await.unwrap().unwrap();
    assert!(!cached.contains("TOPSECRET"));
}

#[tokio::test]
async fn completed_execution_keeps_no_credential_values() {
    let h = harness();
    seal_apikey(&h, "TOPSECRET").await;
    let mut wf = workflow(&["A"], &[]);
    wf.actions[0].authentication_id = "auth-1".into();

    let exec = start(&h, wf, ExecutionRequest::default()).await;
    let sent = h.dispatcher.last_sent(exec.execution_id, "A");
    let done = ingest(&h, ActionResult::new(&exec, sent, ActionStatus::Success, "{}")).await;
    assert_eq!(done.status, ExecutionStatus::Finished);

    let stored = load(&h, exec.execution_id).await;
    let param = stored
        .result_for("A")
        .unwrap()
        .action
        .parameters
        .iter()
        .find(|p| p.name == "apikey")
        .cloned()
        .unwrap();
    assert!(param.configuration);
    assert!(param.value.is_empty());
    assert!(!raw_body(&h, exec.execution_id).await.contains("TOPSECRET"));
}

// ---------------------------------------------------------------------------
// Compression
// ---------------------------------------------------------------------------

#[tokio::test]
async fn oversized_argument_is_stored_as_a_stub() {
    let h = harness();
    let big = "a".repeat(2_000_000);
    let request = ExecutionRequest { execution_argument: big.clone(), ..Default::default() };
    let exec = start(&h, workflow(&["A"], &[]), request).await;

    let stored = load(&h, exec.execution_id).await;
    let stub = stored.execution_argument.parse().unwrap();
    assert_eq!(stub["extra"], "replace");
    assert!(serde_json::to_vec(&stored).unwrap().len() < 1_000_000);

    let full = h.executor.get_execution(exec.execution_id, &exec.authorization).await.unwrap();
    assert_eq!(full.execution_argument.text(), big);
}
