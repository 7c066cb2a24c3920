//! Turns a workflow definition plus trigger context into a ready execution.
//!
//! Preparation also handles resuming an execution parked on a user-input
//! node: the caller passes `reference_execution` + `authorization` and the
//! answer becomes that node's result.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use db::Store;

use crate::auth::{AuthResolver, TokenRefresher};
use crate::compression::CompressionGuard;
use crate::graph::{validate_workflow, GraphIndex};
use crate::models::{
    set_parameter, ActionResult, ActionStatus, ExecutionStatus, Parameter, ResultBody, Trigger, Workflow,
    WorkflowExecution,
};
use crate::persist;
use crate::{EngineConfig, EngineError};

/// Trigger context for a new or resumed execution.
///
/// Field names match the query parameters of the execute endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExecutionRequest {
    /// Explicit start node; overrides the workflow's own.
    pub start: Option<String>,
    pub execution_argument: String,
    pub execution_source: String,
    /// Pre-assigned id, used by parents that start children.
    pub execution_id: Option<Uuid>,
    /// Execution to resume.
    pub reference_execution: Option<Uuid>,
    pub authorization: Option<String>,
    /// User-input answer; `"false"` declines.
    pub answer: Option<String>,
    /// Node being answered.
    pub node: Option<String>,
    pub source_execution: Option<Uuid>,
    pub source_node: Option<String>,
    pub source_auth: Option<String>,
    pub source_workflow: Option<Uuid>,
    pub priority: i32,
}

/// What the dispatch layer needs to know to place the work.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecInfo {
    pub environments: Vec<String>,
    pub cloud: bool,
    pub onprem: bool,
    pub image_names: Vec<String>,
}

#[derive(Debug)]
pub enum Preparation {
    Ready { execution: WorkflowExecution, info: ExecInfo },
    /// A parked execution was resumed; `answer` still has to be processed.
    Resumed { execution: WorkflowExecution, answer: ActionResult },
    /// This child was already started for the same parent node.
    AlreadyExecuted,
}

pub struct ExecutionPreparer {
    store: Arc<dyn Store>,
    config: Arc<EngineConfig>,
    auth: AuthResolver,
    guard: CompressionGuard,
}

impl ExecutionPreparer {
    pub fn new(store: Arc<dyn Store>, config: Arc<EngineConfig>, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            auth: AuthResolver::new(store.clone(), config.clone(), refresher),
            guard: CompressionGuard::new(&config),
            store,
            config,
        }
    }

    /// Prepare and persist a new execution, or resume a parked one.
    ///
    /// # Errors
    /// `StartNodeNotFound`, `Validation` (saved workflows only),
    /// `EnvironmentResolution`, `NoActiveEnvironmentForOrg` and
    /// `MaxExecutionDepthExceeded` for new executions; `Unauthorized` and
    /// `InvalidState` when resuming.
    #[instrument(skip_all, fields(workflow_id = %workflow.id))]
    pub async fn prepare(&self, workflow: Workflow, request: ExecutionRequest) -> Result<Preparation, EngineError> {
        if let Some(reference) = request.reference_execution {
            return self.resume(reference, &request).await;
        }

        let execution_id = request.execution_id.unwrap_or_else(Uuid::new_v4);

        // ------------------------------------------------------------------
        // Subflow depth and dedup.
        // ------------------------------------------------------------------
        let mut depth = 0;
        let mut dedup_key = None;
        if let Some(parent_id) = request.source_execution {
            let parent = persist::load_execution(&*self.store, parent_id).await?;
            depth = parent.sub_execution_count + 1;
            if depth > self.config.max_execution_depth {
                return Err(EngineError::MaxExecutionDepthExceeded { depth, max: self.config.max_execution_depth });
            }

            let node = request.source_node.clone().unwrap_or_default();
            let looping = parent.workflow.trigger(&node).is_some_and(Trigger::is_looping);
            if !looping {
                let key = format!("{parent_id}_{execution_id}_{node}_subflow");
                if self.store.get_cache(&key).await?.is_some() {
                    info!(parent = %parent_id, %execution_id, "Subflow already started; ignoring");
                    return Ok(Preparation::AlreadyExecuted);
                }
                dedup_key = Some(key);
            }
        }

        // ------------------------------------------------------------------
        // Graph validation. Lenient until the workflow has been saved once.
        // ------------------------------------------------------------------
        let mut workflow = workflow;
        let problems = validate_workflow(&workflow);
        if !problems.is_empty() {
            if workflow.previously_saved {
                return Err(EngineError::Validation(problems.join("; ")));
            }
            warn!(problems = problems.len(), "Unsaved workflow has broken branches; pruning them");
            let known: HashSet<String> = workflow
                .actions
                .iter()
                .map(|a| a.id.clone())
                .chain(workflow.triggers.iter().map(|t| t.id.clone()))
                .collect();
            workflow
                .branches
                .retain(|b| known.contains(&b.source_id) && known.contains(&b.destination_id));
            workflow.errors.extend(problems);
        }

        let start = resolve_start(&workflow, request.start.as_deref())?;
        workflow.start = start.clone();
        for action in &mut workflow.actions {
            action.is_start_node = action.id == start;
        }

        let info = self.resolve_environments(&mut workflow).await?;
        self.check_credentials(&mut workflow).await;

        let authorization = Uuid::new_v4().to_string();
        link_triggers(&mut workflow, &self.config, execution_id, &authorization);

        let mut execution = WorkflowExecution {
            execution_id,
            workflow_id: workflow.id,
            org_id: workflow.org_id.clone(),
            execution_variables: workflow.execution_variables.clone(),
            workflow,
            status: ExecutionStatus::Executing,
            start: start.clone(),
            execution_argument: ResultBody::Raw(request.execution_argument),
            execution_source: request.execution_source,
            results: Vec::new(),
            execution_parent: request.source_execution,
            execution_source_node: request.source_node.unwrap_or_default(),
            execution_source_auth: request.source_auth.unwrap_or_default(),
            authorization,
            priority: request.priority,
            sub_execution_count: depth,
            result: String::new(),
            last_node: String::new(),
            started_at: Utc::now(),
            completed_at: None,
            version: 0,
        };

        if !execution.workflow.configuration.start_from_top {
            seed_unreachable_skips(&mut execution);
        }

        persist::save_execution(&*self.store, &self.guard, &mut execution).await?;
        if let Some(key) = dedup_key {
            self.store.set_cache(&key, "1".to_owned(), self.config.subflow_dedup_ttl).await?;
        }

        info!(
            execution_id = %execution.execution_id,
            start = %execution.start,
            skipped = execution.results.len(),
            "Execution prepared"
        );
        Ok(Preparation::Ready { execution, info })
    }

    async fn resume(&self, reference: Uuid, request: &ExecutionRequest) -> Result<Preparation, EngineError> {
        let authorization = request.authorization.as_deref().unwrap_or_default();
        let mut execution = persist::load_authorized(&*self.store, reference, authorization).await?;

        if execution.status != ExecutionStatus::Waiting {
            return Err(EngineError::InvalidState { id: reference, status: execution.status.to_string() });
        }
        let waiting = execution
            .results
            .iter()
            .find(|r| {
                r.status == ActionStatus::Waiting
                    && match request.node.as_deref() {
                        Some(node) => node == r.action.id,
                        // Looping subflows wait too; only a question takes an answer.
                        None => r.action.is_user_input(),
                    }
            })
            .cloned()
            .ok_or_else(|| EngineError::InvalidState {
                id: reference,
                status: "not waiting on the given node".to_owned(),
            })?;

        let answer = request.answer.clone().unwrap_or_default();
        let declined = answer.eq_ignore_ascii_case("false");
        let status = if declined { ActionStatus::Aborted } else { ActionStatus::Success };

        execution.status = ExecutionStatus::Executing;
        persist::save_execution(&*self.store, &self.guard, &mut execution).await?;

        let body = json!({ "success": !declined, "answer": answer });
        let result = ActionResult::new(&execution, waiting.action, status, body);
        info!(execution_id = %reference, node_id = %result.action.id, %status, "Resuming execution");
        Ok(Preparation::Resumed { execution, answer: result })
    }

    /// Pin every node to an active environment of the org.
    async fn resolve_environments(&self, workflow: &mut Workflow) -> Result<ExecInfo, EngineError> {
        let environments = self
            .store
            .get_environments(&workflow.org_id)
            .await
            .map_err(|e| EngineError::EnvironmentResolution(e.to_string()))?;
        let active: Vec<_> = environments.iter().filter(|e| !e.archived).collect();
        let default = active
            .iter()
            .find(|e| e.is_default)
            .or_else(|| active.first())
            .ok_or_else(|| EngineError::NoActiveEnvironmentForOrg(workflow.org_id.clone()))?;

        let pin = |node_id: &str, environment: &mut String| {
            if active.iter().any(|e| e.name == *environment) {
                return;
            }
            if !environment.is_empty() {
                warn!(node_id, environment = %environment, fallback = %default.name, "Unknown environment; using org default");
            }
            *environment = default.name.clone();
        };
        for action in &mut workflow.actions {
            pin(&action.id, &mut action.environment);
        }
        for trigger in workflow.triggers.iter_mut().filter(|t| t.is_subflow() || t.is_user_input()) {
            pin(&trigger.id, &mut trigger.environment);
        }

        let mut info = ExecInfo::default();
        for action in &workflow.actions {
            if !info.environments.contains(&action.environment) {
                info.environments.push(action.environment.clone());
            }
            let image = format!("{}:{}", action.app_name.to_lowercase().replace(' ', "-"), action.app_version);
            if !action.app_name.is_empty() && !info.image_names.contains(&image) {
                info.image_names.push(image);
            }
        }
        for name in &info.environments {
            match active.iter().find(|e| e.name == *name).map(|e| e.env_type.as_str()) {
                Some("cloud") => info.cloud = true,
                Some(_) => info.onprem = true,
                None => {}
            }
        }
        Ok(info)
    }

    /// Make sure every referenced credential resolves. Values are only
    /// injected at dispatch time; failures mark the action invalid but
    /// never abort.
    async fn check_credentials(&self, workflow: &mut Workflow) {
        let org_id = workflow.org_id.clone();
        for action in &mut workflow.actions {
            let mut resolved = action.clone();
            if let Err(failure) = self.auth.resolve(&org_id, &mut resolved).await {
                warn!(action_id = %action.id, error = %failure, "Credential resolution failed");
                let message = failure.to_string();
                action.is_valid = false;
                action.errors.push(message.clone());
                workflow.errors.push(format!("{}: {message}", action.id));
            }
        }
    }
}

/// Explicit start if it exists, else the configured start action, else the
/// first flagged start node.
pub fn resolve_start(workflow: &Workflow, requested: Option<&str>) -> Result<String, EngineError> {
    if let Some(start) = requested.filter(|s| !s.is_empty()) {
        return if workflow.has_node(start) {
            Ok(start.to_owned())
        } else {
            Err(EngineError::StartNodeNotFound(start.to_owned()))
        };
    }
    if workflow.action(&workflow.start).is_some() {
        return Ok(workflow.start.clone());
    }
    workflow
        .actions
        .iter()
        .find(|a| a.is_start_node)
        .map(|a| a.id.clone())
        .ok_or_else(|| EngineError::StartNodeNotFound(workflow.start.clone()))
}

/// Give subflow and user-input triggers what their pseudo-actions need.
fn link_triggers(workflow: &mut Workflow, config: &EngineConfig, execution_id: Uuid, authorization: &str) {
    let workflow_id = workflow.id;
    let backend = config.backend_url.trim_end_matches('/');

    for trigger in &mut workflow.triggers {
        let linkage: Vec<(&str, String)> = if trigger.is_subflow() {
            vec![
                ("source_workflow", workflow_id.to_string()),
                ("source_execution", execution_id.to_string()),
                ("source_node", trigger.id.clone()),
                ("source_auth", authorization.to_owned()),
                ("callback_url", backend.to_owned()),
            ]
        } else if trigger.is_user_input() {
            vec![
                ("source_execution", execution_id.to_string()),
                ("source_auth", authorization.to_owned()),
                (
                    "resume_url",
                    format!(
                        "{backend}/api/v1/workflows/{workflow_id}/execute?reference_execution={execution_id}&authorization={authorization}&node={}",
                        trigger.id
                    ),
                ),
            ]
        } else {
            continue;
        };

        for (name, value) in linkage {
            set_parameter(&mut trigger.parameters, Parameter::new(name, value));
        }
    }
}

/// Pre-skip every graph node the start node can't reach.
fn seed_unreachable_skips(execution: &mut WorkflowExecution) {
    let index = GraphIndex::build(&execution.workflow);
    let mut reachable: HashSet<String> = index.find_child_nodes(&execution.start).into_iter().collect();
    reachable.insert(execution.start.clone());

    let skipped: Vec<ActionResult> = index
        .nodes()
        .iter()
        .filter(|node| !reachable.contains(*node))
        .filter_map(|node| execution.workflow.node_action(node))
        .map(|action| {
            ActionResult::new(
                execution,
                action,
                ActionStatus::Skipped,
                json!({ "success": false, "reason": "not reachable from the start node" }),
            )
        })
        .collect();

    if !skipped.is_empty() {
        debug!(count = skipped.len(), "Seeded skips for unreachable nodes");
    }
    execution.results.extend(skipped);
}
