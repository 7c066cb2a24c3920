//! Core domain models for the execution engine.
//!
//! These types are the source of truth for what a workflow and a running
//! execution look like in memory. They serialise to the JSON documents
//! stored in the `workflows` and `workflow_executions` tables and to the
//! wire shape exchanged with workers.

use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

/// App name of the pseudo-action that starts a child execution.
pub const SUBFLOW_APP: &str = "shuffle-subflow";
/// Display name some editors give the subflow trigger.
pub const SUBFLOW_TRIGGER_APP: &str = "Shuffle Workflow";
pub const RUN_SUBFLOW: &str = "run_subflow";
pub const USERINPUT_APP: &str = "User Input";
pub const RUN_USERINPUT: &str = "run_userinput";

/// Marker inside a subflow argument that expands a list into one child
/// execution per element.
pub const LOOP_MARKER: &str = ".#";

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Status of a single node result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Executing,
    Waiting,
    Success,
    Failure,
    Aborted,
    Skipped,
}

impl ActionStatus {
    /// A terminal result will never be replaced by a non-terminal one.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Executing | Self::Waiting)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failure | Self::Aborted)
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Executing => "EXECUTING",
            Self::Waiting   => "WAITING",
            Self::Success   => "SUCCESS",
            Self::Failure   => "FAILURE",
            Self::Aborted   => "ABORTED",
            Self::Skipped   => "SKIPPED",
        };
        f.write_str(s)
    }
}

/// Status of a whole execution. Moves only toward a terminal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Executing,
    Waiting,
    Finished,
    Aborted,
    Failure,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Aborted | Self::Failure)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Executing => "EXECUTING",
            Self::Waiting   => "WAITING",
            Self::Finished  => "FINISHED",
            Self::Aborted   => "ABORTED",
            Self::Failure   => "FAILURE",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ResultBody
// ---------------------------------------------------------------------------

/// The opaque payload of a result or an execution argument.
///
/// Stored and transmitted as a string, but callers that already hold a
/// parsed value keep it structured until it has to be written out. Parsing
/// of raw text is lazy: only the code that needs to look inside does so.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultBody {
    Raw(String),
    Structured(Value),
}

impl Default for ResultBody {
    fn default() -> Self {
        Self::Raw(String::new())
    }
}

impl ResultBody {
    pub fn text(&self) -> Cow<'_, str> {
        match self {
            Self::Raw(s) => Cow::Borrowed(s.as_str()),
            Self::Structured(v) => Cow::Owned(v.to_string()),
        }
    }

    /// Parse the body as JSON. Returns `None` for plain text.
    pub fn parse(&self) -> Option<Value> {
        match self {
            Self::Raw(s) => serde_json::from_str(s.trim()).ok(),
            Self::Structured(v) => Some(v.clone()),
        }
    }

    /// Length of the serialized text in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Raw(s) => s.len(),
            Self::Structured(v) => v.to_string().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` for a body shaped like `{"success": false, ...}`.
    ///
    /// Apps report soft failures this way while still returning SUCCESS.
    pub fn reports_failure(&self) -> bool {
        matches!(
            self.parse(),
            Some(Value::Object(map)) if map.get("success") == Some(&Value::Bool(false))
        )
    }

    /// Strip bytes that break downstream JSON consumers.
    ///
    /// Control characters (other than whitespace) are removed from raw text.
    /// Text that looks like JSON but doesn't parse is kept as raw text after
    /// a trailing-comma repair attempt.
    pub fn sanitized(self) -> Self {
        let raw = match self {
            Self::Raw(raw) => raw,
            structured => return structured,
        };

        let cleaned: String = raw
            .chars()
            .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
            .collect();

        let trimmed = cleaned.trim();
        let looks_like_json = trimmed.starts_with('{') || trimmed.starts_with('[');
        if looks_like_json && serde_json::from_str::<Value>(trimmed).is_err() {
            let repaired = trimmed.replace(",}", "}").replace(",]", "]");
            if serde_json::from_str::<Value>(&repaired).is_ok() {
                return Self::Raw(repaired);
            }
        }

        Self::Raw(cleaned)
    }
}

impl From<&str> for ResultBody {
    fn from(s: &str) -> Self {
        Self::Raw(s.to_owned())
    }
}

impl From<String> for ResultBody {
    fn from(s: String) -> Self {
        Self::Raw(s)
    }
}

impl From<Value> for ResultBody {
    fn from(v: Value) -> Self {
        Self::Structured(v)
    }
}

impl Serialize for ResultBody {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text())
    }
}

impl<'de> Deserialize<'de> for ResultBody {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(s) => Self::Raw(s),
            Value::Null => Self::default(),
            other => Self::Structured(other),
        })
    }
}

// ---------------------------------------------------------------------------
// Workflow definition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(default)]
    pub value: String,
    /// Set for values injected from a credential; never persisted.
    #[serde(default)]
    pub configuration: bool,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into(), configuration: false }
    }
}

/// Insert or overwrite a parameter by name.
pub fn set_parameter(params: &mut Vec<Parameter>, param: Parameter) {
    match params.iter_mut().find(|p| p.name == param.name) {
        Some(existing) => *existing = param,
        None => params.push(param),
    }
}

pub fn get_parameter<'a>(params: &'a [Parameter], name: &str) -> Option<&'a str> {
    params.iter().find(|p| p.name == name).map(|p| p.value.as_str())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// One app-invocation node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    #[serde(default)]
    pub label: String,
    /// Function of the app to invoke.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub app_version: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub authentication_id: String,
    #[serde(default)]
    pub is_start_node: bool,
    /// Execution-scoped variable bound to this node's successful output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_variable: Option<Variable>,
    #[serde(default = "default_true")]
    pub is_valid: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl Default for Action {
    fn default() -> Self {
        Self {
            id: String::new(),
            label: String::new(),
            name: String::new(),
            app_name: String::new(),
            app_version: String::new(),
            app_id: String::new(),
            parameters: Vec::new(),
            environment: String::new(),
            authentication_id: String::new(),
            is_start_node: false,
            execution_variable: None,
            is_valid: true,
            errors: Vec::new(),
        }
    }
}

impl Action {
    /// Blank the values of credential-injected parameters.
    pub fn scrub_sensitive(&mut self) {
        for p in self.parameters.iter_mut().filter(|p| p.configuration) {
            p.value.clear();
        }
    }

    pub fn is_subflow(&self) -> bool {
        self.name == RUN_SUBFLOW || self.app_name == SUBFLOW_APP
    }

    pub fn is_user_input(&self) -> bool {
        self.name == RUN_USERINPUT || self.app_name == USERINPUT_APP
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        get_parameter(&self.parameters, name)
    }

    /// Subflow pseudo-actions flagged to wait for the child's real result.
    pub fn checks_result(&self) -> bool {
        self.parameter("check_result")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerType {
    #[serde(rename = "WEBHOOK")]
    Webhook,
    #[serde(rename = "SCHEDULE")]
    Schedule,
    #[serde(rename = "SUBFLOW")]
    Subflow,
    #[serde(rename = "USERINPUT")]
    UserInput,
    #[serde(other)]
    Other,
}

impl TriggerType {
    /// Trigger kinds that take part in the graph like an action would.
    pub fn is_graph_node(self) -> bool {
        matches!(self, Self::Subflow | Self::UserInput)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub name: String,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub is_start_node: bool,
}

impl Trigger {
    /// `SUBFLOW` triggers, including editors that only set the app name.
    pub fn is_subflow(&self) -> bool {
        self.trigger_type == TriggerType::Subflow || self.app_name == SUBFLOW_TRIGGER_APP
    }

    pub fn is_user_input(&self) -> bool {
        self.trigger_type == TriggerType::UserInput || self.app_name == USERINPUT_APP
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        get_parameter(&self.parameters, name)
    }

    /// Whether this subflow trigger fans out over a list.
    pub fn is_looping(&self) -> bool {
        self.parameter("argument").is_some_and(|a| a.contains(LOOP_MARKER))
    }

    /// Translate a SUBFLOW/USERINPUT trigger into the action a worker runs.
    pub fn to_pseudo_action(&self) -> Action {
        let (app_name, name) = if self.is_user_input() {
            (USERINPUT_APP, RUN_USERINPUT)
        } else {
            (SUBFLOW_APP, RUN_SUBFLOW)
        };

        Action {
            id: self.id.clone(),
            label: self.label.clone(),
            name: name.to_owned(),
            app_name: app_name.to_owned(),
            app_version: "1.0.0".to_owned(),
            parameters: self.parameters.clone(),
            environment: self.environment.clone(),
            is_start_node: self.is_start_node,
            ..Default::default()
        }
    }
}

/// Directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    #[serde(default)]
    pub id: String,
    pub source_id: String,
    pub destination_id: String,
}

impl Branch {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self { id: String::new(), source_id: source.into(), destination_id: destination.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfiguration {
    /// Abort the whole execution on the first failing node.
    #[serde(default)]
    pub exit_on_error: bool,
    /// Don't pre-skip nodes unreachable from the start node.
    #[serde(default)]
    pub start_from_top: bool,
    #[serde(default)]
    pub skip_notifications: bool,
}

/// A complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub org_id: String,
    #[serde(default)]
    pub start: String,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub branches: Vec<Branch>,
    #[serde(default)]
    pub workflow_variables: Vec<Variable>,
    #[serde(default)]
    pub execution_variables: Vec<Variable>,
    #[serde(default)]
    pub configuration: WorkflowConfiguration,
    #[serde(default)]
    pub default_return_value: String,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Set once the definition has been saved at least once. Validation is
    /// lenient before that.
    #[serde(default)]
    pub previously_saved: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    /// Convenience constructor for testing.
    pub fn new(
        name: impl Into<String>,
        org_id: impl Into<String>,
        actions: Vec<Action>,
        branches: Vec<Branch>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            org_id: org_id.into(),
            start: String::new(),
            actions,
            triggers: Vec::new(),
            branches,
            workflow_variables: Vec::new(),
            execution_variables: Vec::new(),
            configuration: WorkflowConfiguration::default(),
            default_return_value: String::new(),
            errors: Vec::new(),
            previously_saved: false,
            created_at: Utc::now(),
        }
    }

    pub fn action(&self, id: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.id == id)
    }

    pub fn trigger(&self, id: &str) -> Option<&Trigger> {
        self.triggers.iter().find(|t| t.id == id)
    }

    pub fn has_node(&self, id: &str) -> bool {
        self.action(id).is_some() || self.trigger(id).is_some()
    }

    /// The action a worker runs for node `id`, translating triggers.
    pub fn node_action(&self, id: &str) -> Option<Action> {
        self.action(id)
            .cloned()
            .or_else(|| self.trigger(id).map(Trigger::to_pseudo_action))
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Outcome of one node within one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub action: Action,
    #[serde(default)]
    pub execution_id: Uuid,
    #[serde(default)]
    pub authorization: String,
    pub status: ActionStatus,
    #[serde(default)]
    pub result: ResultBody,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ActionResult {
    pub fn new(
        execution: &WorkflowExecution,
        action: Action,
        status: ActionStatus,
        result: impl Into<ResultBody>,
    ) -> Self {
        let now = Utc::now();
        Self {
            action,
            execution_id: execution.execution_id,
            authorization: execution.authorization.clone(),
            status,
            result: result.into(),
            started_at: Some(now),
            completed_at: status.is_terminal().then_some(now),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.action.id
    }
}

/// One run instance of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    #[serde(default)]
    pub org_id: String,
    pub workflow: Workflow,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub start: String,
    #[serde(default)]
    pub execution_argument: ResultBody,
    #[serde(default)]
    pub execution_source: String,
    #[serde(default)]
    pub results: Vec<ActionResult>,
    #[serde(default)]
    pub execution_variables: Vec<Variable>,
    #[serde(default)]
    pub execution_parent: Option<Uuid>,
    #[serde(default)]
    pub execution_source_node: String,
    #[serde(default)]
    pub execution_source_auth: String,
    #[serde(default)]
    pub authorization: String,
    #[serde(default)]
    pub priority: i32,
    /// Subflow nesting depth: 0 for a top-level execution.
    #[serde(default)]
    pub sub_execution_count: u32,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub last_node: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Store version this snapshot was read at. Not part of the document.
    #[serde(skip)]
    pub version: i64,
}

impl WorkflowExecution {
    pub fn result_for(&self, node_id: &str) -> Option<&ActionResult> {
        self.results.iter().find(|r| r.action.id == node_id)
    }

    pub fn status_of(&self, node_id: &str) -> Option<ActionStatus> {
        self.result_for(node_id).map(|r| r.status)
    }

    /// Overwrite the result for the same node or append a new one.
    pub fn upsert_result(&mut self, result: ActionResult) {
        match self.results.iter_mut().find(|r| r.action.id == result.action.id) {
            Some(existing) => *existing = result,
            None => self.results.push(result),
        }
    }

    /// Insert or overwrite an execution-scoped variable.
    pub fn set_variable(&mut self, name: &str, value: String) {
        match self.execution_variables.iter_mut().find(|v| v.name == name) {
            Some(existing) => existing.value = value,
            None => self.execution_variables.push(Variable { name: name.to_owned(), value }),
        }
    }

    pub fn remove_result(&mut self, node_id: &str) -> bool {
        let before = self.results.len();
        self.results.retain(|r| r.action.id != node_id);
        before != self.results.len()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Blank every credential-injected parameter value.
    pub fn scrub_sensitive(&mut self) {
        for action in &mut self.workflow.actions {
            action.scrub_sensitive();
        }
        for result in &mut self.results {
            result.action.scrub_sensitive();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn result_body_is_always_a_string_on_the_wire() {
        let structured = ResultBody::Structured(json!({"a": 1}));
        let encoded = serde_json::to_value(&structured).unwrap();
        assert_eq!(encoded, json!("{\"a\":1}"));

        let decoded: ResultBody = serde_json::from_value(json!({"a": 1})).unwrap();
        assert_eq!(decoded.parse(), Some(json!({"a": 1})));
    }

    #[test]
    fn success_false_body_is_detected() {
        assert!(ResultBody::from(r#"{"success": false, "reason": "x"}"#).reports_failure());
        assert!(!ResultBody::from(r#"{"success": true}"#).reports_failure());
        assert!(!ResultBody::from("plain text").reports_failure());
    }

    #[test]
    fn sanitize_strips_control_chars_and_repairs_trailing_commas() {
        let body = ResultBody::from("{\"a\": 1,}\u{0}").sanitized();
        assert_eq!(body.parse(), Some(json!({"a": 1})));

        let text = ResultBody::from("hello\u{7}\nworld").sanitized();
        assert_eq!(text.text(), "hello\nworld");
    }

    #[test]
    fn statuses_use_screaming_case() {
        assert_eq!(serde_json::to_value(ActionStatus::Skipped).unwrap(), json!("SKIPPED"));
        assert_eq!(
            serde_json::from_value::<ExecutionStatus>(json!("FINISHED")).unwrap(),
            ExecutionStatus::Finished
        );
        assert_eq!(
            serde_json::from_value::<TriggerType>(json!("USERINPUT")).unwrap(),
            TriggerType::UserInput
        );
    }
}
