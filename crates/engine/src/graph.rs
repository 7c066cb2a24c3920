//! Graph index over a workflow's branches.
//!
//! Unlike a plain DAG, a workflow graph may contain cycles (loop
//! constructs), so every traversal here is guarded by a visited-branch set
//! instead of relying on a topological order.
//!
//! The index is cheap to build and is rebuilt from the execution's workflow
//! snapshot on every scheduling cycle.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::models::{ActionStatus, Branch, TriggerType, Workflow, WorkflowExecution};

/// What an index entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Action,
    Trigger(TriggerType),
}

/// Aggregate state of a node's incoming branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentState {
    /// The node has no (non-exempt) parents.
    NoParents,
    /// At least one parent hasn't produced a terminal result yet.
    Pending,
    /// Every parent is terminal and at least one succeeded.
    Ready,
    /// Every parent is terminal and none succeeded.
    Dead,
}

#[derive(Debug, Default, Clone)]
pub struct GraphIndex {
    kinds: HashMap<String, NodeKind>,
    parents: HashMap<String, Vec<String>>,
    children: HashMap<String, Vec<String>>,
    /// Graph nodes in definition order: actions first, then graph triggers.
    nodes: Vec<String>,
}

impl GraphIndex {
    /// Build parent/child adjacency from the workflow's branches.
    ///
    /// Branch endpoints that resolve to neither an action nor a trigger are
    /// ignored here; [`validate_workflow`] reports them.
    pub fn build(workflow: &Workflow) -> Self {
        let mut index = Self::default();

        for action in &workflow.actions {
            index.kinds.insert(action.id.clone(), NodeKind::Action);
            index.nodes.push(action.id.clone());
        }
        for trigger in &workflow.triggers {
            index
                .kinds
                .entry(trigger.id.clone())
                .or_insert(NodeKind::Trigger(trigger.trigger_type));
        }

        let mut seen: HashSet<(&str, &str)> = HashSet::new();
        for branch in &workflow.branches {
            let (src, dst) = (branch.source_id.as_str(), branch.destination_id.as_str());
            if !index.kinds.contains_key(src) || !index.kinds.contains_key(dst) {
                continue;
            }
            if !seen.insert((src, dst)) {
                continue;
            }
            index.children.entry(src.to_owned()).or_default().push(dst.to_owned());
            index.parents.entry(dst.to_owned()).or_default().push(src.to_owned());
        }

        // SUBFLOW / USERINPUT triggers wired into the graph count as nodes.
        for trigger in &workflow.triggers {
            let wired = index.parents.contains_key(&trigger.id)
                || index.children.contains_key(&trigger.id);
            let is_graph_node = trigger.trigger_type.is_graph_node()
                || trigger.is_subflow()
                || trigger.is_user_input();
            if wired && is_graph_node && !workflow.actions.iter().any(|a| a.id == trigger.id) {
                index.nodes.push(trigger.id.clone());
            }
        }

        index
    }

    pub fn kind(&self, id: &str) -> Option<NodeKind> {
        self.kinds.get(id).copied()
    }

    pub fn parents(&self, id: &str) -> &[String] {
        self.parents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn children(&self, id: &str) -> &[String] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every node that should eventually carry a result.
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.iter().any(|n| n == id)
    }

    /// Number of trigger nodes that take part in the graph.
    pub fn extra_trigger_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(self.kinds.get(*n), Some(NodeKind::Trigger(_))))
            .count()
    }

    /// All nodes reachable from `node_id`, deduplicated, in BFS order.
    ///
    /// `node_id` itself is included only if it is reachable through a cycle.
    pub fn find_child_nodes(&self, node_id: &str) -> Vec<String> {
        let mut visited_branches: HashSet<(&str, &str)> = HashSet::new();
        let mut found: HashSet<&str> = HashSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<&str> = VecDeque::from([node_id]);

        while let Some(current) = queue.pop_front() {
            for child in self.children(current) {
                if !visited_branches.insert((current, child.as_str())) {
                    continue;
                }
                if found.insert(child.as_str()) {
                    order.push(child.clone());
                }
                queue.push_back(child.as_str());
            }
        }

        order
    }

    /// Status lookup over `execution`'s results for [`Self::parent_state`].
    ///
    /// Triggers outside the graph (webhooks, schedules) have fired by the
    /// time anything below them runs, so they read as successful.
    pub fn status_lookup<'a>(
        &'a self,
        execution: &'a WorkflowExecution,
    ) -> impl Fn(&str) -> Option<ActionStatus> + 'a {
        move |id| {
            if self.contains(id) {
                execution.status_of(id)
            } else {
                Some(ActionStatus::Success)
            }
        }
    }

    /// A node that is its own descendant sits on a loop.
    pub fn is_own_descendant(&self, node_id: &str) -> bool {
        self.find_child_nodes(node_id).iter().any(|n| n == node_id)
    }

    /// Classify `node_id`'s incoming branches.
    ///
    /// With `exempt_cycles`, parents that are also descendants of the node
    /// (loop back-edges) are left out of the check, otherwise a loop node
    /// could never become ready.
    pub fn parent_state<F>(&self, node_id: &str, status_of: F, exempt_cycles: bool) -> ParentState
    where
        F: Fn(&str) -> Option<ActionStatus>,
    {
        let parents = self.parents(node_id);
        let descendants: HashSet<String> = if exempt_cycles && !parents.is_empty() {
            self.find_child_nodes(node_id).into_iter().collect()
        } else {
            HashSet::new()
        };

        let mut any_parent = false;
        let mut any_success = false;
        for parent in parents {
            if descendants.contains(parent) {
                continue;
            }
            any_parent = true;
            match status_of(parent) {
                Some(status) if status.is_terminal() => {
                    any_success |= status == ActionStatus::Success;
                }
                _ => return ParentState::Pending,
            }
        }

        match (any_parent, any_success) {
            (false, _) => ParentState::NoParents,
            (true, true) => ParentState::Ready,
            (true, false) => ParentState::Dead,
        }
    }
}

/// Reachable set of `node_id` over a raw branch list.
pub fn find_child_nodes(workflow: &Workflow, node_id: &str) -> Vec<String> {
    GraphIndex::build(workflow).find_child_nodes(node_id)
}

/// Report every branch whose endpoint is neither an action nor a trigger.
pub fn validate_workflow(workflow: &Workflow) -> Vec<String> {
    let mut problems = Vec::new();
    for branch in &workflow.branches {
        for (side, id) in [("source", &branch.source_id), ("destination", &branch.destination_id)] {
            if !workflow.has_node(id) {
                problems.push(format!("branch {} references unknown {side} node '{id}'", describe(branch)));
            }
        }
    }
    problems
}

fn describe(branch: &Branch) -> String {
    if branch.id.is_empty() {
        format!("{}->{}", branch.source_id, branch.destination_id)
    } else {
        branch.id.clone()
    }
}
