//! Task graph nodes
//!
//! Nodes are keyed `task.key + ":" + node_type` and live only for the
//! duration of a solver run. A node's result is write-once: the first
//! completion wins and later writes are no-ops.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::action::{ActionStatus, ExecutedAction, ResolvedAction};
use crate::error::TrellisError;

use super::GraphTask;

/// The three execution types a node can have
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    /// Per-submission wrapper delivering one result to the requester
    Request,
    /// Queries current state; idempotent, side-effect-free expected
    Status,
    /// Performs the action
    Process,
}

impl NodeType {
    pub fn key_part(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Status => "status",
            Self::Process => "process",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key_part())
    }
}

/// Typed output of a completed node
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutput {
    Null,
    Resolved(Arc<ResolvedAction>),
    Executed(Arc<ExecutedAction>),
    Status(ActionStatus),
}

impl NodeOutput {
    pub fn as_resolved(&self) -> Option<&Arc<ResolvedAction>> {
        match self {
            Self::Resolved(action) => Some(action),
            _ => None,
        }
    }

    pub fn as_executed(&self) -> Option<&Arc<ExecutedAction>> {
        match self {
            Self::Executed(action) => Some(action),
            _ => None,
        }
    }

    pub fn as_status(&self) -> Option<&ActionStatus> {
        match self {
            Self::Status(status) => Some(status),
            _ => None,
        }
    }

    /// JSON rendering for result summaries
    pub fn to_value(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Resolved(action) => serde_json::json!({
                "kind": "resolved",
                "key": action.key(),
                "version": action.version_string(),
            }),
            Self::Executed(action) => serde_json::json!({
                "kind": "executed",
                "key": action.key(),
                "state": action.state.to_string(),
                "outputs": action.outputs,
            }),
            Self::Status(status) => serde_json::json!({
                "kind": "status",
                "state": status.state.to_string(),
                "outputs": status.outputs,
            }),
        }
    }
}

/// Immutable record of a completed node. Once set on a node it is never
/// replaced.
#[derive(Debug, Clone)]
pub struct GraphResult {
    pub node_key: Arc<str>,
    pub started_at: Option<Instant>,
    pub completed_at: Instant,
    pub output: Option<NodeOutput>,
    pub error: Option<Arc<TrellisError>>,
    pub aborted: bool,
    pub dependency_keys: Vec<Arc<str>>,
}

impl GraphResult {
    pub fn success(&self) -> bool {
        !self.aborted && self.error.is_none()
    }
}

/// Results of a node's dependencies, passed to its handler.
/// A dependant never observes a partial dependency result.
#[derive(Default, Clone)]
pub struct DependencyResults {
    results: FxHashMap<Arc<str>, Arc<GraphResult>>,
}

impl DependencyResults {
    pub fn new(results: FxHashMap<Arc<str>, Arc<GraphResult>>) -> Self {
        Self { results }
    }

    pub fn get(&self, node_key: &str) -> Option<&Arc<GraphResult>> {
        self.results.get(node_key)
    }

    /// Output of the node for `task_key` (any execution type)
    pub fn output_for(&self, task_key: &str) -> Option<&NodeOutput> {
        self.results.iter().find_map(|(key, result)| {
            let matches = key
                .rsplit_once(':')
                .is_some_and(|(task_part, _)| task_part == task_key);
            if matches {
                result.output.as_ref()
            } else {
                None
            }
        })
    }

    /// First resolved action with the given action key
    pub fn resolved_action(&self, action_key: &str) -> Option<&Arc<ResolvedAction>> {
        self.results.values().find_map(|result| {
            result
                .output
                .as_ref()
                .and_then(NodeOutput::as_resolved)
                .filter(|action| action.key() == action_key)
        })
    }

    /// First executed action with the given action key
    pub fn executed_action(&self, action_key: &str) -> Option<&Arc<ExecutedAction>> {
        self.results.values().find_map(|result| {
            result
                .output
                .as_ref()
                .and_then(NodeOutput::as_executed)
                .filter(|action| action.key() == action_key)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Arc<str>, &Arc<GraphResult>)> {
        self.results.iter()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// A node in the task graph
pub struct TaskNode {
    pub key: Arc<str>,
    pub node_type: NodeType,
    pub task: Arc<dyn GraphTask>,
    status_only: AtomicBool,
    dependants: Mutex<FxHashMap<Arc<str>, Arc<TaskNode>>>,
    result: Mutex<Option<Arc<GraphResult>>>,
    started_at: Mutex<Option<Instant>>,
}

impl TaskNode {
    pub fn new(key: Arc<str>, node_type: NodeType, task: Arc<dyn GraphTask>, status_only: bool) -> Self {
        Self {
            key,
            node_type,
            task,
            status_only: AtomicBool::new(status_only),
            dependants: Mutex::new(FxHashMap::default()),
            result: Mutex::new(None),
            started_at: Mutex::new(None),
        }
    }

    pub fn status_only(&self) -> bool {
        self.status_only.load(Ordering::SeqCst)
    }

    /// A later non-statusOnly reference widens the node's dependency set;
    /// the stricter requirement wins.
    pub fn clear_status_only(&self) {
        self.status_only.store(false, Ordering::SeqCst);
    }

    pub fn result(&self) -> Option<Arc<GraphResult>> {
        self.result.lock().clone()
    }

    pub fn mark_started(&self) -> Instant {
        let now = Instant::now();
        *self.started_at.lock() = Some(now);
        now
    }

    pub fn started_at(&self) -> Option<Instant> {
        *self.started_at.lock()
    }

    /// Write-once completion: returns true when this call installed the
    /// result, false when a result was already present.
    pub fn complete(&self, result: GraphResult) -> bool {
        let mut slot = self.result.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(Arc::new(result));
        true
    }

    pub fn add_dependant(&self, node: &Arc<TaskNode>) {
        self.dependants
            .lock()
            .insert(Arc::clone(&node.key), Arc::clone(node));
    }

    pub fn dependants(&self) -> Vec<Arc<TaskNode>> {
        self.dependants.lock().values().cloned().collect()
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("key", &self.key)
            .field("node_type", &self.node_type)
            .field("completed", &self.result.lock().is_some())
            .finish()
    }
}
