//! Task graph solver
//!
//! Schedules heterogeneous status/process nodes with cross-node fan-out,
//! shared status→process transitions, failure propagation and bounded
//! concurrency.
//!
//! Nodes are created lazily on first reference and shared by key, so
//! dependants of the same task converge on one node. Results are
//! write-once; a failed or aborted node completes its transitive
//! dependants with synthetic aborted results whose failed-dependency
//! chain points back at the origin.

pub mod node;
#[cfg(test)]
pub mod testing;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{FailedDependency, Result, TrellisError};
use crate::event::{EventKind, EventLog};
use crate::util::{intern, GLOBAL_CONCURRENCY};

pub use node::{DependencyResults, GraphResult, NodeOutput, NodeType, TaskNode};

/// Task types known to the solver; execute kinds may carry a concurrency
/// cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    Resolve,
    Build,
    Deploy,
    Run,
    Test,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Resolve => "resolve",
            Self::Build => "build",
            Self::Deploy => "deploy",
            Self::Run => "run",
            Self::Test => "test",
        };
        f.write_str(name)
    }
}

/// A schedulable task. Implementations are shared `Arc`s; the solver
/// derives status/process/request nodes from them.
#[async_trait]
pub trait GraphTask: Send + Sync {
    /// Unique task key, e.g. `build.api` or `resolve.deploy.api`
    fn key(&self) -> Arc<str>;

    fn task_type(&self) -> TaskType;

    /// Per-task timeout, armed at dispatch
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Bypass the "status ready ⇒ skip process" optimization
    fn force(&self) -> bool {
        false
    }

    /// Cap on concurrently running nodes of this task's type
    fn concurrency_limit(&self) -> Option<usize> {
        None
    }

    /// Whether the task has a meaningful status phase. Resolve tasks
    /// don't; their process *is* resolution and always runs.
    fn has_status(&self) -> bool {
        true
    }

    /// Tasks whose completion the status phase requires
    fn status_dependencies(&self) -> Vec<Arc<dyn GraphTask>> {
        Vec::new()
    }

    /// Tasks whose completion the process phase requires, given the
    /// observed status. Recomputed after status completes, so the set may
    /// vary with the status.
    fn process_dependencies(&self, status: &NodeOutput) -> Vec<Arc<dyn GraphTask>>;

    async fn status(&self, deps: &DependencyResults) -> Result<NodeOutput>;

    async fn process(&self, status: NodeOutput, deps: &DependencyResults) -> Result<NodeOutput>;
}

/// One submission to the solver
pub struct SolveRequest {
    pub task: Arc<dyn GraphTask>,
    pub status_only: bool,
}

impl SolveRequest {
    pub fn new(task: Arc<dyn GraphTask>) -> Self {
        Self {
            task,
            status_only: false,
        }
    }

    pub fn status_only(task: Arc<dyn GraphTask>) -> Self {
        Self {
            task,
            status_only: true,
        }
    }
}

/// Result delivered for one request
#[derive(Clone)]
pub struct RequestResult {
    pub task_key: Arc<str>,
    pub result: Arc<GraphResult>,
}

/// Outcome of a solve: one entry per request, in submission order
pub struct SolveOutcome {
    pub results: Vec<RequestResult>,
    pub cancelled: bool,
}

impl SolveOutcome {
    pub fn by_key(&self, task_key: &str) -> Option<&Arc<GraphResult>> {
        self.results
            .iter()
            .find(|entry| entry.task_key.as_ref() == task_key)
            .map(|entry| &entry.result)
    }

    pub fn all_success(&self) -> bool {
        self.results.iter().all(|entry| entry.result.success())
    }

    /// First error across requests, if any
    pub fn first_error(&self) -> Option<Arc<TrellisError>> {
        self.results
            .iter()
            .find_map(|entry| entry.result.error.clone())
    }
}

pub struct TaskGraphSolver {
    nodes: Mutex<FxHashMap<Arc<str>, Arc<TaskNode>>>,
    event_log: EventLog,
    cancel: CancellationToken,
    global_concurrency: usize,
}

impl TaskGraphSolver {
    pub fn new(event_log: EventLog) -> Self {
        Self {
            nodes: Mutex::new(FxHashMap::default()),
            event_log,
            cancel: CancellationToken::new(),
            global_concurrency: GLOBAL_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.global_concurrency = limit.max(1);
        self
    }

    /// Token observed by the solve loop; cancelling stops dispatch of new
    /// nodes. In-flight handlers run to completion and their results are
    /// recorded, but requests receive aborted results.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn event_log(&self) -> &EventLog {
        &self.event_log
    }

    /// Lazily create or fetch the node for `(task, node_type)`.
    /// Repeated calls for the same key return the same node, which is what
    /// makes dependants shared.
    pub fn get_node(
        &self,
        node_type: NodeType,
        task: Arc<dyn GraphTask>,
        status_only: bool,
    ) -> Arc<TaskNode> {
        let key = intern(&format!("{}:{}", task.key(), node_type.key_part()));
        let mut nodes = self.nodes.lock();
        if let Some(existing) = nodes.get(&key) {
            if !status_only {
                existing.clear_status_only();
            }
            return Arc::clone(existing);
        }
        let node = Arc::new(TaskNode::new(Arc::clone(&key), node_type, task, status_only));
        nodes.insert(key, Arc::clone(&node));
        node
    }

    /// Every node key created so far (test observability)
    pub fn node_keys(&self) -> Vec<String> {
        self.nodes.lock().keys().map(|k| k.to_string()).collect()
    }

    fn node_by_key(&self, key: &str) -> Option<Arc<TaskNode>> {
        self.nodes.lock().get(key).cloned()
    }

    fn snapshot_incomplete(&self) -> Vec<Arc<TaskNode>> {
        let mut nodes: Vec<Arc<TaskNode>> = self
            .nodes
            .lock()
            .values()
            .filter(|n| n.result().is_none())
            .cloned()
            .collect();
        // Deterministic dispatch order between equally ready nodes
        nodes.sort_by(|a, b| a.key.cmp(&b.key));
        nodes
    }

    /// Current dependency nodes of `node`. Process nodes first depend on
    /// their own status node; once that resolves, the remaining set is
    /// recomputed from the observed status.
    fn current_dependencies(&self, node: &Arc<TaskNode>) -> Vec<Arc<TaskNode>> {
        let status_only = node.status_only();
        match node.node_type {
            NodeType::Request => {
                let target = if status_only && node.task.has_status() {
                    NodeType::Status
                } else {
                    NodeType::Process
                };
                vec![self.get_node(target, Arc::clone(&node.task), status_only)]
            }
            NodeType::Status => node
                .task
                .status_dependencies()
                .into_iter()
                .map(|dep| {
                    let target = if status_only && dep.has_status() {
                        NodeType::Status
                    } else {
                        NodeType::Process
                    };
                    self.get_node(target, dep, status_only)
                })
                .collect(),
            NodeType::Process => {
                if !node.task.has_status() {
                    return node
                        .task
                        .process_dependencies(&NodeOutput::Null)
                        .into_iter()
                        .map(|dep| self.get_node(NodeType::Process, dep, false))
                        .collect();
                }
                let status_node = self.get_node(NodeType::Status, Arc::clone(&node.task), false);
                match status_node.result() {
                    None => vec![status_node],
                    Some(status_result) => {
                        let status_output =
                            status_result.output.clone().unwrap_or(NodeOutput::Null);
                        let mut deps = vec![status_node];
                        deps.extend(
                            node.task
                                .process_dependencies(&status_output)
                                .into_iter()
                                .map(|dep| self.get_node(NodeType::Process, dep, false)),
                        );
                        deps
                    }
                }
            }
        }
    }

    /// Complete every incomplete transitive dependant of a failed or
    /// aborted node with a synthetic aborted result whose chain terminates
    /// at the origin.
    fn abort_dependants(&self, failed: &Arc<TaskNode>) {
        let Some(failed_result) = failed.result() else {
            return;
        };
        if failed_result.success() {
            return;
        }

        for dependant in failed.dependants() {
            if dependant.result().is_some() {
                continue;
            }

            // A request node delivers its task's own result to the
            // requester verbatim; only real dependants get the synthetic
            // graph error.
            if dependant.node_type == NodeType::Request {
                let installed = dependant.complete(GraphResult {
                    node_key: Arc::clone(&dependant.key),
                    started_at: None,
                    completed_at: Instant::now(),
                    output: failed_result.output.clone(),
                    error: failed_result.error.clone(),
                    aborted: failed_result.aborted,
                    dependency_keys: vec![Arc::clone(&failed.key)],
                });
                if installed {
                    self.event_log.emit(EventKind::NodeCompleted {
                        node_key: Arc::clone(&dependant.key),
                        success: false,
                        duration_ms: 0,
                    });
                }
                continue;
            }

            let failed_dependency = match failed_result.error.as_deref() {
                Some(TrellisError::GraphNode {
                    failed_dependency, ..
                }) => {
                    let mut chain = vec![dependant.key.to_string()];
                    chain.extend(failed_dependency.chain.iter().cloned());
                    FailedDependency {
                        node_key: failed_dependency.node_key.clone(),
                        message: failed_dependency.message.clone(),
                        chain,
                    }
                }
                Some(error) => FailedDependency {
                    node_key: failed.key.to_string(),
                    message: error.to_string(),
                    chain: vec![dependant.key.to_string(), failed.key.to_string()],
                },
                None => FailedDependency {
                    node_key: failed.key.to_string(),
                    message: "aborted".to_string(),
                    chain: vec![dependant.key.to_string(), failed.key.to_string()],
                },
            };

            let error = TrellisError::GraphNode {
                node_key: dependant.key.to_string(),
                failed_dependency,
            };

            let installed = dependant.complete(GraphResult {
                node_key: Arc::clone(&dependant.key),
                started_at: None,
                completed_at: Instant::now(),
                output: None,
                error: Some(Arc::new(error)),
                aborted: true,
                dependency_keys: vec![Arc::clone(&failed.key)],
            });
            if installed {
                self.event_log.emit(EventKind::NodeAborted {
                    node_key: Arc::clone(&dependant.key),
                    failed_dependency: Arc::clone(&failed.key),
                });
                self.abort_dependants(&dependant);
            }
        }
    }

    fn abort_all_incomplete(&self, error: Option<TrellisError>) {
        let message = error.as_ref().map(|e| Arc::new(TrellisError::internal(e.to_string())));
        for node in self.snapshot_incomplete() {
            let installed = node.complete(GraphResult {
                node_key: Arc::clone(&node.key),
                started_at: node.started_at(),
                completed_at: Instant::now(),
                output: None,
                error: message.clone(),
                aborted: true,
                dependency_keys: vec![],
            });
            if installed {
                self.event_log.emit(EventKind::NodeAborted {
                    node_key: Arc::clone(&node.key),
                    failed_dependency: intern("(solve)"),
                });
            }
        }
    }

    /// Run the solve loop until every requested node has a result.
    pub async fn solve(&self, requests: Vec<SolveRequest>) -> SolveOutcome {
        let session_id = uuid::Uuid::new_v4().to_string();
        let solve_start = Instant::now();
        self.event_log.emit(EventKind::SolveStarted {
            request_count: requests.len(),
            session_id,
        });
        info!(requests = requests.len(), "starting solve");

        let request_nodes: Vec<(Arc<str>, Arc<TaskNode>)> = requests
            .iter()
            .map(|request| {
                (
                    request.task.key(),
                    self.get_node(NodeType::Request, Arc::clone(&request.task), request.status_only),
                )
            })
            .collect();

        type NodeRun = (Arc<str>, Result<NodeOutput>, Instant, Vec<Arc<str>>);
        let mut join_set: JoinSet<NodeRun> = JoinSet::new();
        let mut in_flight: FxHashSet<Arc<str>> = FxHashSet::default();
        let mut in_flight_by_type: FxHashMap<TaskType, usize> = FxHashMap::default();

        loop {
            if request_nodes.iter().all(|(_, node)| node.result().is_some()) {
                break;
            }

            let cancelled = self.cancel.is_cancelled();
            let mut progressed = false;
            let nodes_before = self.nodes.lock().len();

            if !cancelled {
                for node in self.snapshot_incomplete() {
                    if node.result().is_some() || in_flight.contains(&node.key) {
                        continue;
                    }

                    let deps = self.current_dependencies(&node);
                    let mut failed_dep: Option<Arc<TaskNode>> = None;
                    let mut remaining = 0usize;
                    for dep in &deps {
                        dep.add_dependant(&node);
                        match dep.result() {
                            Some(result) if !result.success() => {
                                failed_dep.get_or_insert_with(|| Arc::clone(dep));
                            }
                            Some(_) => {}
                            None => remaining += 1,
                        }
                    }

                    // Late dependant registration: the dependency may have
                    // failed before we attached, so cascade from here.
                    if let Some(dep) = failed_dep {
                        self.abort_dependants(&dep);
                        progressed = true;
                        continue;
                    }
                    if remaining > 0 {
                        continue;
                    }

                    // Request nodes complete inline by copying their
                    // single dependency's result.
                    if node.node_type == NodeType::Request {
                        let dep = &deps[0];
                        let dep_result = dep.result().expect("readiness checked");
                        let installed = node.complete(GraphResult {
                            node_key: Arc::clone(&node.key),
                            started_at: None,
                            completed_at: Instant::now(),
                            output: dep_result.output.clone(),
                            error: dep_result.error.clone(),
                            aborted: dep_result.aborted,
                            dependency_keys: vec![Arc::clone(&dep.key)],
                        });
                        if installed {
                            self.event_log.emit(EventKind::NodeCompleted {
                                node_key: Arc::clone(&node.key),
                                success: dep_result.success(),
                                duration_ms: 0,
                            });
                        }
                        progressed = true;
                        continue;
                    }

                    // Concurrency gates
                    if in_flight.len() >= self.global_concurrency {
                        continue;
                    }
                    if let Some(limit) = node.task.concurrency_limit() {
                        let running = in_flight_by_type
                            .get(&node.task.task_type())
                            .copied()
                            .unwrap_or(0);
                        if running >= limit {
                            continue;
                        }
                    }

                    // Dispatch
                    let mut results_map = FxHashMap::default();
                    let mut dep_keys = Vec::with_capacity(deps.len());
                    for dep in &deps {
                        dep_keys.push(Arc::clone(&dep.key));
                        results_map.insert(
                            Arc::clone(&dep.key),
                            dep.result().expect("readiness checked"),
                        );
                    }
                    let dep_results = DependencyResults::new(results_map);

                    let started = node.mark_started();
                    self.event_log.emit(EventKind::NodeDispatched {
                        node_key: Arc::clone(&node.key),
                        dependencies: dep_keys.clone(),
                    });
                    debug!(node = %node.key, "dispatching");

                    in_flight.insert(Arc::clone(&node.key));
                    *in_flight_by_type.entry(node.task.task_type()).or_insert(0) += 1;

                    let task = Arc::clone(&node.task);
                    let node_type = node.node_type;
                    let node_key = Arc::clone(&node.key);
                    let timeout = task.timeout();
                    join_set.spawn(async move {
                        let handler = async {
                            match node_type {
                                NodeType::Status => task.status(&dep_results).await,
                                NodeType::Process => {
                                    let status_output = if task.has_status() {
                                        let status_key = format!("{}:status", task.key());
                                        dep_results
                                            .get(&status_key)
                                            .and_then(|r| r.output.clone())
                                            .unwrap_or(NodeOutput::Null)
                                    } else {
                                        NodeOutput::Null
                                    };
                                    task.process(status_output, &dep_results).await
                                }
                                NodeType::Request => {
                                    Err(TrellisError::internal("request nodes complete inline"))
                                }
                            }
                        };
                        let outcome = match timeout {
                            Some(limit) => match tokio::time::timeout(limit, handler).await {
                                Ok(result) => result,
                                Err(_) => Err(TrellisError::Timeout {
                                    node_key: node_key.to_string(),
                                    timeout_secs: limit.as_secs(),
                                }),
                            },
                            None => handler.await,
                        };
                        (node_key, outcome, started, dep_keys)
                    });
                    progressed = true;
                }
            }

            // Lazily created dependency nodes count as progress: they
            // enter the next snapshot.
            if self.nodes.lock().len() > nodes_before {
                progressed = true;
            }

            if progressed {
                continue;
            }

            if join_set.is_empty() {
                if cancelled {
                    self.abort_all_incomplete(None);
                } else {
                    // A DAG validated upstream cannot deadlock; reaching
                    // this branch is a solver bug.
                    warn!("solve loop stalled with no runnable nodes");
                    self.abort_all_incomplete(Some(TrellisError::internal(
                        "no runnable nodes but requests are incomplete",
                    )));
                }
                continue;
            }

            let Some(joined) = join_set.join_next().await else {
                continue;
            };
            match joined {
                Ok((node_key, outcome, started, dep_keys)) => {
                    in_flight.remove(&node_key);
                    let node = self
                        .node_by_key(&node_key)
                        .expect("completed node must exist");
                    if let Some(count) = in_flight_by_type.get_mut(&node.task.task_type()) {
                        *count = count.saturating_sub(1);
                    }

                    let success = outcome.is_ok();
                    let (output, error) = match outcome {
                        Ok(output) => (Some(output), None),
                        Err(err) => (None, Some(Arc::new(err))),
                    };
                    let installed = node.complete(GraphResult {
                        node_key: Arc::clone(&node_key),
                        started_at: Some(started),
                        completed_at: Instant::now(),
                        output,
                        error,
                        aborted: false,
                        dependency_keys: dep_keys,
                    });
                    self.event_log.emit(EventKind::NodeCompleted {
                        node_key: Arc::clone(&node_key),
                        success,
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                    if installed && !success {
                        self.abort_dependants(&node);
                    }
                }
                Err(join_error) => {
                    // A panicking handler loses its node identity; fail
                    // the whole solve rather than hang.
                    self.abort_all_incomplete(Some(TrellisError::internal(format!(
                        "node handler panicked: {join_error}"
                    ))));
                }
            }
        }

        let cancelled = self.cancel.is_cancelled();
        let results: Vec<RequestResult> = request_nodes
            .iter()
            .map(|(task_key, node)| RequestResult {
                task_key: Arc::clone(task_key),
                result: node.result().expect("loop exited when all complete"),
            })
            .collect();

        self.event_log.emit(EventKind::SolveCompleted {
            success: results.iter().all(|r| r.result.success()),
            total_duration_ms: solve_start.elapsed().as_millis() as u64,
        });
        info!(
            requests = results.len(),
            cancelled, "solve finished"
        );

        SolveOutcome { results, cancelled }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedTask;
    use super::*;
    use crate::action::ActionState;

    fn solver() -> TaskGraphSolver {
        TaskGraphSolver::new(EventLog::new())
    }

    #[tokio::test]
    async fn get_node_returns_shared_instance() {
        let s = solver();
        let task: Arc<dyn GraphTask> = Arc::new(ScriptedTask::new("build.api", TaskType::Build));
        let a = s.get_node(NodeType::Process, Arc::clone(&task), false);
        let b = s.get_node(NodeType::Process, task, false);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn single_task_runs_status_then_process() {
        let task = Arc::new(
            ScriptedTask::new("build.api", TaskType::Build)
                .with_status_state(ActionState::NotReady),
        );
        let calls = task.call_log();
        let s = solver();

        let outcome = s
            .solve(vec![SolveRequest::new(task as Arc<dyn GraphTask>)])
            .await;
        assert!(outcome.all_success());
        assert_eq!(
            calls.lock().as_slice(),
            ["status:build.api", "process:build.api"]
        );
    }

    #[tokio::test]
    async fn dependency_completes_before_dependant_runs() {
        let dep = Arc::new(
            ScriptedTask::new("build.api", TaskType::Build)
                .with_status_state(ActionState::NotReady),
        );
        let calls = dep.call_log();
        let top = Arc::new(
            ScriptedTask::new("deploy.api", TaskType::Deploy)
                .with_status_state(ActionState::Missing)
                .with_call_log(Arc::clone(&calls))
                .with_status_dep(Arc::clone(&dep) as Arc<dyn GraphTask>)
                .with_process_dep(dep as Arc<dyn GraphTask>),
        );

        let outcome = solver()
            .solve(vec![SolveRequest::new(top as Arc<dyn GraphTask>)])
            .await;
        assert!(outcome.all_success());
        assert_eq!(
            calls.lock().as_slice(),
            [
                "status:build.api",
                "process:build.api",
                "status:deploy.api",
                "process:deploy.api",
            ]
        );
    }

    #[tokio::test]
    async fn failure_aborts_dependants_with_chain() {
        let dep = Arc::new(
            ScriptedTask::new("build.api", TaskType::Build)
                .with_status_state(ActionState::NotReady)
                .with_process_error("compiler exited with 1"),
        );
        let calls = dep.call_log();
        let top = Arc::new(
            ScriptedTask::new("deploy.api", TaskType::Deploy)
                .with_status_state(ActionState::Missing)
                .with_call_log(Arc::clone(&calls))
                .with_status_dep(Arc::clone(&dep) as Arc<dyn GraphTask>)
                .with_process_dep(dep as Arc<dyn GraphTask>),
        );

        let outcome = solver()
            .solve(vec![SolveRequest::new(top as Arc<dyn GraphTask>)])
            .await;

        let result = outcome.by_key("deploy.api").unwrap();
        assert!(result.aborted);
        assert!(!result.success());

        // deploy's process handler never ran
        assert!(!calls.lock().iter().any(|c| c == "process:deploy.api"));

        // Chain terminates at the origin
        let error = result.error.as_deref().unwrap();
        let TrellisError::GraphNode {
            failed_dependency, ..
        } = error
        else {
            panic!("expected GraphNode error, got {error:?}");
        };
        assert_eq!(failed_dependency.node_key, "build.api:process");
        assert!(failed_dependency.message.contains("compiler exited"));
        assert_eq!(
            failed_dependency.chain.last().map(String::as_str),
            Some("build.api:process")
        );
    }

    #[tokio::test]
    async fn status_only_creates_no_process_nodes() {
        let dep = Arc::new(
            ScriptedTask::new("build.api", TaskType::Build)
                .with_status_state(ActionState::Ready),
        );
        let top = Arc::new(
            ScriptedTask::new("deploy.api", TaskType::Deploy)
                .with_status_state(ActionState::Ready)
                .with_status_dep(dep as Arc<dyn GraphTask>),
        );

        let s = solver();
        let outcome = s
            .solve(vec![SolveRequest::status_only(top as Arc<dyn GraphTask>)])
            .await;
        assert!(outcome.all_success());

        let keys = s.node_keys();
        assert!(!keys.iter().any(|k| k.ends_with(":process")), "{keys:?}");
        assert!(keys.contains(&"build.api:status".to_string()));
        assert!(keys.contains(&"deploy.api:status".to_string()));
    }

    #[tokio::test]
    async fn skipped_process_deps_when_status_ready() {
        // Dependency is only a process dependency; with status Ready the
        // lazily recomputed set is empty and the dep never runs.
        let dep = Arc::new(
            ScriptedTask::new("build.api", TaskType::Build)
                .with_status_state(ActionState::NotReady),
        );
        let calls = dep.call_log();
        let top = Arc::new(
            ScriptedTask::new("deploy.api", TaskType::Deploy)
                .with_status_state(ActionState::Ready)
                .with_call_log(Arc::clone(&calls))
                .with_process_dep(dep as Arc<dyn GraphTask>),
        );

        let outcome = solver()
            .solve(vec![SolveRequest::new(top as Arc<dyn GraphTask>)])
            .await;
        assert!(outcome.all_success());
        assert!(!calls.lock().iter().any(|c| c.contains("build.api")));
    }

    #[tokio::test]
    async fn timeout_fails_the_node_and_cascades() {
        let slow = Arc::new(
            ScriptedTask::new("build.api", TaskType::Build)
                .with_status_state(ActionState::NotReady)
                .with_process_delay(Duration::from_secs(30))
                .with_timeout(Duration::from_millis(50)),
        );
        let top = Arc::new(
            ScriptedTask::new("deploy.api", TaskType::Deploy)
                .with_status_state(ActionState::Missing)
                .with_status_dep(Arc::clone(&slow) as Arc<dyn GraphTask>),
        );

        let outcome = solver()
            .solve(vec![
                SolveRequest::new(slow as Arc<dyn GraphTask>),
                SolveRequest::new(top as Arc<dyn GraphTask>),
            ])
            .await;

        let build_result = outcome.by_key("build.api").unwrap();
        assert_eq!(
            build_result.error.as_deref().map(|e| e.code()),
            Some("TRL-070")
        );
        let deploy_result = outcome.by_key("deploy.api").unwrap();
        assert!(deploy_result.aborted);
    }

    #[tokio::test]
    async fn cancellation_stops_dispatch() {
        let task = Arc::new(
            ScriptedTask::new("build.api", TaskType::Build)
                .with_status_state(ActionState::NotReady),
        );
        let s = solver();
        s.cancellation_token().cancel();

        let outcome = s
            .solve(vec![SolveRequest::new(task as Arc<dyn GraphTask>)])
            .await;
        assert!(outcome.cancelled);
        assert!(!outcome.all_success());
        assert!(outcome.results[0].result.aborted);
    }

    #[tokio::test]
    async fn per_type_concurrency_cap_is_honored() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static RUNNING: AtomicUsize = AtomicUsize::new(0);
        static PEAK: AtomicUsize = AtomicUsize::new(0);

        struct GaugedTask {
            key: Arc<str>,
        }

        #[async_trait]
        impl GraphTask for GaugedTask {
            fn key(&self) -> Arc<str> {
                Arc::clone(&self.key)
            }
            fn task_type(&self) -> TaskType {
                TaskType::Build
            }
            fn concurrency_limit(&self) -> Option<usize> {
                Some(2)
            }
            fn has_status(&self) -> bool {
                false
            }
            fn process_dependencies(&self, _status: &NodeOutput) -> Vec<Arc<dyn GraphTask>> {
                vec![]
            }
            async fn status(&self, _deps: &DependencyResults) -> Result<NodeOutput> {
                Ok(NodeOutput::Null)
            }
            async fn process(
                &self,
                _status: NodeOutput,
                _deps: &DependencyResults,
            ) -> Result<NodeOutput> {
                let now = RUNNING.fetch_add(1, Ordering::SeqCst) + 1;
                PEAK.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                RUNNING.fetch_sub(1, Ordering::SeqCst);
                Ok(NodeOutput::Null)
            }
        }

        let requests: Vec<SolveRequest> = (0..6)
            .map(|i| {
                SolveRequest::new(Arc::new(GaugedTask {
                    key: intern(&format!("build.svc-{i}")),
                }) as Arc<dyn GraphTask>)
            })
            .collect();

        let outcome = solver().solve(requests).await;
        assert!(outcome.all_success());
        assert!(PEAK.load(Ordering::SeqCst) <= 2, "peak was {}", PEAK.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn independent_requests_share_dependency_nodes() {
        let shared = Arc::new(
            ScriptedTask::new("build.common", TaskType::Build)
                .with_status_state(ActionState::NotReady),
        );
        let calls = shared.call_log();
        let a = Arc::new(
            ScriptedTask::new("deploy.a", TaskType::Deploy)
                .with_status_state(ActionState::Missing)
                .with_call_log(Arc::clone(&calls))
                .with_status_dep(Arc::clone(&shared) as Arc<dyn GraphTask>),
        );
        let b = Arc::new(
            ScriptedTask::new("deploy.b", TaskType::Deploy)
                .with_status_state(ActionState::Missing)
                .with_call_log(Arc::clone(&calls))
                .with_status_dep(Arc::clone(&shared) as Arc<dyn GraphTask>),
        );

        let outcome = solver()
            .solve(vec![
                SolveRequest::new(a as Arc<dyn GraphTask>),
                SolveRequest::new(b as Arc<dyn GraphTask>),
            ])
            .await;
        assert!(outcome.all_success());

        // The shared dependency ran exactly once
        let count = calls
            .lock()
            .iter()
            .filter(|c| *c == "process:build.common")
            .count();
        assert_eq!(count, 1);
    }
}
