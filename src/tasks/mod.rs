//! Execution tasks
//!
//! Bridges the action graph to the solver:
//!
//! - `ResolveTask` wraps the resolve pipeline. It has no status phase;
//!   its process yields a `ResolvedAction`. Dependencies are resolve
//!   tasks, or execute tasks where the edge needs executed outputs.
//! - `ExecuteTask` covers the four kinds. Status queries the provider
//!   after resolution; process consults the observed status and skips the
//!   handler when the action is already ready (unless forced).
//!
//! Task instances are shared through the factory so the status phase can
//! stash the resolved action for the process phase. Tasks hold a weak
//! factory reference; the factory outlives its tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{error, warn};

use crate::action::graph::ActionGraph;
use crate::action::{
    ActionConfig, ActionKind, ActionRef, ActionState, ActionStatus, ExecutedAction,
};
use crate::error::{Result, TrellisError};
use crate::event::{EventKind, EventLog};
use crate::provider::ProviderRouter;
use crate::resolve::{ActionResolver, DependencyOutputs};
use crate::solver::{DependencyResults, GraphTask, NodeOutput, SolveRequest, TaskType};
use crate::util::{intern, merge_deep, BUILD_CONCURRENCY, DEFAULT_TASK_TIMEOUT};

pub struct TaskFactory {
    graph: Arc<ActionGraph>,
    resolver: Arc<ActionResolver>,
    router: Arc<ProviderRouter>,
    event_log: EventLog,
    tasks: DashMap<String, Arc<dyn GraphTask>>,
    /// Shared per-action force flags; a forced request upgrades the flag
    /// even when the task instance already exists.
    force_flags: DashMap<String, Arc<AtomicBool>>,
    self_ref: Weak<TaskFactory>,
}

impl TaskFactory {
    pub fn new(
        graph: Arc<ActionGraph>,
        resolver: Arc<ActionResolver>,
        router: Arc<ProviderRouter>,
        event_log: EventLog,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            graph,
            resolver,
            router,
            event_log,
            tasks: DashMap::new(),
            force_flags: DashMap::new(),
            self_ref: self_ref.clone(),
        })
    }

    /// Build a solver request for `<kind>.<name>`
    pub fn request(
        &self,
        reference: &ActionRef,
        force: bool,
        status_only: bool,
    ) -> Result<SolveRequest> {
        let task = self.execute_task(reference, force)?;
        Ok(SolveRequest { task, status_only })
    }

    /// Shared execute task for an action. A forced request upgrades the
    /// shared instance; force never propagates to dependencies.
    pub fn execute_task(&self, reference: &ActionRef, force: bool) -> Result<Arc<dyn GraphTask>> {
        let key = reference.key();
        let flag = Arc::clone(
            self.force_flags
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AtomicBool::new(false)))
                .value(),
        );
        if force {
            flag.store(true, Ordering::SeqCst);
        }
        if let Some(existing) = self.tasks.get(&key) {
            return Ok(Arc::clone(existing.value()));
        }
        let config = self.graph.registry().get_by_key(&key, "request")?;
        let task: Arc<dyn GraphTask> = Arc::new(ExecuteTask {
            config,
            factory: self.self_ref.clone(),
            force: flag,
            resolved: OnceLock::new(),
        });
        self.tasks.insert(key, Arc::clone(&task));
        Ok(task)
    }

    pub fn resolve_task(&self, reference: &ActionRef) -> Result<Arc<dyn GraphTask>> {
        let key = format!("resolve.{}", reference.key());
        if let Some(existing) = self.tasks.get(&key) {
            return Ok(Arc::clone(existing.value()));
        }
        let config = self.graph.registry().get_by_key(&reference.key(), "resolve")?;
        let task: Arc<dyn GraphTask> = Arc::new(ResolveTask {
            config,
            factory: self.self_ref.clone(),
        });
        self.tasks.insert(key, Arc::clone(&task));
        Ok(task)
    }

    fn graph(&self) -> &ActionGraph {
        &self.graph
    }
}

fn kind_task_type(kind: ActionKind) -> TaskType {
    match kind {
        ActionKind::Build => TaskType::Build,
        ActionKind::Deploy => TaskType::Deploy,
        ActionKind::Run => TaskType::Run,
        ActionKind::Test => TaskType::Test,
    }
}

// ═══════════════════════════════════════════════════════════════
// ResolveTask
// ═══════════════════════════════════════════════════════════════

struct ResolveTask {
    config: Arc<ActionConfig>,
    factory: Weak<TaskFactory>,
}

impl ResolveTask {
    fn dependency_tasks(&self) -> Vec<Arc<dyn GraphTask>> {
        let Some(factory) = self.factory.upgrade() else {
            error!(action = %self.config.key(), "task factory dropped while resolving");
            return Vec::new();
        };
        factory
            .graph()
            .dependencies_of(&self.config.key())
            .iter()
            .filter_map(|edge| {
                let made = if edge.needs_executed_outputs {
                    factory.execute_task(&edge.to, false)
                } else {
                    factory.resolve_task(&edge.to)
                };
                match made {
                    Ok(task) => Some(task),
                    Err(err) => {
                        error!(edge = %edge.to, %err, "failed to build dependency task");
                        None
                    }
                }
            })
            .collect()
    }
}

#[async_trait]
impl GraphTask for ResolveTask {
    fn key(&self) -> Arc<str> {
        intern(&format!("resolve.{}", self.config.key()))
    }

    fn task_type(&self) -> TaskType {
        TaskType::Resolve
    }

    fn has_status(&self) -> bool {
        false
    }

    fn process_dependencies(&self, _status: &NodeOutput) -> Vec<Arc<dyn GraphTask>> {
        self.dependency_tasks()
    }

    async fn status(&self, _deps: &DependencyResults) -> Result<NodeOutput> {
        Ok(NodeOutput::Null)
    }

    async fn process(&self, _status: NodeOutput, deps: &DependencyResults) -> Result<NodeOutput> {
        let factory = self
            .factory
            .upgrade()
            .ok_or_else(|| TrellisError::internal("task factory dropped mid-solve"))?;

        let mut outputs = DependencyOutputs::new();
        for edge in factory.graph().dependencies_of(&self.config.key()) {
            let dep_key = edge.to.key();
            if edge.needs_executed_outputs {
                let executed = deps.executed_action(&dep_key).ok_or_else(|| {
                    TrellisError::internal(format!(
                        "executed dependency {dep_key} missing from results"
                    ))
                })?;
                outputs.add_executed(executed);
            } else {
                let resolved = deps.resolved_action(&dep_key).ok_or_else(|| {
                    TrellisError::internal(format!(
                        "resolved dependency {dep_key} missing from results"
                    ))
                })?;
                outputs.add_resolved(resolved);
            }
        }

        let resolved = factory
            .resolver
            .resolve(Arc::clone(&self.config), &outputs)
            .await?;
        Ok(NodeOutput::Resolved(Arc::new(resolved)))
    }
}

// ═══════════════════════════════════════════════════════════════
// ExecuteTask (Build / Deploy / Run / Test)
// ═══════════════════════════════════════════════════════════════

struct ExecuteTask {
    config: Arc<ActionConfig>,
    factory: Weak<TaskFactory>,
    force: Arc<AtomicBool>,
    /// Stashed by the status phase; task instances are shared per key, so
    /// the process phase reads the same resolution.
    resolved: OnceLock<Arc<crate::action::ResolvedAction>>,
}

impl ExecuteTask {
    fn execute_dependency_tasks(&self) -> Vec<Arc<dyn GraphTask>> {
        let Some(factory) = self.factory.upgrade() else {
            error!(action = %self.config.key(), "task factory dropped while executing");
            return Vec::new();
        };
        factory
            .graph()
            .dependencies_of(&self.config.key())
            .iter()
            // Static-output edges only need resolution, which the resolve
            // task dependency already covers transitively.
            .filter(|edge| edge.explicit || edge.needs_executed_outputs)
            .filter_map(|edge| match factory.execute_task(&edge.to, false) {
                Ok(task) => Some(task),
                Err(err) => {
                    error!(edge = %edge.to, %err, "failed to build dependency task");
                    None
                }
            })
            .collect()
    }

    fn resolved_from(
        &self,
        deps: &DependencyResults,
    ) -> Result<Arc<crate::action::ResolvedAction>> {
        if let Some(resolved) = self.resolved.get() {
            return Ok(Arc::clone(resolved));
        }
        let resolve_key = format!("resolve.{}", self.config.key());
        let resolved = deps
            .output_for(&resolve_key)
            .and_then(NodeOutput::as_resolved)
            .cloned()
            .ok_or_else(|| {
                TrellisError::internal(format!(
                    "resolved action missing for {}",
                    self.config.key()
                ))
            })?;
        let _ = self.resolved.set(Arc::clone(&resolved));
        Ok(resolved)
    }
}

#[async_trait]
impl GraphTask for ExecuteTask {
    fn key(&self) -> Arc<str> {
        intern(&self.config.key())
    }

    fn task_type(&self) -> TaskType {
        kind_task_type(self.config.kind)
    }

    fn timeout(&self) -> Option<Duration> {
        Some(
            self.config
                .timeout
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TASK_TIMEOUT),
        )
    }

    fn force(&self) -> bool {
        self.force.load(Ordering::SeqCst)
    }

    fn concurrency_limit(&self) -> Option<usize> {
        match self.config.kind {
            ActionKind::Build => Some(BUILD_CONCURRENCY),
            _ => None,
        }
    }

    fn status_dependencies(&self) -> Vec<Arc<dyn GraphTask>> {
        let mut deps: Vec<Arc<dyn GraphTask>> = Vec::new();
        if let Some(factory) = self.factory.upgrade() {
            match factory.resolve_task(&self.config.reference()) {
                Ok(task) => deps.push(task),
                Err(err) => error!(action = %self.config.key(), %err, "failed to build resolve task"),
            }
        }
        deps.extend(self.execute_dependency_tasks());
        deps
    }

    fn process_dependencies(&self, status: &NodeOutput) -> Vec<Arc<dyn GraphTask>> {
        let ready = status
            .as_status()
            .is_some_and(|s| s.state == ActionState::Ready);
        if ready && !self.force() {
            return Vec::new();
        }
        self.execute_dependency_tasks()
    }

    #[tracing::instrument(skip_all, fields(action = %self.config.key()))]
    async fn status(&self, deps: &DependencyResults) -> Result<NodeOutput> {
        let resolved = self.resolved_from(deps)?;
        let factory = self
            .factory
            .upgrade()
            .ok_or_else(|| TrellisError::internal("task factory dropped mid-solve"))?;
        let handler = factory
            .router
            .handler(&resolved.config.type_name, &resolved.key())?;

        // A broken status probe must not wedge the graph; report unknown
        // and let the process phase decide.
        let status = match handler.get_status(&resolved).await {
            Ok(status) => status,
            Err(err) => {
                warn!(action = %resolved.key(), %err, "status query failed");
                ActionStatus::unknown()
            }
        };

        factory.event_log.emit(EventKind::StatusObserved {
            node_key: intern(&format!("{}:status", self.config.key())),
            state: status.state.to_string(),
        });
        Ok(NodeOutput::Status(status))
    }

    #[tracing::instrument(skip_all, fields(action = %self.config.key()))]
    async fn process(&self, status: NodeOutput, deps: &DependencyResults) -> Result<NodeOutput> {
        let resolved = self.resolved_from(deps)?;
        let factory = self
            .factory
            .upgrade()
            .ok_or_else(|| TrellisError::internal("task factory dropped mid-solve"))?;

        let observed = status.as_status().cloned().unwrap_or_else(ActionStatus::unknown);

        if observed.state == ActionState::Ready && !self.force() {
            factory.event_log.emit(EventKind::ProcessSkipped {
                node_key: intern(&format!("{}:process", self.config.key())),
            });
            let executed = ExecutedAction {
                version: resolved.version_string(),
                resolved,
                state: ActionState::Ready,
                outputs: observed.outputs,
            };
            return Ok(NodeOutput::Executed(Arc::new(executed)));
        }

        let handler = factory
            .router
            .handler(&resolved.config.type_name, &resolved.key())?;
        let output = handler.execute(&resolved).await?;

        let mut outputs = output.outputs;
        // An attached background monitor is a provider-reported signal;
        // sync/local deploys may set it through the execute call.
        if output.attached {
            let mut map = serde_json::Map::new();
            map.insert("attached".into(), Value::Bool(true));
            merge_deep(&mut outputs, &Value::Object(map));
        }

        let executed = ExecutedAction {
            version: resolved.version_string(),
            resolved,
            state: output.state,
            outputs,
        };
        Ok(NodeOutput::Executed(Arc::new(executed)))
    }
}
