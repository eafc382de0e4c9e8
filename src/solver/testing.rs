//! Scripted graph tasks for solver tests

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use crate::action::{ActionState, ActionStatus};
use crate::error::{Result, TrellisError};
use crate::util::intern;

use super::node::{DependencyResults, NodeOutput};
use super::{GraphTask, TaskType};

/// A task with no status phase whose process returns `Null`
pub struct NullTask {
    key: Arc<str>,
}

impl NullTask {
    pub fn new(key: &str) -> Self {
        Self { key: intern(key) }
    }
}

#[async_trait]
impl GraphTask for NullTask {
    fn key(&self) -> Arc<str> {
        Arc::clone(&self.key)
    }

    fn task_type(&self) -> TaskType {
        TaskType::Resolve
    }

    fn has_status(&self) -> bool {
        false
    }

    fn process_dependencies(&self, _status: &NodeOutput) -> Vec<Arc<dyn GraphTask>> {
        Vec::new()
    }

    async fn status(&self, _deps: &DependencyResults) -> Result<NodeOutput> {
        Ok(NodeOutput::Null)
    }

    async fn process(&self, _status: NodeOutput, _deps: &DependencyResults) -> Result<NodeOutput> {
        Ok(NodeOutput::Null)
    }
}

/// Fully scripted task: fixed status state, optional process failure or
/// delay, dependency lists, shared call log.
pub struct ScriptedTask {
    key: Arc<str>,
    task_type: TaskType,
    force: bool,
    timeout: Option<Duration>,
    status_state: ActionState,
    status_deps: Vec<Arc<dyn GraphTask>>,
    process_deps: Vec<Arc<dyn GraphTask>>,
    process_error: Option<String>,
    process_delay: Option<Duration>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedTask {
    pub fn new(key: &str, task_type: TaskType) -> Self {
        Self {
            key: intern(key),
            task_type,
            force: false,
            timeout: None,
            status_state: ActionState::NotReady,
            status_deps: Vec::new(),
            process_deps: Vec::new(),
            process_error: None,
            process_delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_status_state(mut self, state: ActionState) -> Self {
        self.status_state = state;
        self
    }

    pub fn with_status_dep(mut self, dep: Arc<dyn GraphTask>) -> Self {
        self.status_deps.push(dep);
        self
    }

    pub fn with_process_dep(mut self, dep: Arc<dyn GraphTask>) -> Self {
        self.process_deps.push(dep);
        self
    }

    pub fn with_process_error(mut self, message: &str) -> Self {
        self.process_error = Some(message.to_string());
        self
    }

    pub fn with_process_delay(mut self, delay: Duration) -> Self {
        self.process_delay = Some(delay);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Share a call log between tasks so tests can assert global ordering
    pub fn with_call_log(mut self, calls: Arc<Mutex<Vec<String>>>) -> Self {
        self.calls = calls;
        self
    }

    pub fn call_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl GraphTask for ScriptedTask {
    fn key(&self) -> Arc<str> {
        Arc::clone(&self.key)
    }

    fn task_type(&self) -> TaskType {
        self.task_type
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn force(&self) -> bool {
        self.force
    }

    fn status_dependencies(&self) -> Vec<Arc<dyn GraphTask>> {
        self.status_deps.clone()
    }

    fn process_dependencies(&self, status: &NodeOutput) -> Vec<Arc<dyn GraphTask>> {
        // Ready status (unforced) needs no process work, hence no deps
        if !self.force
            && status
                .as_status()
                .is_some_and(|s| s.state == ActionState::Ready)
        {
            return Vec::new();
        }
        self.process_deps.clone()
    }

    async fn status(&self, _deps: &DependencyResults) -> Result<NodeOutput> {
        self.calls.lock().push(format!("status:{}", self.key));
        Ok(NodeOutput::Status(ActionStatus {
            state: self.status_state,
            detail: None,
            outputs: json!({}),
        }))
    }

    async fn process(&self, status: NodeOutput, _deps: &DependencyResults) -> Result<NodeOutput> {
        // Skip the handler when status already reports ready (unforced)
        if !self.force
            && status
                .as_status()
                .is_some_and(|s| s.state == ActionState::Ready)
        {
            return Ok(status);
        }

        self.calls.lock().push(format!("process:{}", self.key));
        if let Some(delay) = self.process_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.process_error {
            return Err(TrellisError::Runtime {
                key: self.key.to_string(),
                message: message.clone(),
            });
        }
        Ok(NodeOutput::Status(ActionStatus::ready()))
    }
}
