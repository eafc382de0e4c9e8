//! Scripted provider handler for tests
//!
//! Records every call in order and returns pre-programmed statuses and
//! execute results, so tests can assert handler invocation sequences
//! without real providers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};

use crate::action::{ActionKind, ActionMode, ActionState, ActionStatus, ResolvedAction};
use crate::error::{Result, TrellisError};
use crate::schema::Schema;

use super::{ActionTypeHandler, ConfigureOutput, ExecuteOutput};

enum ScriptedExecute {
    Succeed { outputs: Value, attached: bool },
    Fail { message: String },
}

/// A handler whose behavior is fully scripted per action key.
pub struct ScriptedHandler {
    type_name: String,
    base_types: Vec<String>,
    static_keys: Vec<String>,
    modes: Vec<ActionMode>,
    spec_schema: Schema,
    statuses: Mutex<FxHashMap<String, VecDeque<ActionStatus>>>,
    executes: Mutex<FxHashMap<String, ScriptedExecute>>,
    configure_mutation: Option<(String, Value)>,
    delay: Option<Duration>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedHandler {
    pub fn new(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            base_types: Vec::new(),
            static_keys: Vec::new(),
            modes: vec![ActionMode::Default, ActionMode::Sync, ActionMode::Local],
            spec_schema: Schema::any(),
            statuses: Mutex::new(FxHashMap::default()),
            executes: Mutex::new(FxHashMap::default()),
            configure_mutation: None,
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_base_types(mut self, bases: impl IntoIterator<Item = &'static str>) -> Self {
        self.base_types = bases.into_iter().map(String::from).collect();
        self
    }

    pub fn with_static_output_keys(
        mut self,
        keys: impl IntoIterator<Item = &'static str>,
    ) -> Self {
        self.static_keys = keys.into_iter().map(String::from).collect();
        self
    }

    pub fn with_supported_modes(mut self, modes: Vec<ActionMode>) -> Self {
        self.modes = modes;
        self
    }

    pub fn with_spec_schema(mut self, schema: Schema) -> Self {
        self.spec_schema = schema;
        self
    }

    /// Queue a status for an action key; consumed in order, the last one
    /// repeats.
    pub fn with_status(self, key: &str, state: ActionState) -> Self {
        self.statuses.lock().entry(key.to_string()).or_default().push_back(ActionStatus {
            state,
            detail: None,
            outputs: json!({}),
        });
        self
    }

    pub fn with_status_outputs(self, key: &str, state: ActionState, outputs: Value) -> Self {
        self.statuses.lock().entry(key.to_string()).or_default().push_back(ActionStatus {
            state,
            detail: None,
            outputs,
        });
        self
    }

    pub fn with_execute_outputs(self, key: &str, outputs: Value) -> Self {
        self.executes.lock().insert(
            key.to_string(),
            ScriptedExecute::Succeed {
                outputs,
                attached: false,
            },
        );
        self
    }

    /// Execute succeeds and reports an attached background monitor
    pub fn with_execute_attached(self, key: &str) -> Self {
        self.executes.lock().insert(
            key.to_string(),
            ScriptedExecute::Succeed {
                outputs: json!({}),
                attached: true,
            },
        );
        self
    }

    pub fn with_execute_error(self, key: &str, message: &str) -> Self {
        self.executes.lock().insert(
            key.to_string(),
            ScriptedExecute::Fail {
                message: message.to_string(),
            },
        );
        self
    }

    /// Simulate a plugin mutating a spec field during configure
    pub fn with_configure_mutation(mut self, field: &str, value: Value) -> Self {
        self.configure_mutation = Some((field.to_string(), value));
        self
    }

    /// Delay every status/execute call (for concurrency tests)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Calls recorded so far, e.g. `["status:build.api", "execute:build.api"]`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Shared handle to the call log (for asserting across handlers)
    pub fn call_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.calls)
    }

    fn record(&self, operation: &str, key: &str) {
        self.calls.lock().push(format!("{operation}:{key}"));
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ActionTypeHandler for ScriptedHandler {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn base_types(&self) -> Vec<String> {
        self.base_types.clone()
    }

    fn spec_schema(&self, _kind: ActionKind) -> Schema {
        self.spec_schema.clone()
    }

    fn static_output_keys(&self) -> Vec<String> {
        self.static_keys.clone()
    }

    fn supported_modes(&self) -> Vec<ActionMode> {
        self.modes.clone()
    }

    async fn configure(&self, _kind: ActionKind, spec: Value) -> Result<ConfigureOutput> {
        let mut spec = spec;
        if let (Some((field, value)), Value::Object(map)) = (&self.configure_mutation, &mut spec) {
            map.insert(field.clone(), value.clone());
        }
        Ok(ConfigureOutput {
            spec,
            supported_modes: self.modes.clone(),
        })
    }

    async fn validate(&self, action: &ResolvedAction) -> Result<()> {
        self.record("validate", &action.key());
        Ok(())
    }

    async fn get_outputs(&self, action: &ResolvedAction) -> Result<Value> {
        let mut outputs = serde_json::Map::new();
        for key in &self.static_keys {
            outputs.insert(
                key.clone(),
                Value::String(format!("{}-{}", key, action.config.name)),
            );
        }
        Ok(Value::Object(outputs))
    }

    async fn get_status(&self, action: &ResolvedAction) -> Result<ActionStatus> {
        self.record("status", &action.key());
        self.pause().await;
        let mut statuses = self.statuses.lock();
        let queue = statuses.entry(action.key()).or_default();
        match queue.len() {
            0 => Ok(ActionStatus {
                state: ActionState::NotReady,
                detail: None,
                outputs: json!({}),
            }),
            1 => Ok(queue.front().expect("len checked").clone()),
            _ => Ok(queue.pop_front().expect("len checked")),
        }
    }

    async fn execute(&self, action: &ResolvedAction) -> Result<ExecuteOutput> {
        self.record("execute", &action.key());
        self.pause().await;
        let executes = self.executes.lock();
        match executes.get(&action.key()) {
            Some(ScriptedExecute::Fail { message }) => match action.config.kind {
                ActionKind::Build => Err(TrellisError::Build {
                    key: action.key(),
                    message: message.clone(),
                }),
                ActionKind::Deploy => Err(TrellisError::Deployment {
                    key: action.key(),
                    message: message.clone(),
                }),
                _ => Err(TrellisError::Runtime {
                    key: action.key(),
                    message: message.clone(),
                }),
            },
            Some(ScriptedExecute::Succeed { outputs, attached }) => Ok(ExecuteOutput {
                state: ActionState::Ready,
                outputs: outputs.clone(),
                attached: *attached,
            }),
            None => Ok(ExecuteOutput {
                state: ActionState::Ready,
                outputs: json!({}),
                attached: false,
            }),
        }
    }
}
