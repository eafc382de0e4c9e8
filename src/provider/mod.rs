//! Provider router
//!
//! The core never performs external effects itself; every build, deploy,
//! run, test, status query and output computation goes through a handler
//! registered for the action's type. Kinds are a sum type; behavior lives
//! in handler tables keyed by type name.

pub mod exec;
pub mod testing;

use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::action::{ActionKind, ActionMode, ActionStatus, ResolvedAction};
use crate::error::{Result, TrellisError};
use crate::schema::Schema;

/// Result of the `configure` handler: possibly-mutated spec plus the modes
/// the type supports.
#[derive(Debug, Clone)]
pub struct ConfigureOutput {
    pub spec: Value,
    pub supported_modes: Vec<ActionMode>,
}

/// Result of a kind-specific execute call
#[derive(Debug, Clone)]
pub struct ExecuteOutput {
    pub state: crate::action::ActionState,
    pub outputs: Value,
    /// Sync/local deploys signal that a background monitor should keep
    /// running after the task returns.
    pub attached: bool,
}

/// Handler for one action type. All calls are async; all failures are
/// `TrellisError`s with a stable kind.
#[async_trait]
pub trait ActionTypeHandler: Send + Sync {
    fn type_name(&self) -> &str;

    /// Base types this type extends, nearest first (for chain validation)
    fn base_types(&self) -> Vec<String> {
        Vec::new()
    }

    /// Schema for the action's `spec` field
    fn spec_schema(&self, kind: ActionKind) -> Schema;

    /// Output keys computable without executing the action
    fn static_output_keys(&self) -> Vec<String>;

    fn supported_modes(&self) -> Vec<ActionMode> {
        vec![ActionMode::Default]
    }

    /// Inspect and possibly mutate a partially resolved spec
    async fn configure(&self, kind: ActionKind, spec: Value) -> Result<ConfigureOutput>;

    /// Provider-side validation of a fully resolved action
    async fn validate(&self, action: &ResolvedAction) -> Result<()>;

    /// Compute static outputs for a resolved action
    async fn get_outputs(&self, action: &ResolvedAction) -> Result<Value>;

    /// Query current state; expected idempotent and side-effect-free
    async fn get_status(&self, action: &ResolvedAction) -> Result<ActionStatus>;

    /// The kind-specific execute call (build/deploy/run/test)
    async fn execute(&self, action: &ResolvedAction) -> Result<ExecuteOutput>;
}

impl std::fmt::Debug for dyn ActionTypeHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ActionTypeHandler").field(&self.type_name()).finish()
    }
}

/// Routes calls to the handler registered for an action type.
/// Reentrant; shared across the solver via Arc.
pub struct ProviderRouter {
    handlers: FxHashMap<String, Arc<dyn ActionTypeHandler>>,
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self {
            handlers: FxHashMap::default(),
        }
    }

    pub fn register(mut self, handler: Arc<dyn ActionTypeHandler>) -> Self {
        self.handlers.insert(handler.type_name().to_string(), handler);
        self
    }

    pub fn handler(&self, type_name: &str, key: &str) -> Result<Arc<dyn ActionTypeHandler>> {
        self.handlers
            .get(type_name)
            .cloned()
            .ok_or_else(|| TrellisError::UnknownActionType {
                type_name: type_name.to_string(),
                key: key.to_string(),
            })
    }

    /// Whether `output_key` is a static output of `type_name`.
    /// Unknown types report false; the resolve pipeline surfaces the
    /// unknown-type error later with better context.
    pub fn is_static_output(&self, type_name: &str, output_key: &str) -> bool {
        self.handlers
            .get(type_name)
            .is_some_and(|h| h.static_output_keys().iter().any(|k| k == output_key))
    }

    /// Spec schemas for a type and every base type it extends, own type
    /// first.
    pub fn schema_chain(&self, type_name: &str, kind: ActionKind, key: &str) -> Result<Vec<Schema>> {
        let handler = self.handler(type_name, key)?;
        let mut chain = vec![handler.spec_schema(kind)];
        for base in handler.base_types() {
            let base_handler = self.handler(&base, key)?;
            chain.push(base_handler.spec_schema(kind));
        }
        Ok(chain)
    }
}

impl Default for ProviderRouter {
    fn default() -> Self {
        Self::new()
    }
}
