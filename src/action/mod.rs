//! Action data model
//!
//! Actions are the unit of work: identified by `(kind, name)`, configured
//! from YAML, resolved on demand, executed through providers.

pub mod graph;
pub mod registry;

use std::fmt;
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Result, TrellisError};

/// The four action kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ActionKind {
    Build,
    Deploy,
    Run,
    Test,
}

impl ActionKind {
    pub const ALL: [ActionKind; 4] = [Self::Build, Self::Deploy, Self::Run, Self::Test];

    /// Lowercase form used in keys and template references
    pub fn key_part(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Deploy => "deploy",
            Self::Run => "run",
            Self::Test => "test",
        }
    }

    /// Runtime kinds may carry `build` / `copy_from` fields
    pub fn is_runtime(&self) -> bool {
        !matches!(self, Self::Build)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "build" | "Build" => Some(Self::Build),
            "deploy" | "Deploy" => Some(Self::Deploy),
            "run" | "Run" => Some(Self::Run),
            "test" | "Test" => Some(Self::Test),
            _ => None,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key_part())
    }
}

/// Execution mode, selected by pattern match against action keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionMode {
    #[default]
    Default,
    Sync,
    Local,
}

impl fmt::Display for ActionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::Sync => f.write_str("sync"),
            Self::Local => f.write_str("local"),
        }
    }
}

/// Reference to an action by kind and name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionRef {
    pub kind: ActionKind,
    pub name: String,
}

impl ActionRef {
    pub fn new(kind: ActionKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// Key form: `build.api`
    pub fn key(&self) -> String {
        format!("{}.{}", self.kind.key_part(), self.name)
    }

    /// Parse `build.api` form
    pub fn parse(s: &str) -> Result<Self> {
        let (kind_part, name) = s.split_once('.').ok_or_else(|| TrellisError::Parameter {
            name: s.to_string(),
            reason: "expected <kind>.<name>, e.g. build.api".into(),
        })?;
        let kind = ActionKind::parse(kind_part).ok_or_else(|| TrellisError::Parameter {
            name: s.to_string(),
            reason: format!("unknown action kind '{kind_part}'"),
        })?;
        Ok(Self::new(kind, name))
    }
}

impl fmt::Display for ActionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind.key_part(), self.name)
    }
}

/// A dependency edge from one action to another
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDependency {
    pub to: ActionRef,
    /// User-declared (vs inferred from template references)
    pub explicit: bool,
    /// The dependant needs the dependency resolved (static outputs)
    pub needs_static_outputs: bool,
    /// The dependant needs the dependency *executed* (runtime outputs)
    pub needs_executed_outputs: bool,
}

impl ActionDependency {
    pub fn explicit(to: ActionRef) -> Self {
        Self {
            to,
            explicit: true,
            needs_static_outputs: false,
            needs_executed_outputs: false,
        }
    }

    pub fn static_outputs(to: ActionRef) -> Self {
        Self {
            to,
            explicit: false,
            needs_static_outputs: true,
            needs_executed_outputs: false,
        }
    }

    pub fn executed_outputs(to: ActionRef) -> Self {
        Self {
            to,
            explicit: false,
            needs_static_outputs: false,
            needs_executed_outputs: true,
        }
    }

    /// Merge another edge to the same target; the stronger requirement wins
    /// (executed > static > explicit-only).
    pub fn absorb(&mut self, other: &ActionDependency) {
        self.explicit |= other.explicit;
        self.needs_static_outputs |= other.needs_static_outputs;
        self.needs_executed_outputs |= other.needs_executed_outputs;
    }
}

/// Internal metadata attached at load time
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ActionInternal {
    #[serde(default)]
    pub base_path: Option<Utf8PathBuf>,
    #[serde(default)]
    pub config_file_path: Option<Utf8PathBuf>,
    #[serde(default)]
    pub group_name: Option<String>,
}

/// An action config, immutable after load
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ActionConfig {
    pub kind: ActionKind,
    pub name: String,
    /// Plugin-specific type, e.g. "container"
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub disabled: bool,
    /// Explicit dependencies in `<kind>.<name>` form
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Build dependency for runtime kinds
    #[serde(default)]
    pub build: Option<String>,
    /// Build to copy staged sources from
    #[serde(default, rename = "copyFrom")]
    pub copy_from: Option<String>,
    /// Per-action timeout in seconds
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub include: Option<Vec<String>>,
    #[serde(default)]
    pub exclude: Option<Vec<String>>,
    /// Plugin-specific spec, validated against the type's schema
    #[serde(default = "crate::util::default_object")]
    pub spec: Value,
    /// Template inputs, resolved strictly before variables
    #[serde(default = "crate::util::default_object")]
    pub inputs: Value,
    #[serde(default = "crate::util::default_object")]
    pub variables: Value,
    #[serde(default)]
    pub varfiles: Vec<Utf8PathBuf>,
    #[serde(default)]
    pub internal: ActionInternal,
}

impl ActionConfig {
    pub fn reference(&self) -> ActionRef {
        ActionRef::new(self.kind, self.name.clone())
    }

    /// Registry key: `build.api`
    pub fn key(&self) -> String {
        self.reference().key()
    }

    /// Explicit dependency refs, parsed
    pub fn dependency_refs(&self) -> Result<Vec<ActionRef>> {
        self.dependencies.iter().map(|s| ActionRef::parse(s)).collect()
    }
}

/// Outcome state of a status query or execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionState {
    Ready,
    NotReady,
    Outdated,
    Missing,
    Unknown,
    Failed,
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ready => "ready",
            Self::NotReady => "not-ready",
            Self::Outdated => "outdated",
            Self::Missing => "missing",
            Self::Unknown => "unknown",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Status as reported by a provider
#[derive(Debug, Clone, PartialEq)]
pub struct ActionStatus {
    pub state: ActionState,
    pub detail: Option<String>,
    pub outputs: Value,
}

impl ActionStatus {
    pub fn ready() -> Self {
        Self {
            state: ActionState::Ready,
            detail: None,
            outputs: Value::Object(Default::default()),
        }
    }

    pub fn unknown() -> Self {
        Self {
            state: ActionState::Unknown,
            detail: None,
            outputs: Value::Object(Default::default()),
        }
    }
}

/// Tree version returned by the tree version provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeVersion {
    pub content_hash: String,
    pub files: Vec<String>,
}

impl TreeVersion {
    pub fn empty() -> Self {
        Self {
            content_hash: "empty".into(),
            files: Vec::new(),
        }
    }
}

/// A fully resolved action: evaluated spec, merged variables, static
/// outputs, tree version.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAction {
    pub config: Arc<ActionConfig>,
    pub mode: ActionMode,
    pub spec: Value,
    pub inputs: Value,
    pub variables: Value,
    pub static_outputs: Value,
    pub tree_version: TreeVersion,
}

impl ResolvedAction {
    pub fn reference(&self) -> ActionRef {
        self.config.reference()
    }

    pub fn key(&self) -> String {
        self.config.key()
    }

    /// Version string: content hash + resolved spec, hashed together.
    /// Stable across identical inputs; feeds cache decisions.
    pub fn version_string(&self) -> String {
        let spec_text = self.spec.to_string();
        let mut input = String::with_capacity(self.tree_version.content_hash.len() + spec_text.len());
        input.push_str(&self.tree_version.content_hash);
        input.push_str(&spec_text);
        format!("v-{:016x}", xxh3_64(input.as_bytes()))
    }
}

/// A resolved action that has been executed (or found ready)
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedAction {
    pub resolved: Arc<ResolvedAction>,
    pub state: ActionState,
    pub outputs: Value,
    /// Version of the action at execution time
    pub version: String,
}

impl ExecutedAction {
    pub fn key(&self) -> String {
        self.resolved.key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_ref_parse_and_key() {
        let r = ActionRef::parse("build.api").unwrap();
        assert_eq!(r.kind, ActionKind::Build);
        assert_eq!(r.name, "api");
        assert_eq!(r.key(), "build.api");
    }

    #[test]
    fn action_ref_parse_rejects_bad_forms() {
        assert!(ActionRef::parse("api").is_err());
        assert!(ActionRef::parse("widget.api").is_err());
    }

    #[test]
    fn config_deserializes_from_yaml() {
        let yaml = r#"
kind: Deploy
name: api
type: container
dependencies: [build.api]
build: api
timeout: 300
spec:
  image: "${actions.build.api.outputs.image-id}"
variables:
  replicas: 2
"#;
        let config: ActionConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.kind, ActionKind::Deploy);
        assert_eq!(config.key(), "deploy.api");
        assert_eq!(config.dependency_refs().unwrap().len(), 1);
        assert_eq!(config.timeout, Some(300));
        assert!(!config.disabled);
    }

    #[test]
    fn dependency_absorb_keeps_strongest() {
        let to = ActionRef::new(ActionKind::Build, "api");
        let mut edge = ActionDependency::explicit(to.clone());
        edge.absorb(&ActionDependency::static_outputs(to.clone()));
        edge.absorb(&ActionDependency::executed_outputs(to));

        assert!(edge.explicit);
        assert!(edge.needs_static_outputs);
        assert!(edge.needs_executed_outputs);
    }

    fn resolved_fixture(spec: Value, hash: &str) -> ResolvedAction {
        let config: ActionConfig = serde_yaml::from_str(
            "kind: Build\nname: api\ntype: container\n",
        )
        .unwrap();
        ResolvedAction {
            config: Arc::new(config),
            mode: ActionMode::Default,
            spec,
            inputs: json!({}),
            variables: json!({}),
            static_outputs: json!({}),
            tree_version: TreeVersion {
                content_hash: hash.into(),
                files: vec![],
            },
        }
    }

    #[test]
    fn version_string_is_stable_and_input_sensitive() {
        let a = resolved_fixture(json!({"image": "x"}), "h1");
        let b = resolved_fixture(json!({"image": "x"}), "h1");
        let c = resolved_fixture(json!({"image": "y"}), "h1");
        let d = resolved_fixture(json!({"image": "x"}), "h2");

        assert_eq!(a.version_string(), b.version_string());
        assert_ne!(a.version_string(), c.version_string());
        assert_ne!(a.version_string(), d.version_string());
        assert!(a.version_string().starts_with("v-"));
    }

    #[test]
    fn action_state_display_is_kebab() {
        assert_eq!(ActionState::NotReady.to_string(), "not-ready");
        assert_eq!(ActionState::Ready.to_string(), "ready");
    }
}
