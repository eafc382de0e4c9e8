//! Project configuration
//!
//! The project file (`trellis.yml`) declares environments, actions,
//! groups and workflows. CLI `--var` overrides merge last into the
//! variable stack.

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use serde_json::Value;

use crate::action::registry::{GroupConfig, ModeSelection};
use crate::action::ActionConfig;
use crate::error::{Result, TrellisError};
use crate::schema::{optional, required, Schema};
use crate::workflow::WorkflowConfig;

pub const PROJECT_FILE: &str = "trellis.yml";

#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default = "crate::util::default_object")]
    pub variables: Value,
}

#[derive(Debug, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default)]
    pub environments: Vec<EnvironmentConfig>,
    #[serde(default = "crate::util::default_object")]
    pub variables: Value,
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    #[serde(default)]
    pub workflows: Vec<WorkflowConfig>,
    #[serde(default)]
    pub modes: ModeSelection,
    #[serde(skip)]
    pub root: Utf8PathBuf,
}

impl ProjectConfig {
    /// Parse a project config from YAML text, validating the top-level
    /// shape with a caret-marked snippet on failure.
    pub fn parse(text: &str, root: &Utf8Path) -> Result<Self> {
        let raw: Value = serde_yaml::from_str(text).map_err(|e| {
            TrellisError::configuration(format!("failed to parse project config: {e}"))
        })?;
        project_schema().ensure_valid(&raw, Some(text))?;

        let mut config: ProjectConfig = serde_yaml::from_str(text).map_err(|e| {
            TrellisError::configuration(format!("failed to load project config: {e}"))
        })?;
        config.root = root.to_path_buf();

        // Stamp load-time metadata the registry and resolver rely on
        let config_path = root.join(PROJECT_FILE);
        for action in &mut config.actions {
            if action.internal.config_file_path.is_none() {
                action.internal.config_file_path = Some(config_path.clone());
            }
            if action.internal.base_path.is_none() {
                action.internal.base_path = Some(root.to_path_buf());
            }
        }
        Ok(config)
    }

    pub async fn load(root: &Utf8Path) -> Result<Self> {
        let path = root.join(PROJECT_FILE);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| TrellisError::Filesystem {
                path: path.to_string(),
                source,
            })?;
        Self::parse(&text, root)
    }

    pub fn environment(&self, name: &str) -> Result<&EnvironmentConfig> {
        self.environments
            .iter()
            .find(|env| env.name == name)
            .ok_or_else(|| TrellisError::Parameter {
                name: "--env".into(),
                reason: format!(
                    "unknown environment '{}'; known: {}",
                    name,
                    self.environments
                        .iter()
                        .map(|e| e.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            })
    }

    pub fn workflow(&self, name: &str) -> Result<&WorkflowConfig> {
        self.workflows
            .iter()
            .find(|w| w.name == name)
            .ok_or_else(|| {
                TrellisError::configuration(format!("workflow '{name}' is not defined"))
            })
    }

    /// Directory for trellis-managed files under the project root
    pub fn dot_dir(&self) -> Utf8PathBuf {
        self.root.join(crate::util::DOT_DIR)
    }
}

/// `--env name[.namespace]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentRef {
    pub name: String,
    pub namespace: Option<String>,
}

impl EnvironmentRef {
    pub fn parse(s: &str) -> Self {
        match s.split_once('.') {
            Some((name, namespace)) => Self {
                name: name.to_string(),
                namespace: Some(namespace.to_string()),
            },
            None => Self {
                name: s.to_string(),
                namespace: None,
            },
        }
    }
}

/// Parse `--var k=v[,k=v]` entries into a variable tree. Dotted keys nest;
/// values parse as JSON scalars where possible and stay strings otherwise.
pub fn parse_var_overrides(entries: &[String]) -> Result<Value> {
    let mut root = Value::Object(Default::default());

    for entry in entries {
        for pair in entry.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (key, raw_value) = pair.split_once('=').ok_or_else(|| TrellisError::Parameter {
                name: "--var".into(),
                reason: format!("expected key=value, got '{pair}'"),
            })?;
            let value: Value =
                serde_json::from_str(raw_value).unwrap_or(Value::String(raw_value.to_string()));

            let segments: Vec<&str> = key.split('.').collect();
            insert_nested_var(&mut root, &segments, &value, key)?;
        }
    }

    Ok(root)
}

/// Recursively descend `segments` into `cursor`, inserting `value` as a
/// leaf at the final segment, creating intermediate objects as needed.
fn insert_nested_var(cursor: &mut Value, segments: &[&str], value: &Value, key: &str) -> Result<()> {
    let map = cursor.as_object_mut().ok_or_else(|| TrellisError::Parameter {
        name: "--var".into(),
        reason: format!("'{key}' conflicts with an earlier scalar override"),
    })?;
    if segments.len() == 1 {
        map.insert(segments[0].to_string(), value.clone());
        Ok(())
    } else {
        let next = map
            .entry(segments[0].to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        insert_nested_var(next, &segments[1..], value, key)
    }
}

fn project_schema() -> Schema {
    Schema::object(vec![
        required("name", Schema::pattern("^[a-z][a-z0-9-]*$")),
        optional(
            "environments",
            Schema::array(
                Schema::object(vec![
                    required("name", Schema::string()),
                    optional("namespace", Schema::string()),
                    optional("variables", Schema::any()),
                ]),
            ),
        ),
        optional("variables", Schema::any()),
        optional("actions", Schema::array(Schema::any())),
        optional("groups", Schema::array(Schema::any())),
        optional("workflows", Schema::array(Schema::any())),
        optional(
            "modes",
            Schema::object(vec![
                optional("sync", Schema::array(Schema::string())),
                optional("local", Schema::array(Schema::string())),
            ]),
        ),
    ])
}
