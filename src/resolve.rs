//! Resolve pipeline
//!
//! Turns a raw action config into a fully resolved action:
//!
//! 1. Dependency outputs are collected by the caller (resolved actions for
//!    static needs, executed actions for runtime needs).
//! 2. An action-spec context is assembled over `var`/`variables`,
//!    `inputs`, `actions.<kind>.<name>.outputs.*` and `environment.*`.
//! 3. `inputs` resolve strictly.
//! 4. Group variables resolve, then action variables against the merged
//!    group vars; merge order is group < action < CLI overrides (deep,
//!    later wins per leaf).
//! 5. Builtin config fields resolve strictly and re-validate.
//! 6. The spec resolves partially, goes through the provider `configure`
//!    handler, then resolves strictly.
//! 7. The resolved spec validates against the type's schema and every
//!    base type schema in its chain.
//! 8. Static outputs come from the router, get validated, and attach.
//!
//! The pipeline is pure aside from the supplied router and tree provider;
//! identical inputs resolve to an equal `ResolvedAction`.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use tracing::instrument;

use crate::action::registry::ActionRegistry;
use crate::action::{ActionConfig, ExecutedAction, ResolvedAction, TreeVersion};
use crate::config::EnvironmentConfig;
use crate::error::{Result, TrellisError};
use crate::provider::ProviderRouter;
use crate::schema::{optional, required, Schema};
use crate::template::{
    actions_branch, resolve_value, LayeredContext, MapContext, ResolveMode,
};
use crate::tree::{TreeVersionProvider, TreeVersionRequest};
use crate::util::merge_deep;

/// Dependency outputs visible to an action being resolved
#[derive(Default, Clone)]
pub struct DependencyOutputs {
    entries: FxHashMap<(String, String), Value>,
}

impl DependencyOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Static outputs from a resolved (not executed) dependency
    pub fn add_resolved(&mut self, action: &ResolvedAction) {
        self.entries.insert(
            (
                action.config.kind.key_part().to_string(),
                action.config.name.clone(),
            ),
            action.static_outputs.clone(),
        );
    }

    /// Runtime outputs from an executed dependency. Static outputs merge
    /// underneath so both stay addressable.
    pub fn add_executed(&mut self, action: &ExecutedAction) {
        let mut outputs = action.resolved.static_outputs.clone();
        merge_deep(&mut outputs, &action.outputs);
        self.entries.insert(
            (
                action.resolved.config.kind.key_part().to_string(),
                action.resolved.config.name.clone(),
            ),
            outputs,
        );
    }

    fn to_branch(&self) -> Value {
        actions_branch(&self.entries)
    }
}

pub struct ActionResolver {
    router: Arc<ProviderRouter>,
    tree_versions: Arc<dyn TreeVersionProvider>,
    registry: Arc<ActionRegistry>,
    environment: EnvironmentConfig,
    project_variables: Value,
    cli_overrides: Value,
}

impl ActionResolver {
    pub fn new(
        router: Arc<ProviderRouter>,
        tree_versions: Arc<dyn TreeVersionProvider>,
        registry: Arc<ActionRegistry>,
        environment: EnvironmentConfig,
        project_variables: Value,
        cli_overrides: Value,
    ) -> Self {
        Self {
            router,
            tree_versions,
            registry,
            environment,
            project_variables,
            cli_overrides,
        }
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    #[instrument(skip(self, deps), fields(action = %config.key()))]
    pub async fn resolve(
        &self,
        config: Arc<ActionConfig>,
        deps: &DependencyOutputs,
    ) -> Result<ResolvedAction> {
        let key = config.key();
        let handler = self.router.handler(&config.type_name, &key)?;

        // Base variable stack: project < environment
        let mut base_variables = or_empty(&self.project_variables);
        merge_deep(&mut base_variables, &or_empty(&self.environment.variables));

        let environment_branch = json!({
            "name": self.environment.name,
            "namespace": self.environment.namespace,
        });
        let actions = deps.to_branch();

        // Step 3: inputs resolve strictly against the base context
        let base_context = self.spec_context(
            &base_variables,
            &Value::Object(Default::default()),
            &actions,
            &environment_branch,
        );
        let inputs = resolve_value(&or_empty(&config.inputs), &base_context, ResolveMode::Strict)?;

        // Step 4: variables. Group vars resolve against the base stack;
        // action vars then resolve against a context whose var branch is
        // the merged group vars (so a reference to a shared key sees the
        // group value), and the evaluated action vars re-merge over the
        // group vars. CLI overrides land last.
        let mut variables = base_variables.clone();
        if let Some(group_name) = &config.internal.group_name {
            if let Some(group) = self.registry.group(group_name) {
                let group_context =
                    self.spec_context(&variables, &inputs, &actions, &environment_branch);
                let group_vars =
                    resolve_value(&or_empty(&group.variables), &group_context, ResolveMode::Strict)?;
                merge_deep(&mut variables, &group_vars);
            }
        }
        let action_var_context =
            self.spec_context(&variables, &inputs, &actions, &environment_branch);
        let action_vars = resolve_value(
            &or_empty(&config.variables),
            &action_var_context,
            ResolveMode::Strict,
        )?;
        merge_deep(&mut variables, &action_vars);
        merge_deep(&mut variables, &or_empty(&self.cli_overrides));

        let context = self.spec_context(&variables, &inputs, &actions, &environment_branch);

        // Step 5: builtin fields re-validate after strict resolution
        let builtin = json!({
            "kind": config.kind,
            "name": config.name,
            "type": config.type_name,
            "dependencies": config.dependencies,
            "timeout": config.timeout,
            "include": config.include,
            "exclude": config.exclude,
        });
        let builtin = resolve_value(&builtin, &context, ResolveMode::Strict)?;
        builtin_schema().ensure_valid(&builtin, None)?;

        // Step 6: partial -> configure -> strict
        let partial_spec = resolve_value(&config.spec, &context, ResolveMode::Partial)?;
        let configured = handler.configure(config.kind, partial_spec.clone()).await?;
        let spec = resolve_value(&configured.spec, &context, ResolveMode::Strict)?;

        // Non-templatable fields must survive configure untouched
        let schema_chain = self.router.schema_chain(&config.type_name, config.kind, &key)?;
        for type_schema in &schema_chain {
            for path in type_schema.no_template_paths() {
                let before = value_at(&partial_spec, &path);
                let after = value_at(&configured.spec, &path);
                if before != after {
                    return Err(TrellisError::NoTemplateFieldChanged {
                        key: key.clone(),
                        field: path,
                    });
                }
            }
        }

        // Step 7: schema chain validation
        for type_schema in &schema_chain {
            type_schema.ensure_valid(&spec, None)?;
        }

        let mode = self.registry.mode_for(&key);
        let tree_version = self.tree_version_for(&config).await?;

        let mut resolved = ResolvedAction {
            config: Arc::clone(&config),
            mode,
            spec,
            inputs,
            variables,
            static_outputs: Value::Object(Default::default()),
            tree_version,
        };

        // Provider-side validation of the resolved action
        handler.validate(&resolved).await?;

        // Step 8: static outputs, validated against the declared keys
        let static_outputs = handler.get_outputs(&resolved).await?;
        let declared = handler.static_output_keys();
        if let Value::Object(map) = &static_outputs {
            if let Some(unknown) = map.keys().find(|k| !declared.contains(k)) {
                return Err(TrellisError::Plugin {
                    key: key.clone(),
                    message: format!(
                        "getOutputs returned undeclared static output '{unknown}'"
                    ),
                });
            }
        } else {
            return Err(TrellisError::Plugin {
                key,
                message: "getOutputs must return an object".into(),
            });
        }
        resolved.static_outputs = static_outputs;

        Ok(resolved)
    }

    fn spec_context(
        &self,
        variables: &Value,
        inputs: &Value,
        actions: &Value,
        environment: &Value,
    ) -> LayeredContext {
        LayeredContext::new().push(Arc::new(MapContext::from_branches(
            "action spec context",
            vec![
                ("var", variables.clone()),
                ("variables", variables.clone()),
                ("inputs", inputs.clone()),
                ("actions", actions.clone()),
                ("environment", environment.clone()),
            ],
        )))
    }

    async fn tree_version_for(&self, config: &ActionConfig) -> Result<TreeVersion> {
        let (Some(config_file_path), Some(base_path)) = (
            config.internal.config_file_path.clone(),
            config.internal.base_path.clone(),
        ) else {
            return Ok(TreeVersion::empty());
        };
        self.tree_versions
            .get_tree_version(&TreeVersionRequest {
                config_file_path,
                scan_root: base_path,
            })
            .await
    }
}

/// Schema for the builtin declaration fields shared by all kinds
fn builtin_schema() -> Schema {
    Schema::object(vec![
        required("kind", Schema::string().no_template()),
        required("name", Schema::pattern("^[a-z][a-z0-9-]*$").no_template()),
        required("type", Schema::string().no_template()),
        optional(
            "dependencies",
            Schema::array(Schema::pattern(
                "^(build|deploy|run|test)\\.[a-z][a-z0-9-]*$",
            )),
        ),
        optional("timeout", Schema::number()),
        optional("include", Schema::array(Schema::posix_path())),
        optional("exclude", Schema::array(Schema::posix_path())),
    ])
    .allow_unknown()
}

fn or_empty(value: &Value) -> Value {
    if value.is_null() {
        Value::Object(Default::default())
    } else {
        value.clone()
    }
}

fn value_at<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::registry::{GroupConfig, ModeSelection};
    use crate::action::{ActionKind, ActionMode};
    use crate::provider::testing::ScriptedHandler;
    use crate::tree::StaticTreeVersions;

    fn environment() -> EnvironmentConfig {
        EnvironmentConfig {
            name: "staging".into(),
            namespace: Some("team-a".into()),
            variables: json!({"region": "eu-west-1"}),
        }
    }

    fn action_yaml(extra: &str) -> Arc<ActionConfig> {
        let yaml = format!("kind: Deploy\nname: api\ntype: container\n{extra}");
        Arc::new(serde_yaml::from_str(&yaml).unwrap())
    }

    fn resolver_with(
        handler: ScriptedHandler,
        configs: Vec<Arc<ActionConfig>>,
        groups: Vec<GroupConfig>,
        cli_overrides: Value,
    ) -> ActionResolver {
        let registry = Arc::new(
            ActionRegistry::build(
                configs.iter().map(|c| (**c).clone()).collect(),
                groups,
                &ModeSelection::default(),
                None,
            )
            .unwrap(),
        );
        ActionResolver::new(
            Arc::new(ProviderRouter::new().register(Arc::new(handler))),
            Arc::new(StaticTreeVersions::new(TreeVersion {
                content_hash: "treehash".into(),
                files: vec!["src/main.go".into()],
            })),
            registry,
            environment(),
            json!({"replicas": 1, "owner": "platform"}),
            cli_overrides,
        )
    }

    #[tokio::test]
    async fn resolves_spec_against_environment_and_variables() {
        let config = action_yaml(
            "spec:\n  region: \"${var.region}\"\n  env: \"${environment.name}\"\n",
        );
        let resolver = resolver_with(
            ScriptedHandler::new("container"),
            vec![Arc::clone(&config)],
            vec![],
            json!({}),
        );

        let resolved = resolver
            .resolve(config, &DependencyOutputs::new())
            .await
            .unwrap();
        assert_eq!(resolved.spec["region"], "eu-west-1");
        assert_eq!(resolved.spec["env"], "staging");
        assert_eq!(resolved.tree_version.content_hash, "treehash");
    }

    #[tokio::test]
    async fn variable_precedence_group_action_cli() {
        let mut config = (*action_yaml(
            "variables:\n  a: from-action\n  b: from-action\n",
        ))
        .clone();
        config.internal.group_name = Some("backend".into());
        let config = Arc::new(config);

        let group = GroupConfig {
            name: "backend".into(),
            variables: json!({"a": "from-group", "b": "from-group", "c": "from-group"}),
            varfiles: vec![],
        };
        let resolver = resolver_with(
            ScriptedHandler::new("container"),
            vec![Arc::clone(&config)],
            vec![group],
            json!({"b": "from-cli"}),
        );

        let resolved = resolver
            .resolve(config, &DependencyOutputs::new())
            .await
            .unwrap();

        // group < action < CLI, last non-undefined wins per leaf
        assert_eq!(resolved.variables["a"], "from-action");
        assert_eq!(resolved.variables["b"], "from-cli");
        assert_eq!(resolved.variables["c"], "from-group");
    }

    #[tokio::test]
    async fn action_variable_referencing_shared_key_sees_group_value() {
        let mut config = (*action_yaml(
            "variables:\n  tag: \"${var.tag}-patched\"\n",
        ))
        .clone();
        config.internal.group_name = Some("backend".into());
        let config = Arc::new(config);

        let group = GroupConfig {
            name: "backend".into(),
            variables: json!({"tag": "v1"}),
            varfiles: vec![],
        };
        let resolver = resolver_with(
            ScriptedHandler::new("container"),
            vec![Arc::clone(&config)],
            vec![group],
            json!({}),
        );

        let resolved = resolver
            .resolve(config, &DependencyOutputs::new())
            .await
            .unwrap();
        // The reference evaluated against the group value, then the
        // evaluated action var won the merge.
        assert_eq!(resolved.variables["tag"], "v1-patched");
    }

    #[tokio::test]
    async fn dependency_outputs_are_addressable() {
        let config = action_yaml(
            "spec:\n  image: \"${actions.build.api.outputs.image-id}\"\n",
        );
        let build_config: Arc<ActionConfig> = Arc::new(
            serde_yaml::from_str("kind: Build\nname: api\ntype: container\n").unwrap(),
        );
        let resolver = resolver_with(
            ScriptedHandler::new("container").with_static_output_keys(["image-id"]),
            vec![Arc::clone(&config), Arc::clone(&build_config)],
            vec![],
            json!({}),
        );

        let build_resolved = resolver
            .resolve(build_config, &DependencyOutputs::new())
            .await
            .unwrap();
        assert_eq!(build_resolved.static_outputs["image-id"], "image-id-api");

        let mut deps = DependencyOutputs::new();
        deps.add_resolved(&build_resolved);
        let resolved = resolver.resolve(config, &deps).await.unwrap();
        assert_eq!(resolved.spec["image"], "image-id-api");
    }

    #[tokio::test]
    async fn unresolved_strict_reference_fails() {
        let config = action_yaml("spec:\n  image: \"${actions.build.api.outputs.image-id}\"\n");
        let resolver = resolver_with(
            ScriptedHandler::new("container"),
            vec![Arc::clone(&config)],
            vec![],
            json!({}),
        );

        let err = resolver
            .resolve(config, &DependencyOutputs::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TRL-020");
    }

    #[tokio::test]
    async fn configure_mutating_no_template_field_is_plugin_error() {
        let schema = Schema::object(vec![
            required("image", Schema::string().no_template()),
        ])
        .allow_unknown();
        let config = action_yaml("spec:\n  image: nginx\n");
        let resolver = resolver_with(
            ScriptedHandler::new("container")
                .with_spec_schema(schema)
                .with_configure_mutation("image", json!("mutated")),
            vec![Arc::clone(&config)],
            vec![],
            json!({}),
        );

        let err = resolver
            .resolve(config, &DependencyOutputs::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TRL-041");
    }

    #[tokio::test]
    async fn spec_schema_violation_is_validation_error() {
        let schema = Schema::object(vec![required("image", Schema::string())]);
        let config = action_yaml("spec:\n  image: 42\n");
        let resolver = resolver_with(
            ScriptedHandler::new("container").with_spec_schema(schema),
            vec![Arc::clone(&config)],
            vec![],
            json!({}),
        );

        let err = resolver
            .resolve(config, &DependencyOutputs::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TRL-010");
    }

    #[tokio::test]
    async fn resolving_twice_yields_equal_actions() {
        let config = action_yaml("spec:\n  region: \"${var.region}\"\n");
        let resolver = resolver_with(
            ScriptedHandler::new("container"),
            vec![Arc::clone(&config)],
            vec![],
            json!({}),
        );

        let first = resolver
            .resolve(Arc::clone(&config), &DependencyOutputs::new())
            .await
            .unwrap();
        let second = resolver
            .resolve(config, &DependencyOutputs::new())
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.version_string(), second.version_string());
    }

    #[tokio::test]
    async fn mode_is_taken_from_registry() {
        let config = action_yaml("");
        let registry = Arc::new(
            ActionRegistry::build(
                vec![(*config).clone()],
                vec![],
                &ModeSelection {
                    sync: vec!["deploy.api".into()],
                    local: vec![],
                },
                None,
            )
            .unwrap(),
        );
        let resolver = ActionResolver::new(
            Arc::new(ProviderRouter::new().register(Arc::new(ScriptedHandler::new("container")))),
            Arc::new(StaticTreeVersions::empty()),
            registry,
            environment(),
            json!({}),
            json!({}),
        );

        let resolved = resolver
            .resolve(config, &DependencyOutputs::new())
            .await
            .unwrap();
        assert_eq!(resolved.mode, ActionMode::Sync);
        assert_eq!(resolved.config.kind, ActionKind::Deploy);
    }
}
