//! Local exec provider
//!
//! The one built-in action type: runs commands on the local machine.
//! Everything else (container engines, cluster APIs) lives in external
//! providers; this handler exists so a project is runnable out of the
//! box and doubles as the reference handler implementation.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::action::{ActionKind, ActionMode, ActionState, ActionStatus, ResolvedAction};
use crate::error::{Result, TrellisError};
use crate::schema::{optional, required, Schema};

use super::{ActionTypeHandler, ConfigureOutput, ExecuteOutput};

/// Exec commands get a generous but bounded window
const EXEC_TIMEOUT: Duration = Duration::from_secs(600);

pub struct ExecHandler;

impl ExecHandler {
    async fn run_command(
        &self,
        action: &ResolvedAction,
        argv: &[String],
    ) -> Result<(i32, String, String)> {
        let Some((program, args)) = argv.split_first() else {
            return Err(TrellisError::Plugin {
                key: action.key(),
                message: "exec spec has an empty command".into(),
            });
        };

        let cwd = action
            .config
            .internal
            .base_path
            .clone()
            .unwrap_or_else(|| ".".into());

        let env: Vec<(String, String)> = action
            .spec
            .get("env")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .map(|(k, v)| {
                        let value = match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (k.clone(), value)
                    })
                    .collect()
            })
            .unwrap_or_default();

        let output = tokio::time::timeout(
            EXEC_TIMEOUT,
            tokio::process::Command::new(program)
                .args(args)
                .current_dir(&cwd)
                .envs(env)
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| TrellisError::Timeout {
            node_key: action.key(),
            timeout_secs: EXEC_TIMEOUT.as_secs(),
        })?
        .map_err(|e| TrellisError::Runtime {
            key: action.key(),
            message: format!("failed to spawn '{program}': {e}"),
        })?;

        Ok((
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
            String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
        ))
    }

    fn argv(action: &ResolvedAction, field: &str) -> Option<Vec<String>> {
        action.spec.get(field).and_then(Value::as_array).map(|items| {
            items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
    }
}

#[async_trait]
impl ActionTypeHandler for ExecHandler {
    fn type_name(&self) -> &str {
        "exec"
    }

    fn spec_schema(&self, _kind: ActionKind) -> Schema {
        Schema::object(vec![
            required("command", Schema::array(Schema::string())),
            optional("statusCommand", Schema::array(Schema::string())),
            optional("env", Schema::object(vec![]).allow_unknown()),
        ])
    }

    fn static_output_keys(&self) -> Vec<String> {
        Vec::new()
    }

    fn supported_modes(&self) -> Vec<ActionMode> {
        vec![ActionMode::Default]
    }

    async fn configure(&self, _kind: ActionKind, spec: Value) -> Result<ConfigureOutput> {
        Ok(ConfigureOutput {
            spec,
            supported_modes: self.supported_modes(),
        })
    }

    async fn validate(&self, _action: &ResolvedAction) -> Result<()> {
        Ok(())
    }

    async fn get_outputs(&self, _action: &ResolvedAction) -> Result<Value> {
        Ok(Value::Object(Default::default()))
    }

    /// Without a statusCommand the state is unknown and the action runs.
    async fn get_status(&self, action: &ResolvedAction) -> Result<ActionStatus> {
        let Some(argv) = Self::argv(action, "statusCommand") else {
            return Ok(ActionStatus::unknown());
        };
        let (exit_code, stdout, _stderr) = self.run_command(action, &argv).await?;
        Ok(ActionStatus {
            state: if exit_code == 0 {
                ActionState::Ready
            } else {
                ActionState::NotReady
            },
            detail: None,
            outputs: json!({"log": stdout}),
        })
    }

    async fn execute(&self, action: &ResolvedAction) -> Result<ExecuteOutput> {
        let argv = Self::argv(action, "command").ok_or_else(|| TrellisError::Plugin {
            key: action.key(),
            message: "exec spec is missing command".into(),
        })?;
        let (exit_code, stdout, stderr) = self.run_command(action, &argv).await?;

        if exit_code != 0 {
            let message = format!("command exited with {exit_code}: {stderr}");
            return Err(match action.config.kind {
                ActionKind::Build => TrellisError::Build {
                    key: action.key(),
                    message,
                },
                ActionKind::Deploy => TrellisError::Deployment {
                    key: action.key(),
                    message,
                },
                _ => TrellisError::Runtime {
                    key: action.key(),
                    message,
                },
            });
        }

        Ok(ExecuteOutput {
            state: ActionState::Ready,
            outputs: json!({"log": stdout, "exitCode": exit_code}),
            attached: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionConfig, TreeVersion};
    use std::sync::Arc;

    fn action(spec: Value) -> ResolvedAction {
        let config: ActionConfig =
            serde_yaml::from_str("kind: Run\nname: hello\ntype: exec\n").unwrap();
        ResolvedAction {
            config: Arc::new(config),
            mode: ActionMode::Default,
            spec,
            inputs: json!({}),
            variables: json!({}),
            static_outputs: json!({}),
            tree_version: TreeVersion::empty(),
        }
    }

    #[tokio::test]
    async fn execute_captures_stdout() {
        let handler = ExecHandler;
        let output = handler
            .execute(&action(json!({"command": ["echo", "hello"]})))
            .await
            .unwrap();
        assert_eq!(output.state, ActionState::Ready);
        assert_eq!(output.outputs["log"], "hello");
    }

    #[tokio::test]
    async fn non_zero_exit_is_runtime_error() {
        let handler = ExecHandler;
        let err = handler
            .execute(&action(json!({"command": ["sh", "-c", "exit 7"]})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited with 7"));
    }

    #[tokio::test]
    async fn status_without_probe_is_unknown() {
        let handler = ExecHandler;
        let status = handler
            .get_status(&action(json!({"command": ["true"]})))
            .await
            .unwrap();
        assert_eq!(status.state, ActionState::Unknown);
    }

    #[tokio::test]
    async fn status_probe_maps_exit_code() {
        let handler = ExecHandler;
        let ready = handler
            .get_status(&action(
                json!({"command": ["true"], "statusCommand": ["true"]}),
            ))
            .await
            .unwrap();
        assert_eq!(ready.state, ActionState::Ready);

        let stale = handler
            .get_status(&action(
                json!({"command": ["true"], "statusCommand": ["false"]}),
            ))
            .await
            .unwrap();
        assert_eq!(stale.state, ActionState::NotReady);
    }

    #[tokio::test]
    async fn empty_command_is_plugin_error() {
        let handler = ExecHandler;
        let err = handler
            .execute(&action(json!({"command": []})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TRL-040");
    }
}
