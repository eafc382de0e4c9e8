//! Workflow runner
//!
//! A workflow is a named, ordered sequence of steps, each a command line
//! or a shell script, with `when` semantics layered on top (see
//! [`step`]). Step errors are recorded and the loop continues so that
//! `onError` and `always` steps still get their chance; the workflow as
//! a whole fails iff any step errored.

pub mod step;

pub use step::{should_be_dropped, StepConfig, StepErrors, StepWhen};

use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use camino::Utf8PathBuf;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::command::{CommandContext, CommandRegistry};
use crate::error::{Result, TrellisError};
use crate::event::{EventKind, EventLog};
use crate::template::{resolve_string, resolve_value, MapContext, ResolveMode};
use crate::util::{intern, SCRIPT_TIMEOUT};

/// A file written before the workflow's steps run. Data may be inline
/// (templated) or pulled from the secrets map.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowFile {
    pub path: Utf8PathBuf,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default, rename = "secretName")]
    pub secret_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "envVars")]
    pub env_vars: FxHashMap<String, String>,
    #[serde(default)]
    pub files: Vec<WorkflowFile>,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

/// Output of one executed step
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub number: usize,
    pub outputs: Value,
    pub log: String,
}

/// Aggregated workflow result
pub struct WorkflowResult {
    /// Executed steps in order, keyed by display name
    pub steps: Vec<(String, StepOutput)>,
    pub errors: Vec<TrellisError>,
}

impl WorkflowResult {
    pub fn failed(&self) -> bool {
        !self.errors.is_empty()
    }

    /// The wire shape: `{steps: {name: {number, outputs, log}}, errors?}`
    pub fn to_value(&self) -> Value {
        let mut steps = serde_json::Map::new();
        for (name, output) in &self.steps {
            steps.insert(
                name.clone(),
                json!({
                    "number": output.number,
                    "outputs": output.outputs,
                    "log": output.log,
                }),
            );
        }
        let mut root = serde_json::Map::new();
        root.insert("steps".into(), Value::Object(steps));
        if !self.errors.is_empty() {
            root.insert(
                "errors".into(),
                Value::Array(
                    self.errors
                        .iter()
                        .map(|e| Value::String(e.to_string()))
                        .collect(),
                ),
            );
        }
        Value::Object(root)
    }
}

pub struct WorkflowRunner {
    config: WorkflowConfig,
    registry: CommandRegistry,
    context: CommandContext,
    project_root: Utf8PathBuf,
    files_dir: Utf8PathBuf,
    secrets: FxHashMap<String, String>,
    event_log: EventLog,
}

impl WorkflowRunner {
    pub fn new(
        config: WorkflowConfig,
        registry: CommandRegistry,
        context: CommandContext,
        project_root: Utf8PathBuf,
        dot_dir: Utf8PathBuf,
        secrets: FxHashMap<String, String>,
        event_log: EventLog,
    ) -> Self {
        let files_dir = dot_dir.join("workflow-files").join(&config.name);
        Self {
            config,
            registry,
            context,
            project_root,
            files_dir,
            secrets,
            event_log,
        }
    }

    pub async fn run(&self) -> Result<WorkflowResult> {
        let workflow_start = Instant::now();
        info!(workflow = %self.config.name, steps = self.config.steps.len(), "starting workflow");

        for (index, step_config) in self.config.steps.iter().enumerate() {
            step_config.validate(index)?;
        }

        self.write_files().await?;

        // The merged environment applies to every script step
        let mut merged_env: FxHashMap<String, String> = std::env::vars().collect();
        merged_env.extend(self.config.env_vars.clone());

        let mut step_errors = StepErrors::default();
        let mut completed: Vec<(String, StepOutput)> = Vec::new();

        for (index, step_config) in self.config.steps.iter().enumerate() {
            let name = step_config.display_name(index);
            let step_name = intern(&name);

            if should_be_dropped(index, &self.config.steps, &step_errors) || step_config.skip {
                debug!(step = %name, skipped = step_config.skip, "dropping step");
                self.event_log.emit(EventKind::StepDropped {
                    step_name: Arc::clone(&step_name),
                });
                continue;
            }

            self.event_log.emit(EventKind::StepStarted {
                step_name: Arc::clone(&step_name),
                number: index + 1,
            });
            let step_start = Instant::now();

            let context = self.step_context(&completed);
            let outcome = self.run_step(step_config, &context, &merged_env).await;

            match outcome {
                Ok((outputs, log, errors)) => {
                    self.event_log.emit(EventKind::StepCompleted {
                        step_name: Arc::clone(&step_name),
                        outputs: outputs.clone(),
                        duration_ms: step_start.elapsed().as_millis() as u64,
                    });
                    completed.push((
                        name,
                        StepOutput {
                            number: index + 1,
                            outputs,
                            log,
                        },
                    ));
                    // Command-level errors are data; they fail the step
                    // without aborting the loop.
                    if !errors.is_empty() {
                        for error in &errors {
                            self.event_log.emit(EventKind::StepFailed {
                                step_name: Arc::clone(&step_name),
                                error: error.to_string(),
                            });
                        }
                        step_errors.insert(index, errors);
                    }
                }
                Err(error) => {
                    self.event_log.emit(EventKind::StepFailed {
                        step_name: Arc::clone(&step_name),
                        error: error.to_string(),
                    });
                    // A failed script still records its log snapshot
                    if let TrellisError::WorkflowScript {
                        stdout, exit_code, ..
                    } = &error
                    {
                        completed.push((
                            name,
                            StepOutput {
                                number: index + 1,
                                outputs: json!({"exitCode": exit_code}),
                                log: stdout.clone(),
                            },
                        ));
                    }
                    step_errors.insert(index, vec![error]);
                }
            }
        }

        let errors: Vec<TrellisError> = {
            let mut indexes: Vec<usize> = step_errors.keys().copied().collect();
            indexes.sort_unstable();
            indexes
                .into_iter()
                .flat_map(|i| step_errors.remove(&i).unwrap_or_default())
                .collect()
        };

        self.event_log.emit(EventKind::WorkflowCompleted {
            error_count: errors.len(),
            total_duration_ms: workflow_start.elapsed().as_millis() as u64,
        });
        info!(
            workflow = %self.config.name,
            errors = errors.len(),
            "workflow finished"
        );

        Ok(WorkflowResult {
            steps: completed,
            errors,
        })
    }

    /// Context for step templates: `steps.<name>.outputs` plus secrets
    fn step_context(&self, completed: &[(String, StepOutput)]) -> MapContext {
        let mut steps = serde_json::Map::new();
        for (name, output) in completed {
            steps.insert(
                name.clone(),
                json!({"outputs": output.outputs, "log": output.log}),
            );
        }
        let secrets: serde_json::Map<String, Value> = self
            .secrets
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        MapContext::from_branches(
            "workflow step context",
            vec![
                ("steps", Value::Object(steps)),
                ("secrets", Value::Object(secrets)),
            ],
        )
    }

    async fn run_step(
        &self,
        step_config: &StepConfig,
        context: &MapContext,
        merged_env: &FxHashMap<String, String>,
    ) -> Result<(Value, String, Vec<TrellisError>)> {
        if let Some(command_line) = &step_config.command {
            let resolved: Vec<String> = command_line
                .iter()
                .map(|arg| {
                    resolve_string(arg, context, ResolveMode::Strict).map(|value| match value {
                        Value::String(s) => s,
                        other => other.to_string(),
                    })
                })
                .collect::<Result<_>>()?;

            let (command, invocation) = self.registry.dispatch(&resolved)?;
            if command.maybe_persistent(&invocation) {
                return Err(TrellisError::PersistentCommand {
                    name: command.name().to_string(),
                });
            }
            let result = command.run(&invocation, &self.context).await;
            return Ok((result.result, String::new(), result.errors));
        }

        let script = step_config
            .script
            .as_ref()
            .expect("validated: command xor script");
        let resolved = resolve_string(script, context, ResolveMode::Strict)?;
        let script_text = match resolved {
            Value::String(s) => s,
            other => other.to_string(),
        };

        let mut env = merged_env.clone();
        env.extend(step_config.env_vars.clone());
        let (stdout, _stderr) = self.run_script(&script_text, &env).await?;
        Ok((json!({"log": stdout}), stdout, Vec::new()))
    }

    async fn run_script(
        &self,
        script: &str,
        env: &FxHashMap<String, String>,
    ) -> Result<(String, String)> {
        let output = tokio::time::timeout(
            SCRIPT_TIMEOUT,
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(script)
                .current_dir(&self.project_root)
                .env_clear()
                .envs(env)
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| TrellisError::WorkflowScript {
            exit_code: -1,
            stdout: String::new(),
            stderr: format!("script timed out after {}s", SCRIPT_TIMEOUT.as_secs()),
        })?
        .map_err(|source| TrellisError::Filesystem {
            path: self.project_root.to_string(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();

        if !output.status.success() {
            return Err(TrellisError::WorkflowScript {
                exit_code: output.status.code().unwrap_or(-1),
                stdout,
                stderr,
            });
        }
        Ok((stdout, stderr))
    }

    /// Write configured files, resolving templates against the secrets map
    async fn write_files(&self) -> Result<()> {
        for file in &self.config.files {
            let data = match (&file.data, &file.secret_name) {
                (Some(data), _) => {
                    let context = self.step_context(&[]);
                    match resolve_value(
                        &Value::String(data.clone()),
                        &context,
                        ResolveMode::Strict,
                    )? {
                        Value::String(s) => s,
                        other => other.to_string(),
                    }
                }
                (None, Some(secret_name)) => self
                    .secrets
                    .get(secret_name)
                    .cloned()
                    .ok_or_else(|| {
                        TrellisError::configuration(format!(
                            "workflow file {} references unknown secret '{}'",
                            file.path, secret_name
                        ))
                    })?,
                (None, None) => {
                    return Err(TrellisError::configuration(format!(
                        "workflow file {} needs data or secretName",
                        file.path
                    )))
                }
            };

            let target = if file.path.is_absolute() {
                file.path.clone()
            } else {
                self.files_dir.join(&file.path)
            };
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|source| {
                    TrellisError::Filesystem {
                        path: parent.to_string(),
                        source,
                    }
                })?;
            }
            tokio::fs::write(&target, data)
                .await
                .map_err(|source| TrellisError::Filesystem {
                    path: target.to_string(),
                    source,
                })?;
        }
        Ok(())
    }
}
