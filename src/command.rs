//! Command dispatch
//!
//! Workflow `command:` steps parse their argv like a CLI line, bind
//! args/opts, and invoke a builtin command. Commands that may run
//! persistently (watch modes, followed logs) are rejected outside the
//! interactive entry point. Command-level errors are returned in the
//! result rather than thrown, so the caller decides policy.

use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{json, Value};

use crate::action::{ActionKind, ActionRef};
use crate::error::{Result, TrellisError};
use crate::solver::TaskGraphSolver;
use crate::tasks::TaskFactory;

/// Parsed command invocation: positional args, `--key=value` opts, and
/// bare `--flag`s.
#[derive(Debug, Default, Clone)]
pub struct Invocation {
    pub args: Vec<String>,
    pub opts: FxHashMap<String, String>,
    pub flags: FxHashSet<String>,
}

impl Invocation {
    /// Parse everything after the command name
    pub fn parse(argv: &[String]) -> Self {
        let mut invocation = Invocation::default();
        for token in argv {
            if let Some(rest) = token.strip_prefix("--") {
                match rest.split_once('=') {
                    Some((key, value)) => {
                        invocation.opts.insert(key.to_string(), value.to_string());
                    }
                    None => {
                        invocation.flags.insert(rest.to_string());
                    }
                }
            } else {
                invocation.args.push(token.clone());
            }
        }
        invocation
    }

    pub fn has_flag(&self, name: &str) -> bool {
        self.flags.contains(name)
    }
}

/// Everything a command needs to run actions
pub struct CommandContext {
    pub factory: Arc<TaskFactory>,
    pub solver: Arc<TaskGraphSolver>,
    pub force: bool,
}

/// Result of a command run. Errors are data, not control flow; the caller
/// (workflow, server) decides what a failure means.
#[derive(Debug)]
pub struct CommandResult {
    pub result: Value,
    pub errors: Vec<TrellisError>,
}

impl CommandResult {
    pub fn ok(result: Value) -> Self {
        Self {
            result,
            errors: Vec::new(),
        }
    }
}

#[async_trait]
pub trait Command: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this invocation may run indefinitely. Persistent commands
    /// only run from the interactive session.
    fn maybe_persistent(&self, _invocation: &Invocation) -> bool {
        false
    }

    async fn run(&self, invocation: &Invocation, ctx: &CommandContext) -> CommandResult;
}

impl std::fmt::Debug for dyn Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Command").field(&self.name()).finish()
    }
}

/// One command per action kind: `build <name>...`, `deploy <name>...`, ...
struct KindCommand {
    kind: ActionKind,
}

#[async_trait]
impl Command for KindCommand {
    fn name(&self) -> &'static str {
        self.kind.key_part()
    }

    fn maybe_persistent(&self, invocation: &Invocation) -> bool {
        // A deploy explicitly requested in sync or local mode keeps a
        // monitor attached and never returns on its own.
        self.kind == ActionKind::Deploy
            && (invocation.has_flag("sync") || invocation.has_flag("local"))
    }

    async fn run(&self, invocation: &Invocation, ctx: &CommandContext) -> CommandResult {
        let mut errors = Vec::new();
        let mut requests = Vec::new();
        let status_only = invocation.has_flag("status-only");

        for name in &invocation.args {
            let reference = ActionRef::new(self.kind, name.clone());
            match ctx.factory.request(&reference, ctx.force, status_only) {
                Ok(request) => requests.push(request),
                Err(err) => errors.push(err),
            }
        }
        if requests.is_empty() && errors.is_empty() {
            errors.push(TrellisError::Parameter {
                name: self.name().to_string(),
                reason: "expected at least one action name".into(),
            });
        }
        if !errors.is_empty() {
            return CommandResult {
                result: Value::Null,
                errors,
            };
        }

        let outcome = ctx.solver.solve(requests).await;
        let mut results = serde_json::Map::new();
        for entry in &outcome.results {
            results.insert(
                entry.task_key.to_string(),
                json!({
                    "success": entry.result.success(),
                    "aborted": entry.result.aborted,
                    "output": entry.result.output.as_ref().map(|o| o.to_value()),
                }),
            );
            if let Some(error) = &entry.result.error {
                errors.push(TrellisError::Runtime {
                    key: entry.task_key.to_string(),
                    message: error.to_string(),
                });
            }
        }

        CommandResult {
            result: Value::Object(results),
            errors,
        }
    }
}

/// Minimal log access; following logs is a persistent operation.
struct LogsCommand;

#[async_trait]
impl Command for LogsCommand {
    fn name(&self) -> &'static str {
        "logs"
    }

    fn maybe_persistent(&self, invocation: &Invocation) -> bool {
        invocation.has_flag("follow")
    }

    async fn run(&self, _invocation: &Invocation, ctx: &CommandContext) -> CommandResult {
        CommandResult::ok(ctx.solver.event_log().to_json())
    }
}

pub struct CommandRegistry {
    commands: FxHashMap<&'static str, Arc<dyn Command>>,
}

impl CommandRegistry {
    /// Registry of builtin commands
    pub fn builtin() -> Self {
        let mut commands: FxHashMap<&'static str, Arc<dyn Command>> = FxHashMap::default();
        for kind in ActionKind::ALL {
            let command = Arc::new(KindCommand { kind });
            commands.insert(command.name(), command);
        }
        let logs = Arc::new(LogsCommand);
        commands.insert(logs.name(), logs);
        Self { commands }
    }

    /// Parse a workflow step's argv into a command and its invocation
    pub fn dispatch(&self, argv: &[String]) -> Result<(Arc<dyn Command>, Invocation)> {
        let Some((name, rest)) = argv.split_first() else {
            return Err(TrellisError::Parameter {
                name: "command".into(),
                reason: "empty command".into(),
            });
        };
        let command =
            self.commands
                .get(name.as_str())
                .cloned()
                .ok_or_else(|| TrellisError::UnknownCommand {
                    name: name.clone(),
                })?;
        Ok((command, Invocation::parse(rest)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn invocation_parses_args_opts_flags() {
        let invocation = Invocation::parse(&argv(&["api", "worker", "--env=staging", "--force"]));
        assert_eq!(invocation.args, vec!["api", "worker"]);
        assert_eq!(invocation.opts.get("env").map(String::as_str), Some("staging"));
        assert!(invocation.has_flag("force"));
    }

    #[test]
    fn dispatch_finds_kind_commands() {
        let registry = CommandRegistry::builtin();
        for name in ["build", "deploy", "run", "test", "logs"] {
            let (command, _) = registry.dispatch(&argv(&[name])).unwrap();
            assert_eq!(command.name(), name);
        }
    }

    #[test]
    fn dispatch_unknown_command_fails() {
        let registry = CommandRegistry::builtin();
        let err = registry.dispatch(&argv(&["teleport", "api"])).unwrap_err();
        assert_eq!(err.code(), "TRL-007");
    }

    #[test]
    fn sync_deploy_is_persistent() {
        let registry = CommandRegistry::builtin();
        let (command, invocation) = registry.dispatch(&argv(&["deploy", "api", "--sync"])).unwrap();
        assert!(command.maybe_persistent(&invocation));

        let (command, invocation) = registry.dispatch(&argv(&["deploy", "api"])).unwrap();
        assert!(!command.maybe_persistent(&invocation));
    }

    #[test]
    fn followed_logs_are_persistent() {
        let registry = CommandRegistry::builtin();
        let (command, invocation) = registry
            .dispatch(&argv(&["logs", "--follow"]))
            .unwrap();
        assert!(command.maybe_persistent(&invocation));
    }

    #[test]
    fn build_is_never_persistent() {
        let registry = CommandRegistry::builtin();
        let (command, invocation) = registry
            .dispatch(&argv(&["build", "api", "--sync"]))
            .unwrap();
        assert!(!command.maybe_persistent(&invocation));
    }
}
