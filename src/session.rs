//! Session assembly
//!
//! Wires a loaded project into a runnable unit: registry, action graph,
//! resolver, task factory and solver. The CLI and the workflow runner
//! both go through here; this is also the non-interactive entry point
//! that rejects persistent commands.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::action::graph::ActionGraph;
use crate::action::registry::ActionRegistry;
use crate::command::{CommandContext, CommandRegistry, CommandResult};
use crate::config::{EnvironmentConfig, EnvironmentRef, ProjectConfig};
use crate::error::{Result, TrellisError};
use crate::event::EventLog;
use crate::provider::ProviderRouter;
use crate::resolve::ActionResolver;
use crate::solver::TaskGraphSolver;
use crate::tasks::TaskFactory;
use crate::tree::{CachingTreeVersions, TreeVersionProvider};
use crate::workflow::{WorkflowRunner, WorkflowResult};

pub struct Session {
    pub project: ProjectConfig,
    pub environment: EnvironmentConfig,
    pub registry: Arc<ActionRegistry>,
    pub graph: Arc<ActionGraph>,
    pub factory: Arc<TaskFactory>,
    pub solver: Arc<TaskGraphSolver>,
    pub event_log: EventLog,
    pub force: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("project", &self.project)
            .field("environment", &self.environment)
            .field("force", &self.force)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn build(
        project: ProjectConfig,
        environment: Option<EnvironmentRef>,
        router: Arc<ProviderRouter>,
        tree_versions: Arc<dyn TreeVersionProvider>,
        var_overrides: Value,
        force: bool,
    ) -> Result<Self> {
        let environment = match environment {
            Some(reference) => {
                let mut env = project.environment(&reference.name)?.clone();
                if reference.namespace.is_some() {
                    env.namespace = reference.namespace;
                }
                env
            }
            None => project.environments.first().cloned().unwrap_or(EnvironmentConfig {
                name: "default".into(),
                namespace: None,
                variables: Value::Object(Default::default()),
            }),
        };

        let registry = Arc::new(ActionRegistry::build(
            project.actions.clone(),
            project.groups.clone(),
            &project.modes,
            Some(router.as_ref()),
        )?);

        let graph = Arc::new(ActionGraph::build(Arc::clone(&registry), &router)?);
        graph.validate()?;

        let tree_cache_dir = project.dot_dir().join("tree-versions");
        let resolver = Arc::new(ActionResolver::new(
            Arc::clone(&router),
            Arc::new(CachingTreeVersions::new(tree_versions).with_cache_dir(tree_cache_dir)),
            Arc::clone(&registry),
            environment.clone(),
            project.variables.clone(),
            var_overrides,
        ));

        let event_log = EventLog::new();
        let factory = TaskFactory::new(
            Arc::clone(&graph),
            resolver,
            router,
            event_log.clone(),
        );
        let solver = Arc::new(TaskGraphSolver::new(event_log.clone()));

        Ok(Self {
            project,
            environment,
            registry,
            graph,
            factory,
            solver,
            event_log,
            force,
        })
    }

    pub fn command_context(&self) -> CommandContext {
        CommandContext {
            factory: Arc::clone(&self.factory),
            solver: Arc::clone(&self.solver),
            force: self.force,
        }
    }

    /// Run one command line. This is the non-interactive entry point, so
    /// persistent commands are rejected here as well.
    pub async fn run_command(&self, argv: &[String]) -> Result<CommandResult> {
        let registry = CommandRegistry::builtin();
        let (command, invocation) = registry.dispatch(argv)?;
        if command.maybe_persistent(&invocation) {
            return Err(TrellisError::PersistentCommand {
                name: command.name().to_string(),
            });
        }
        Ok(command.run(&invocation, &self.command_context()).await)
    }

    pub async fn run_workflow(
        &self,
        name: &str,
        secrets: FxHashMap<String, String>,
    ) -> Result<WorkflowResult> {
        let config = self.project.workflow(name)?.clone();
        let runner = WorkflowRunner::new(
            config,
            CommandRegistry::builtin(),
            self.command_context(),
            self.project.root.clone(),
            self.project.dot_dir(),
            secrets,
            self.event_log.clone(),
        );
        runner.run().await
    }
}
