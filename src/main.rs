//! Trellis CLI - typed action orchestrator

use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use colored::Colorize;

use trellis::config::{parse_var_overrides, EnvironmentRef, ProjectConfig};
use trellis::error::{render_error, TrellisError};
use trellis::provider::exec::ExecHandler;
use trellis::provider::ProviderRouter;
use trellis::tree::LocalTreeVersions;
use trellis::Session;

#[derive(Parser)]
#[command(name = "trellis")]
#[command(about = "Trellis - typed action orchestrator for application stacks")]
#[command(version)]
struct Cli {
    /// Project root (defaults to the current directory)
    #[arg(long, global = true)]
    root: Option<Utf8PathBuf>,

    /// Environment to operate in: name[.namespace]
    #[arg(long, global = true)]
    env: Option<String>,

    /// Variable overrides: k=v[,k=v], merged last
    #[arg(long, global = true)]
    var: Vec<String>,

    /// Run handlers even when status reports ready
    #[arg(long, global = true)]
    force: bool,

    /// Assume yes for confirmation prompts
    #[arg(long, global = true)]
    yes: bool,

    /// Log level filter
    #[arg(short = 'l', long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build actions
    Build { names: Vec<String> },
    /// Deploy actions
    Deploy { names: Vec<String> },
    /// Run one-shot actions
    Run { names: Vec<String> },
    /// Test actions
    Test { names: Vec<String> },
    /// Query action status without executing anything
    Status {
        /// Action references, <kind>.<name>
        refs: Vec<String>,
    },
    /// Run a named workflow
    Workflow { name: String },
    /// Validate project configuration and the action graph
    Validate,
}

#[tokio::main]
async fn main() {
    // Load .env file (ignore if not present)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&cli.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if cli.yes {
        tracing::debug!("--yes: confirmation prompts are skipped");
    }

    if let Err(error) = run(cli).await {
        eprintln!("{} {}", "Error:".red().bold(), render_error(&error));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), TrellisError> {
    let root = match cli.root {
        Some(root) => root,
        None => Utf8PathBuf::from_path_buf(std::env::current_dir().map_err(|source| {
            TrellisError::Filesystem {
                path: ".".into(),
                source,
            }
        })?)
        .map_err(|p| TrellisError::configuration(format!("non-UTF8 project path: {p:?}")))?,
    };

    let project = ProjectConfig::load(&root).await?;
    let router = Arc::new(ProviderRouter::new().register(Arc::new(ExecHandler)));
    let session = Session::build(
        project,
        cli.env.as_deref().map(EnvironmentRef::parse),
        router,
        Arc::new(LocalTreeVersions),
        parse_var_overrides(&cli.var)?,
        cli.force,
    )?;

    println!(
        "{} {} in environment {}",
        "→".cyan(),
        session.project.name.cyan().bold(),
        session.environment.name.cyan()
    );

    match cli.command {
        Commands::Build { names } => run_kind(&session, "build", names).await,
        Commands::Deploy { names } => run_kind(&session, "deploy", names).await,
        Commands::Run { names } => run_kind(&session, "run", names).await,
        Commands::Test { names } => run_kind(&session, "test", names).await,
        Commands::Status { refs } => run_status(&session, refs).await,
        Commands::Workflow { name } => run_workflow(&session, &name).await,
        Commands::Validate => {
            println!(
                "{} project '{}' is valid ({} actions)",
                "✓".green(),
                session.project.name,
                session.registry.len()
            );
            Ok(())
        }
    }
}

async fn run_kind(
    session: &Session,
    kind: &str,
    names: Vec<String>,
) -> Result<(), TrellisError> {
    let mut argv = vec![kind.to_string()];
    argv.extend(names);
    let result = session.run_command(&argv).await?;
    print_result(&result.result);
    finish(result.errors)
}

async fn run_status(session: &Session, refs: Vec<String>) -> Result<(), TrellisError> {
    let mut errors = Vec::new();
    for reference in &refs {
        let parsed = trellis::action::ActionRef::parse(reference)?;
        let mut argv = vec![parsed.kind.key_part().to_string()];
        argv.push(parsed.name.clone());
        argv.push("--status-only".to_string());
        let result = session.run_command(&argv).await?;
        print_result(&result.result);
        errors.extend(result.errors);
    }
    finish(errors)
}

async fn run_workflow(session: &Session, name: &str) -> Result<(), TrellisError> {
    let result = session.run_workflow(name, Default::default()).await?;
    print_result(&result.to_value());

    if result.failed() {
        println!(
            "{} workflow '{}' failed ({} step error(s))",
            "✗".red(),
            name,
            result.errors.len()
        );
        return Err(TrellisError::configuration(format!(
            "workflow '{name}' failed"
        )));
    }
    println!("{} workflow '{}' succeeded", "✓".green(), name);
    Ok(())
}

fn print_result(value: &serde_json::Value) {
    if !value.is_null() {
        println!(
            "{}",
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        );
    }
}

fn finish(errors: Vec<TrellisError>) -> Result<(), TrellisError> {
    let mut errors = errors;
    match errors.len() {
        0 => {
            println!("{} Done!", "✓".green());
            Ok(())
        }
        1 => Err(errors.remove(0)),
        n => {
            for error in &errors[1..] {
                eprintln!("{} {}", "Error:".red(), error);
            }
            eprintln!("{} {} errors in total", "✗".red(), n);
            Err(errors.remove(0))
        }
    }
}
