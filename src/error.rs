// The #[error] attribute from thiserror uses struct fields via string interpolation,
// but Rust's unused_assignments lint doesn't recognize this.
#![allow(unused_assignments)]

//! Trellis Error Types with Error Codes
//!
//! Error code ranges:
//! - TRL-000-009: Configuration errors
//! - TRL-010-019: Schema/validation errors
//! - TRL-020-029: Template string errors
//! - TRL-030-039: Parameter errors
//! - TRL-040-049: Plugin errors
//! - TRL-050-069: Runtime / deployment / build errors
//! - TRL-070-079: Timeout errors
//! - TRL-080-089: Graph errors (dependency aborts)
//! - TRL-090-099: Workflow script / filesystem errors
//! - TRL-100-109: Internal errors (always user-reportable as bugs)

use miette::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TrellisError>;

/// Stable error discriminant. Every `TrellisError` variant maps to exactly
/// one kind; callers branch on this rather than on variant shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Validation,
    TemplateString,
    Parameter,
    Plugin,
    Runtime,
    Deployment,
    Build,
    Timeout,
    Graph,
    WorkflowScript,
    Filesystem,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Configuration => "configuration",
            Self::Validation => "validation",
            Self::TemplateString => "template-string",
            Self::Parameter => "parameter",
            Self::Plugin => "plugin",
            Self::Runtime => "runtime",
            Self::Deployment => "deployment",
            Self::Build => "build",
            Self::Timeout => "timeout",
            Self::Graph => "graph",
            Self::WorkflowScript => "workflow-script",
            Self::Filesystem => "filesystem",
            Self::Internal => "internal",
        };
        write!(f, "{name}")
    }
}

/// One link in a dependency-failure chain. The chain starts at the aborted
/// node and terminates at the node that originally failed.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedDependency {
    /// Node key of the failed dependency
    pub node_key: String,
    /// Message of the original failure at the end of the chain
    pub message: String,
    /// Node keys from the aborted node back to the origin
    pub chain: Vec<String>,
}

impl std::fmt::Display for FailedDependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.chain.join(" ← "), self.message)
    }
}

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

/// All error variants are part of the public API.
///
/// Implements both `thiserror::Error` for std error compatibility
/// and `miette::Diagnostic` for fancy terminal error display.
#[derive(Error, Debug, Diagnostic)]
pub enum TrellisError {
    // ═══════════════════════════════════════════
    // CONFIGURATION ERRORS (000-009)
    // ═══════════════════════════════════════════
    #[error("[TRL-001] Configuration error: {message}")]
    #[diagnostic(code(trellis::configuration))]
    Configuration { message: String },

    #[error(
        "[TRL-002] Action name conflict: two active configs declare '{key}' ({first_path} and {second_path})"
    )]
    #[diagnostic(
        code(trellis::action_conflict),
        help("Rename one action, or set disabled: true on one of them")
    )]
    ActionConflict {
        key: String,
        first_path: String,
        second_path: String,
    },

    #[error("[TRL-003] Unknown action type '{type_name}' on {key}")]
    #[diagnostic(code(trellis::unknown_action_type))]
    UnknownActionType { type_name: String, key: String },

    #[error("[TRL-004] Dependency cycle detected: {cycle}")]
    #[diagnostic(
        code(trellis::cycle_detected),
        help("Remove circular dependencies between your actions")
    )]
    CycleDetected { cycle: String },

    #[error("[TRL-005] Missing action: '{key}' referenced by {referrer} is not in the project")]
    #[diagnostic(code(trellis::missing_action))]
    MissingAction { key: String, referrer: String },

    #[error("[TRL-006] Command '{name}' may run persistently and cannot be used here")]
    #[diagnostic(
        code(trellis::persistent_command),
        help("Persistent commands (watchers, sync deploys) only run from the interactive session")
    )]
    PersistentCommand { name: String },

    #[error("[TRL-007] Unknown command '{name}'")]
    #[diagnostic(code(trellis::unknown_command))]
    UnknownCommand { name: String },

    // ═══════════════════════════════════════════
    // VALIDATION ERRORS (010-019)
    // ═══════════════════════════════════════════
    #[error("[TRL-010] Validation failed at {path}: {message}")]
    #[diagnostic(code(trellis::validation))]
    Validation {
        /// Precise config path, e.g. `spec.ports[2].name`
        path: String,
        message: String,
        /// Caret-marked YAML snippet when a source document was available
        snippet: Option<String>,
    },

    // ═══════════════════════════════════════════
    // TEMPLATE STRING ERRORS (020-029)
    // ═══════════════════════════════════════════
    #[error("[TRL-020] Unable to resolve template expression '${{{expression}}}': tried {}", attempted.join(", "))]
    #[diagnostic(
        code(trellis::template_unresolved),
        help("Check the reference path against the available context keys")
    )]
    TemplateUnresolved {
        expression: String,
        /// Context branches attempted, for diagnostics
        attempted: Vec<String>,
    },

    #[error("[TRL-021] Template parse error at position {position}: {details}")]
    #[diagnostic(code(trellis::template_parse))]
    TemplateParse { position: usize, details: String },

    // ═══════════════════════════════════════════
    // PARAMETER ERRORS (030-039)
    // ═══════════════════════════════════════════
    #[error("[TRL-030] Invalid parameter '{name}': {reason}")]
    #[diagnostic(code(trellis::parameter))]
    Parameter { name: String, reason: String },

    // ═══════════════════════════════════════════
    // PLUGIN ERRORS (040-049)
    // ═══════════════════════════════════════════
    #[error("[TRL-040] Plugin error for {key}: {message}")]
    #[diagnostic(code(trellis::plugin))]
    Plugin { key: String, message: String },

    #[error(
        "[TRL-041] Plugin for {key} mutated non-templatable field '{field}' during configure"
    )]
    #[diagnostic(code(trellis::no_template_mutated))]
    NoTemplateFieldChanged { key: String, field: String },

    // ═══════════════════════════════════════════
    // RUNTIME / DEPLOYMENT / BUILD (050-069)
    // ═══════════════════════════════════════════
    #[error("[TRL-050] Runtime error from provider for {key}: {message}")]
    #[diagnostic(code(trellis::runtime))]
    Runtime { key: String, message: String },

    #[error("[TRL-060] Deployment failed for {key}: {message}")]
    #[diagnostic(code(trellis::deployment))]
    Deployment { key: String, message: String },

    #[error("[TRL-065] Build failed for {key}: {message}")]
    #[diagnostic(code(trellis::build))]
    Build { key: String, message: String },

    // ═══════════════════════════════════════════
    // TIMEOUT ERRORS (070-079)
    // ═══════════════════════════════════════════
    #[error("[TRL-070] Task '{node_key}' timed out after {timeout_secs}s")]
    #[diagnostic(
        code(trellis::timeout),
        help("Increase the action's timeout field or investigate the slow provider call")
    )]
    Timeout { node_key: String, timeout_secs: u64 },

    // ═══════════════════════════════════════════
    // GRAPH ERRORS (080-089)
    // ═══════════════════════════════════════════
    #[error("[TRL-080] Aborted '{node_key}': dependency failed: {failed_dependency}")]
    #[diagnostic(code(trellis::graph_aborted))]
    GraphNode {
        node_key: String,
        failed_dependency: FailedDependency,
    },

    // ═══════════════════════════════════════════
    // WORKFLOW SCRIPT / FILESYSTEM (090-099)
    // ═══════════════════════════════════════════
    #[error("[TRL-090] Script step exited with code {exit_code}: {stderr}")]
    #[diagnostic(code(trellis::workflow_script))]
    WorkflowScript {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("[TRL-095] Filesystem error at {path}: {source}")]
    #[diagnostic(code(trellis::filesystem))]
    Filesystem {
        path: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════
    // INTERNAL ERRORS (100-109)
    // ═══════════════════════════════════════════
    #[error("[TRL-100] Internal error: {message}")]
    #[diagnostic(
        code(trellis::internal),
        help("This is likely a bug in trellis, please report it with the full output")
    )]
    Internal { message: String },
}

impl TrellisError {
    /// Get the error code (e.g., "TRL-001")
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "TRL-001",
            Self::ActionConflict { .. } => "TRL-002",
            Self::UnknownActionType { .. } => "TRL-003",
            Self::CycleDetected { .. } => "TRL-004",
            Self::MissingAction { .. } => "TRL-005",
            Self::PersistentCommand { .. } => "TRL-006",
            Self::UnknownCommand { .. } => "TRL-007",
            Self::Validation { .. } => "TRL-010",
            Self::TemplateUnresolved { .. } => "TRL-020",
            Self::TemplateParse { .. } => "TRL-021",
            Self::Parameter { .. } => "TRL-030",
            Self::Plugin { .. } => "TRL-040",
            Self::NoTemplateFieldChanged { .. } => "TRL-041",
            Self::Runtime { .. } => "TRL-050",
            Self::Deployment { .. } => "TRL-060",
            Self::Build { .. } => "TRL-065",
            Self::Timeout { .. } => "TRL-070",
            Self::GraphNode { .. } => "TRL-080",
            Self::WorkflowScript { .. } => "TRL-090",
            Self::Filesystem { .. } => "TRL-095",
            Self::Internal { .. } => "TRL-100",
        }
    }

    /// Stable discriminant for the error taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. }
            | Self::ActionConflict { .. }
            | Self::UnknownActionType { .. }
            | Self::CycleDetected { .. }
            | Self::MissingAction { .. }
            | Self::PersistentCommand { .. }
            | Self::UnknownCommand { .. } => ErrorKind::Configuration,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::TemplateUnresolved { .. } | Self::TemplateParse { .. } => {
                ErrorKind::TemplateString
            }
            Self::Parameter { .. } => ErrorKind::Parameter,
            Self::Plugin { .. } | Self::NoTemplateFieldChanged { .. } => ErrorKind::Plugin,
            Self::Runtime { .. } => ErrorKind::Runtime,
            Self::Deployment { .. } => ErrorKind::Deployment,
            Self::Build { .. } => ErrorKind::Build,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::GraphNode { .. } => ErrorKind::Graph,
            Self::WorkflowScript { .. } => ErrorKind::WorkflowScript,
            Self::Filesystem { .. } => ErrorKind::Filesystem,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Internal errors print a "likely a bug" banner with the full payload
    pub fn is_internal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Internal)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

impl FixSuggestion for TrellisError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            Self::Configuration { .. } => Some("Check the project configuration file"),
            Self::ActionConflict { .. } => {
                Some("Rename one action or disable one of the two configs")
            }
            Self::UnknownActionType { .. } => {
                Some("Check the action's type field against the configured providers")
            }
            Self::CycleDetected { .. } => Some("Remove circular dependencies between actions"),
            Self::MissingAction { .. } => {
                Some("Add the missing action or fix the dependency reference")
            }
            Self::PersistentCommand { .. } => {
                Some("Run the command from an interactive session instead")
            }
            Self::UnknownCommand { .. } => Some("Check the command name in the workflow step"),
            Self::Validation { .. } => Some("Fix the config value at the reported path"),
            Self::TemplateUnresolved { .. } => {
                Some("Check the reference path: actions.<kind>.<name>.outputs.<key> or var.<name>")
            }
            Self::TemplateParse { .. } => Some("Check ${...} expression syntax"),
            Self::Parameter { .. } => Some("Check CLI arguments and flags"),
            Self::Plugin { .. } | Self::NoTemplateFieldChanged { .. } => {
                Some("The provider returned malformed data, check its version")
            }
            Self::Runtime { .. } => Some("Check the provider's logs for details"),
            Self::Deployment { .. } => Some("Inspect the deploy status with a status-only query"),
            Self::Build { .. } => Some("Inspect the build log for the failing step"),
            Self::Timeout { .. } => Some("Increase the action's timeout field"),
            Self::GraphNode { .. } => {
                Some("Fix the failing dependency at the end of the reported chain")
            }
            Self::WorkflowScript { .. } => Some("Check the script's stderr output"),
            Self::Filesystem { .. } => Some("Check file path and permissions"),
            Self::Internal { .. } => None,
        }
    }
}

impl From<std::io::Error> for TrellisError {
    fn from(source: std::io::Error) -> Self {
        Self::Filesystem {
            path: String::new(),
            source,
        }
    }
}

/// Format an error the way the CLI prints it: message, then fix hint,
/// with the bug banner for internal errors.
pub fn render_error(error: &TrellisError) -> String {
    let mut out = error.to_string();
    if let TrellisError::Validation {
        snippet: Some(snippet),
        ..
    } = error
    {
        out.push('\n');
        out.push_str(snippet);
    }
    if error.is_internal() {
        out.push_str("\n  This is likely a bug in trellis, please report it: include the full output above.");
    } else if let Some(suggestion) = error.fix_suggestion() {
        out.push_str("\n  Fix: ");
        out.push_str(suggestion);
    }
    out
}
