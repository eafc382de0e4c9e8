//! Centralized constants for trellis runtime configuration
//!
//! All timeout and limit values in one place for easy tuning.

use std::time::Duration;

// ═══════════════════════════════════════════════════════════════
// Execution Timeouts
// ═══════════════════════════════════════════════════════════════

/// Timeout for workflow script steps (sh -c)
pub const SCRIPT_TIMEOUT: Duration = Duration::from_secs(600);

/// Default per-task timeout when an action declares none
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(3600);

// ═══════════════════════════════════════════════════════════════
// Solver Limits
// ═══════════════════════════════════════════════════════════════

/// Global ceiling on concurrently dispatched graph nodes
pub const GLOBAL_CONCURRENCY: usize = 64;

/// Concurrent build cap (builds are the heaviest task type)
pub const BUILD_CONCURRENCY: usize = 5;

/// Directory under the project root for trellis-managed files
pub const DOT_DIR: &str = ".trellis";
