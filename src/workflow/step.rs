//! Workflow steps and drop semantics
//!
//! Steps run in order; a step can be dropped by its `when` clause:
//!
//! - `always` never drops, `never` always drops.
//! - The first run of consecutive `onError` steps after the most recent
//!   error handles that error together; later `onError` runs are dropped.
//! - A default step after an error is dropped unless the error was
//!   handled immediately: an `onError` run directly following the failing
//!   step recovers the workflow for subsequent default steps.

use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::error::TrellisError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepWhen {
    #[default]
    Default,
    Always,
    Never,
    OnError,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Command argv, parsed like a CLI line
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// Shell script, run in the project root
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub when: StepWhen,
    #[serde(default, rename = "envVars")]
    pub env_vars: FxHashMap<String, String>,
}

impl StepConfig {
    /// Step names default to `step-<n>` (1-based)
    pub fn display_name(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("step-{}", index + 1))
    }

    pub fn validate(&self, index: usize) -> Result<(), TrellisError> {
        match (&self.command, &self.script) {
            (Some(_), Some(_)) => Err(TrellisError::configuration(format!(
                "workflow step {} sets both command and script",
                index + 1
            ))),
            (None, None) => Err(TrellisError::configuration(format!(
                "workflow step {} needs either command or script",
                index + 1
            ))),
            _ => Ok(()),
        }
    }
}

/// Errors recorded per step index during a workflow run
pub type StepErrors = FxHashMap<usize, Vec<TrellisError>>;

/// Decide whether step `index` is dropped given the errors seen so far.
pub fn should_be_dropped(index: usize, steps: &[StepConfig], errors: &StepErrors) -> bool {
    match steps[index].when {
        StepWhen::Always => false,
        StepWhen::Never => true,
        StepWhen::OnError => {
            let Some(last_error) = last_error_before(index, errors) else {
                // Nothing to handle
                return true;
            };
            // Walk back to the start of this step's onError run;
            // interleaved `never` steps don't break the run.
            let mut run_start = index;
            while run_start > 0 {
                match steps[run_start - 1].when {
                    StepWhen::OnError => run_start -= 1,
                    StepWhen::Never => run_start -= 1,
                    _ => break,
                }
            }
            let run_start = run_start.max(last_error + 1);
            // The first onError run after the error handles it; a later
            // run finds the error already handled.
            (last_error + 1..run_start).any(|j| steps[j].when == StepWhen::OnError)
        }
        StepWhen::Default => {
            let Some(last_error) = last_error_before(index, errors) else {
                return false;
            };
            // Recovered only when an onError run immediately follows the
            // failing step.
            let mut j = last_error + 1;
            while j < index && steps[j].when == StepWhen::Never {
                j += 1;
            }
            !(j < index && steps[j].when == StepWhen::OnError)
        }
    }
}

fn last_error_before(index: usize, errors: &StepErrors) -> Option<usize> {
    errors
        .keys()
        .copied()
        .filter(|&i| i < index)
        .max()
}
