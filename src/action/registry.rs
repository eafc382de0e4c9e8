//! Action registry
//!
//! Holds typed action configs keyed by `kind.name`, resolves config
//! conflicts (disabled entries dedup against active ones), attaches group
//! membership, and assigns execution modes by pattern matching.

use std::sync::Arc;

use camino::Utf8PathBuf;
use globset::{Glob, GlobMatcher};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{Result, TrellisError};
use crate::provider::ProviderRouter;

use super::{ActionConfig, ActionMode, ActionRef};

/// A named collection of actions sharing variables/varfiles
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    #[serde(default = "crate::util::default_object")]
    pub variables: Value,
    #[serde(default)]
    pub varfiles: Vec<Utf8PathBuf>,
}

/// Mode selection patterns from the CLI or environment config:
/// `{sync: [...], local: [...]}`. `local` dominates `sync`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModeSelection {
    #[serde(default)]
    pub sync: Vec<String>,
    #[serde(default)]
    pub local: Vec<String>,
}

struct ModePattern {
    raw: String,
    matcher: Option<GlobMatcher>,
}

impl ModePattern {
    fn new(raw: &str) -> Self {
        let matcher = if raw.contains('*') || raw.contains('?') || raw.contains('[') {
            Glob::new(raw).ok().map(|g| g.compile_matcher())
        } else {
            None
        };
        Self {
            raw: raw.to_string(),
            matcher,
        }
    }

    /// Matches either the full key (`deploy.api`) or the bare name.
    /// Returns whether the hit was an exact (explicit) match.
    fn matches(&self, key: &str, name: &str) -> Option<bool> {
        match &self.matcher {
            None if self.raw == key || self.raw == name => Some(true),
            None => None,
            Some(glob) if glob.is_match(key) || glob.is_match(name) => Some(false),
            Some(_) => None,
        }
    }
}

#[derive(Debug)]
pub struct ActionRegistry {
    actions: FxHashMap<String, Arc<ActionConfig>>,
    groups: FxHashMap<String, Arc<GroupConfig>>,
    modes: FxHashMap<String, ActionMode>,
}

impl ActionRegistry {
    /// Build the registry from raw configs.
    ///
    /// The router, when supplied, is consulted to warn about explicitly
    /// moded actions whose type does not support that mode.
    pub fn build(
        configs: Vec<ActionConfig>,
        groups: Vec<GroupConfig>,
        mode_selection: &ModeSelection,
        router: Option<&ProviderRouter>,
    ) -> Result<Self> {
        let mut actions: FxHashMap<String, Arc<ActionConfig>> = FxHashMap::default();

        for config in configs {
            let key = config.key();
            match actions.get(&key) {
                None => {
                    if !config.disabled {
                        actions.insert(key, Arc::new(config));
                    }
                }
                Some(existing) => {
                    if config.disabled {
                        // Active + disabled: keep the active one
                        continue;
                    }
                    return Err(TrellisError::ActionConflict {
                        key,
                        first_path: config_path(existing),
                        second_path: config_path(&config),
                    });
                }
            }
        }

        let groups: FxHashMap<String, Arc<GroupConfig>> = groups
            .into_iter()
            .map(|g| (g.name.clone(), Arc::new(g)))
            .collect();

        for action in actions.values() {
            if let Some(group_name) = &action.internal.group_name {
                if !groups.contains_key(group_name) {
                    return Err(TrellisError::configuration(format!(
                        "action {} references unknown group '{}'",
                        action.key(),
                        group_name
                    )));
                }
            }
        }

        let sync_patterns: Vec<ModePattern> =
            mode_selection.sync.iter().map(|p| ModePattern::new(p)).collect();
        let local_patterns: Vec<ModePattern> =
            mode_selection.local.iter().map(|p| ModePattern::new(p)).collect();

        let mut modes = FxHashMap::default();
        for (key, action) in &actions {
            // local dominates sync
            let hit = match_mode(&local_patterns, key, &action.name, ActionMode::Local)
                .or_else(|| match_mode(&sync_patterns, key, &action.name, ActionMode::Sync));

            if let Some((mode, explicit)) = hit {
                if explicit {
                    if let Some(router) = router {
                        let supported = router
                            .handler(&action.type_name, key)
                            .map(|h| h.supported_modes().contains(&mode))
                            .unwrap_or(true);
                        if !supported {
                            warn!(
                                action = %key,
                                mode = %mode,
                                "action was explicitly requested in a mode its type does not support"
                            );
                        }
                    }
                }
                modes.insert(key.clone(), mode);
            }
        }

        Ok(Self {
            actions,
            groups,
            modes,
        })
    }

    pub fn get(&self, reference: &ActionRef) -> Result<Arc<ActionConfig>> {
        self.get_by_key(&reference.key(), "request")
    }

    pub fn get_by_key(&self, key: &str, referrer: &str) -> Result<Arc<ActionConfig>> {
        self.actions
            .get(key)
            .cloned()
            .ok_or_else(|| TrellisError::MissingAction {
                key: key.to_string(),
                referrer: referrer.to_string(),
            })
    }

    pub fn group(&self, name: &str) -> Option<Arc<GroupConfig>> {
        self.groups.get(name).cloned()
    }

    /// Mode for an action key; `Default` when nothing matched
    pub fn mode_for(&self, key: &str) -> ActionMode {
        self.modes.get(key).copied().unwrap_or_default()
    }

    pub fn actions(&self) -> impl Iterator<Item = &Arc<ActionConfig>> {
        self.actions.values()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

fn match_mode(
    patterns: &[ModePattern],
    key: &str,
    name: &str,
    mode: ActionMode,
) -> Option<(ActionMode, bool)> {
    let mut hit: Option<bool> = None;
    for pattern in patterns {
        if let Some(explicit) = pattern.matches(key, name) {
            // An exact hit anywhere marks the selection explicit
            hit = Some(hit.unwrap_or(false) || explicit);
        }
    }
    hit.map(|explicit| (mode, explicit))
}

fn config_path(config: &ActionConfig) -> String {
    config
        .internal
        .config_file_path
        .as_ref()
        .map(|p| p.to_string())
        .unwrap_or_else(|| "<unknown>".to_string())
}
